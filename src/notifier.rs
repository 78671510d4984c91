//! Periodic state-diff notifier
//!
//! A [`Notifier`] owns a set of watch-groups and a set of time-bounded
//! subjects. Each tick it fetches a snapshot per watch-group, classifies it,
//! announces label transitions, and then walks the subjects to send expiry
//! warnings and expire stale ones. One worker task drives the cycle; command
//! handlers share the same instance through cheap clones.

use crate::clock::{Clock, SystemClock};
use crate::errors::{NotifierError, Result};
use crate::fetcher::Fetcher;
use crate::metrics::{NotifierMetrics, NotifierMetricsSnapshot};
use crate::sink::{Audience, Notification, NotificationKind, NotificationSink};
use crate::snapshot::ExternalSnapshot;
use crate::status::{StatusLabel, StatusRecord, Thresholds, activity_text};
use crate::store::PersistenceStore;
use crate::subject::{
    ExpiryHook, LifecycleEvent, LifecyclePolicy, NoopExpiryHook, SubjectRegistry, WatchedSubject,
};

use futures::FutureExt;
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Policy knobs for one notifier instance.
#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub thresholds: Thresholds,
    pub lifecycle: LifecyclePolicy,
    /// Max watch-groups fetched per tick; `None` fetches all of them
    pub fetch_budget: Option<usize>,
    pub max_concurrent_fetches: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            lifecycle: LifecyclePolicy::default(),
            fetch_budget: None,
            max_concurrent_fetches: 4,
        }
    }
}

impl NotifierSettings {
    /// Reject thresholds, lifecycle or limits that cannot work
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate().map_err(NotifierError::Config)?;
        self.lifecycle.validate().map_err(NotifierError::Config)?;
        if self.fetch_budget == Some(0) {
            return Err(NotifierError::Config(
                "fetch budget must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(NotifierError::Config(
                "max_concurrent_fetches must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A polled external key and where its transitions are announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchGroup {
    pub key: String,
    pub audience: Audience,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Keys fetched this tick, in rotation order
    pub polled: Vec<String>,
    /// Keys skipped because the fetch or processing failed
    pub failed: Vec<String>,
    pub transitions: usize,
    pub warnings: usize,
    pub expirations: usize,
    /// The tick observed cancellation and stopped early
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct NotifierState {
    groups: Vec<WatchGroup>,
    records: HashMap<String, StatusRecord>,
    subjects: SubjectRegistry,
    last_served: Option<String>,
}

impl NotifierState {
    /// Pick this tick's watch-groups. With a budget, the cursor resumes
    /// after the last served key and wraps at the end.
    fn next_batch(&mut self, budget: Option<usize>) -> Vec<WatchGroup> {
        let n = self.groups.len();
        let take = match budget {
            None => return self.groups.clone(),
            Some(_) if n == 0 => return Vec::new(),
            Some(b) => b.min(n),
        };

        let start = self
            .last_served
            .as_ref()
            .and_then(|key| self.groups.iter().position(|g| &g.key == key))
            .map(|i| (i + 1) % n)
            .unwrap_or(0);

        let batch: Vec<WatchGroup> = (0..take)
            .map(|i| self.groups[(start + i) % n].clone())
            .collect();

        if let Some(last) = batch.last() {
            self.last_served = Some(last.key.clone());
        }
        batch
    }

    fn remove_group(&mut self, key: &str) -> bool {
        let Some(index) = self.groups.iter().position(|g| g.key == key) else {
            return false;
        };

        // keep the rotation pointing at the group that would have come next
        if self.last_served.as_deref() == Some(key) {
            self.last_served = index
                .checked_sub(1)
                .map(|prev| self.groups[prev].key.clone());
        }

        self.groups.remove(index);
        self.records.remove(key);
        true
    }
}

struct Inner {
    settings: NotifierSettings,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn NotificationSink>,
    store: Arc<dyn PersistenceStore>,
    clock: Arc<dyn Clock>,
    expiry_hook: Arc<dyn ExpiryHook>,
    state: Mutex<NotifierState>,
    tick_lock: Mutex<()>,
    cancel: CancellationToken,
    running: AtomicBool,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    metrics: NotifierMetrics,
}

/// Handle to a notifier; clones share the same instance.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

/// Wires a [`Notifier`] to its collaborators.
pub struct NotifierBuilder {
    settings: NotifierSettings,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn NotificationSink>,
    store: Arc<dyn PersistenceStore>,
    clock: Arc<dyn Clock>,
    expiry_hook: Arc<dyn ExpiryHook>,
}

impl NotifierBuilder {
    /// Replace the default settings
    pub fn settings(mut self, settings: NotifierSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a different time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Side effects to run when a subject expires
    pub fn expiry_hook(mut self, hook: Arc<dyn ExpiryHook>) -> Self {
        self.expiry_hook = hook;
        self
    }

    /// Validate settings and restore persisted subjects.
    pub fn build(self) -> Result<Notifier> {
        self.settings.validate()?;

        let subjects = SubjectRegistry::from_subjects(self.store.load_subjects()?);
        if !subjects.is_empty() {
            info!("Restored {} active subjects", subjects.len());
        }

        Ok(Notifier {
            inner: Arc::new(Inner {
                settings: self.settings,
                fetcher: self.fetcher,
                sink: self.sink,
                store: self.store,
                clock: self.clock,
                expiry_hook: self.expiry_hook,
                state: Mutex::new(NotifierState {
                    subjects,
                    ..NotifierState::default()
                }),
                tick_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                worker: std::sync::Mutex::new(None),
                metrics: NotifierMetrics::new(),
            }),
        })
    }
}

impl Notifier {
    /// Create a new builder with default settings, the system clock and no
    /// expiry side effects
    pub fn builder(
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn NotificationSink>,
        store: Arc<dyn PersistenceStore>,
    ) -> NotifierBuilder {
        NotifierBuilder {
            settings: NotifierSettings::default(),
            fetcher,
            sink,
            store,
            clock: Arc::new(SystemClock),
            expiry_hook: Arc::new(NoopExpiryHook),
        }
    }

    /// Begin the cycle. Returns `false` without spawning anything when a
    /// cycle is already running, the notifier was stopped, or `interval`
    /// is zero.
    pub fn start(&self, interval: Duration) -> bool {
        if self.inner.cancel.is_cancelled() {
            warn!("Notifier was stopped; ignoring start");
            return false;
        }
        if interval.is_zero() {
            warn!("Refusing to start with a zero polling interval");
            return false;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Notifier already running");
            return false;
        }

        let notifier = self.clone();
        let handle = tokio::spawn(async move {
            notifier.run(interval).await;
        });
        *self.inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Notifier started with a {}s interval", interval.as_secs_f64());
        true
    }

    /// Signal the cycle to end. Safe from any task or thread; permanent.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Notifier stop requested");
        }
        self.inner.cancel.cancel();
    }

    /// Stop and wait for the worker task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Notifier worker ended abnormally: {}", e);
            }
        }
    }

    /// Whether a worker task is currently driving the cycle
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    #[instrument(skip(self))]
    async fn run(self, interval: Duration) {
        let _running = RunningGuard(&self.inner.running);

        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(report) => debug!(
                    "Tick polled {} groups ({} failed), {} transitions, {} warnings, {} expirations",
                    report.polled.len(),
                    report.failed.len(),
                    report.transitions,
                    report.warnings,
                    report.expirations
                ),
                Err(panic) => error!(
                    "Tick panicked, continuing with the next one: {}",
                    panic_message(&*panic)
                ),
            }

            if self.inner.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Notifier cycle ended; no further polls scheduled");
    }

    /// Run one cycle: fetch, classify, announce transitions, then apply the
    /// subject lifecycle. Fetch and processing failures are confined to
    /// their watch-group. State changes are committed under the state lock;
    /// expiry hooks and deliveries run after it is released.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let inner = &self.inner;
        let _serial = inner.tick_lock.lock().await;
        let mut report = TickReport::default();

        if inner.cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }
        inner.metrics.record_tick();

        let batch = {
            let mut state = inner.state.lock().await;
            state.next_batch(inner.settings.fetch_budget)
        };

        let fetched: Vec<(WatchGroup, Result<ExternalSnapshot>)> = stream::iter(batch)
            .map(|group| {
                let fetcher = Arc::clone(&inner.fetcher);
                async move {
                    let result = fetcher.fetch(&group.key).await;
                    (group, result)
                }
            })
            .buffered(inner.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        if inner.cancel.is_cancelled() {
            debug!("Cancelled during fetch; discarding {} results", fetched.len());
            report.cancelled = true;
            return report;
        }

        let mut outbox = Outbox::default();
        {
            let mut state = inner.state.lock().await;
            let now = inner.clock.now();

            for (group, result) in fetched {
                report.polled.push(group.key.clone());

                let snapshot = match result {
                    Ok(snapshot) => {
                        inner.metrics.record_fetch(true);
                        snapshot
                    }
                    Err(e) => {
                        inner.metrics.record_fetch(false);
                        warn!("Skipping {} this poll: {}", group.key, e);
                        report.failed.push(group.key);
                        continue;
                    }
                };

                if !state.groups.iter().any(|g| g.key == group.key) {
                    debug!("{} was removed while being fetched", group.key);
                    continue;
                }

                match self.process_group(&mut state, &group, &snapshot, now) {
                    Ok(Some(notification)) => {
                        report.transitions += 1;
                        outbox.messages.push((group.audience, notification));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        inner.metrics.record_group_failure();
                        error!("Failed to process {}; state left unchanged: {}", group.key, e);
                        report.failed.push(group.key);
                    }
                }
            }

            self.apply_lifecycle(&mut state, now, &mut report, &mut outbox);
        }

        // everything committed above is announced
        self.flush(outbox).await;
        report
    }

    /// Classify one snapshot; on a label change persist and commit, and
    /// return the announcement to send.
    fn process_group(
        &self,
        state: &mut NotifierState,
        group: &WatchGroup,
        snapshot: &ExternalSnapshot,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Notification>> {
        let label = self
            .inner
            .settings
            .thresholds
            .classify(snapshot.update_time, now);
        let previous = state.records.get(&group.key).map(|r| r.label);

        let Some(record) = StatusRecord::advance(state.records.get(&group.key), label, now) else {
            debug!("{} still {}", group.key, label);
            return Ok(None);
        };

        self.inner.store.save_status(&group.key, &record)?;
        state.records.insert(group.key.clone(), record);
        self.inner.metrics.record_transition();

        match previous {
            Some(from) => info!("{} changed from {} to {}", group.key, from, label),
            None => info!("{} first observed as {}", group.key, label),
        }

        Ok(Some(transition_notification(
            &group.key, previous, label, snapshot, now,
        )))
    }

    fn apply_lifecycle(
        &self,
        state: &mut NotifierState,
        now: chrono::DateTime<chrono::Utc>,
        report: &mut TickReport,
        outbox: &mut Outbox,
    ) {
        let policy = self.inner.settings.lifecycle;
        let events = state.subjects.evaluate(&policy, now);
        if events.is_empty() {
            return;
        }
        self.persist_subjects(state);

        for event in events {
            let subject_id = event.subject().id.clone();
            let kind = match &event {
                LifecycleEvent::NearingExpiry { .. } => {
                    report.warnings += 1;
                    self.inner.metrics.record_warning();
                    info!("Subject {} is nearing expiry", subject_id);
                    NotificationKind::NearingExpiry
                }
                LifecycleEvent::Expired { subject, .. } => {
                    report.expirations += 1;
                    self.inner.metrics.record_expiration();
                    info!("Subject {} expired", subject_id);
                    outbox.expired.push(subject.clone());
                    NotificationKind::Expired
                }
            };

            let notification =
                Notification::new(subject_id.clone(), kind, event.message(&policy), now);
            outbox.messages.push((Audience::User(subject_id), notification));
        }
    }

    /// Run expiry hooks, then deliver, without holding the state lock.
    async fn flush(&self, outbox: Outbox) {
        for subject in &outbox.expired {
            if let Err(e) = self.inner.expiry_hook.on_expired(subject).await {
                error!("Expiry side effects failed for {}: {}", subject.id, e);
            }
        }

        for (audience, notification) in &outbox.messages {
            self.inner.sink.notify(audience, notification).await;
            self.inner.metrics.record_notification();
        }
    }

    fn persist_subjects(&self, state: &NotifierState) {
        if let Err(e) = self.inner.store.save_subjects(&state.subjects.to_vec()) {
            error!("Failed to persist subjects: {}", e);
        }
    }

    /// Start tracking a subject. Fails if the id is already active.
    pub async fn register(
        &self,
        id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<WatchedSubject> {
        let mut state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let subject = state.subjects.register(id, metadata, now)?.clone();
        self.persist_subjects(&state);
        info!("Registered subject {}", id);
        Ok(subject)
    }

    /// Restart a subject's active window and clear its warning.
    pub async fn renew(&self, id: &str) -> Result<WatchedSubject> {
        let mut state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let subject = state.subjects.renew(id, now)?.clone();
        self.persist_subjects(&state);
        info!("Renewed subject {}", id);
        Ok(subject)
    }

    /// Stop tracking a subject; absent ids are not an error.
    pub async fn remove(&self, id: &str) -> Option<WatchedSubject> {
        let mut state = self.inner.state.lock().await;
        let removed = state.subjects.remove(id);
        if removed.is_some() {
            self.persist_subjects(&state);
            info!("Removed subject {}", id);
        }
        removed
    }

    /// Look up an active subject
    pub async fn subject(&self, id: &str) -> Option<WatchedSubject> {
        self.inner.state.lock().await.subjects.get(id).cloned()
    }

    /// Active subjects in registration order
    pub async fn subjects(&self) -> Vec<WatchedSubject> {
        self.inner.state.lock().await.subjects.to_vec()
    }

    /// Human-readable listing of active subjects
    pub async fn roster(&self) -> String {
        self.inner.state.lock().await.subjects.roster()
    }

    /// Begin polling `key`. A previously persisted status is restored so an
    /// unchanged label is not announced again.
    pub async fn add_watch_group(&self, key: &str, audience: Audience) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.groups.iter().any(|g| g.key == key) {
            return Err(NotifierError::AlreadyExists(key.to_string()));
        }

        match self.inner.store.load_status(key) {
            Ok(Some(record)) => {
                debug!("Restored {} as {} since {}", key, record.label, record.since);
                state.records.insert(key.to_string(), record);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load stored status for {}: {}", key, e),
        }

        state.groups.push(WatchGroup {
            key: key.to_string(),
            audience,
        });
        info!("Watching {}", key);
        Ok(())
    }

    /// Stop polling `key` and forget its status. Returns whether it was watched.
    pub async fn remove_watch_group(&self, key: &str) -> bool {
        let removed = self.inner.state.lock().await.remove_group(key);
        if removed {
            info!("Stopped watching {}", key);
        }
        removed
    }

    /// Watched groups in the order they were added
    pub async fn watch_groups(&self) -> Vec<WatchGroup> {
        self.inner.state.lock().await.groups.clone()
    }

    /// Current status record for a watched key
    pub async fn status(&self, key: &str) -> Option<StatusRecord> {
        self.inner.state.lock().await.records.get(key).cloned()
    }

    /// `"{label} for {elapsed}"` for a watched key.
    pub async fn describe_status(&self, key: &str) -> Result<String> {
        let record = self
            .status(key)
            .await
            .ok_or_else(|| NotifierError::NotFound(key.to_string()))?;
        Ok(record.describe(self.inner.clock.now()))
    }

    /// Get current metrics
    pub fn stats(&self) -> NotifierMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

/// Work produced under the state lock and carried out after it is dropped.
#[derive(Default)]
struct Outbox {
    messages: Vec<(Audience, Notification)>,
    expired: Vec<WatchedSubject>,
}

/// Clears the running flag however the worker exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

fn transition_notification(
    key: &str,
    from: Option<StatusLabel>,
    to: StatusLabel,
    snapshot: &ExternalSnapshot,
    now: chrono::DateTime<chrono::Utc>,
) -> Notification {
    let activity = activity_text(to, snapshot);
    let text = match from {
        Some(from) => format!("{} is now {} (was {}): {}", key, to, from, activity),
        None => format!("{} is {}: {}", key, to, activity),
    };

    Notification::new(
        key.to_string(),
        NotificationKind::Transition {
            from,
            to,
            presence: to.presence(),
            activity,
        },
        text,
        now,
    )
    .with_color(to.color())
}
