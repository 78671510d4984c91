//! Time-bounded subjects and their expiry lifecycle

use crate::clock::elapsed_since;
use crate::errors::{NotifierError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// A registered session tracked for expiry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WatchedSubject {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    /// Whether the expiry warning was already sent for the current activation
    pub warned: bool,
    pub metadata: HashMap<String, String>,
}

impl WatchedSubject {
    pub fn new(id: String, metadata: HashMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_refreshed_at: now,
            warned: false,
            metadata,
        }
    }

    fn roster_line(&self) -> String {
        let frequency = self
            .metadata
            .get("frequency")
            .map(String::as_str)
            .unwrap_or("no frequency");
        let remarks = self
            .metadata
            .get("remarks")
            .filter(|r| !r.trim().is_empty())
            .map(String::as_str)
            .unwrap_or("No remarks");
        format!("{} ({}) - {}", self.id, frequency, remarks)
    }
}

/// How long a subject stays active and when it is warned.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub max_active: Duration,
    pub warn_before: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_active: Duration::from_secs(30 * 60),
            warn_before: Duration::from_secs(5 * 60),
        }
    }
}

impl LifecyclePolicy {
    pub fn new(max_active: Duration, warn_before: Duration) -> Self {
        Self {
            max_active,
            warn_before,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_active.is_zero() {
            return Err("max active duration must be greater than 0".to_string());
        }
        if self.warn_before >= self.max_active {
            return Err("warning lead time must be shorter than the max active duration".to_string());
        }
        Ok(())
    }

    /// Inactivity after which the warning fires.
    pub fn warn_after(&self) -> Duration {
        self.max_active.saturating_sub(self.warn_before)
    }
}

/// Outcome of evaluating one subject against the policy.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    NearingExpiry {
        subject: WatchedSubject,
        remaining: Duration,
    },
    Expired {
        subject: WatchedSubject,
        active_for: Duration,
    },
}

impl LifecycleEvent {
    pub fn subject(&self) -> &WatchedSubject {
        match self {
            LifecycleEvent::NearingExpiry { subject, .. } => subject,
            LifecycleEvent::Expired { subject, .. } => subject,
        }
    }

    pub fn message(&self, policy: &LifecyclePolicy) -> String {
        match self {
            LifecycleEvent::NearingExpiry { remaining, .. } => format!(
                "You have been active for {}, in {} you will be automatically expired. \
                 Renew to continue for another {}.",
                humanize(policy.max_active.saturating_sub(*remaining)),
                humanize(*remaining),
                humanize(policy.max_active)
            ),
            LifecycleEvent::Expired { active_for, .. } => format!(
                "{} duration achieved after {} without renewal. Expiring.",
                humanize(policy.max_active),
                humanize(*active_for)
            ),
        }
    }
}

fn humanize(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

/// Side effects run when a subject expires, such as revoking a role.
#[async_trait]
pub trait ExpiryHook: Send + Sync {
    async fn on_expired(&self, subject: &WatchedSubject) -> Result<()>;
}

/// Hook that does nothing.
#[derive(Debug, Default)]
pub struct NoopExpiryHook;

#[async_trait]
impl ExpiryHook for NoopExpiryHook {
    async fn on_expired(&self, _subject: &WatchedSubject) -> Result<()> {
        Ok(())
    }
}

/// Active subjects in registration order.
#[derive(Clone, Debug, Default)]
pub struct SubjectRegistry {
    subjects: Vec<WatchedSubject>,
}

impl SubjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted subjects; later duplicates of an id are dropped.
    pub fn from_subjects(subjects: Vec<WatchedSubject>) -> Self {
        let mut registry = Self::new();
        for subject in subjects {
            if registry.get(&subject.id).is_none() {
                registry.subjects.push(subject);
            } else {
                debug!("Dropping duplicate persisted subject {}", subject.id);
            }
        }
        registry
    }

    pub fn register(
        &mut self,
        id: &str,
        metadata: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<&WatchedSubject> {
        if self.get(id).is_some() {
            return Err(NotifierError::AlreadyExists(id.to_string()));
        }
        self.subjects
            .push(WatchedSubject::new(id.to_string(), metadata, now));
        Ok(&self.subjects[self.subjects.len() - 1])
    }

    pub fn renew(&mut self, id: &str, now: DateTime<Utc>) -> Result<&WatchedSubject> {
        let subject = self
            .subjects
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| NotifierError::NotFound(id.to_string()))?;

        // never move the refresh time backwards
        if now > subject.last_refreshed_at {
            subject.last_refreshed_at = now;
        }
        subject.warned = false;
        Ok(&*subject)
    }

    pub fn remove(&mut self, id: &str) -> Option<WatchedSubject> {
        let index = self.subjects.iter().position(|s| s.id == id)?;
        Some(self.subjects.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&WatchedSubject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchedSubject> {
        self.subjects.iter()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn to_vec(&self) -> Vec<WatchedSubject> {
        self.subjects.clone()
    }

    /// Apply the policy at `now`: expired subjects are removed, subjects
    /// inside the warning window are marked warned. Each subject yields
    /// at most one event.
    pub fn evaluate(&mut self, policy: &LifecyclePolicy, now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let mut kept = Vec::with_capacity(self.subjects.len());

        for mut subject in self.subjects.drain(..) {
            let inactive = elapsed_since(subject.last_refreshed_at, now);

            if inactive >= policy.max_active {
                events.push(LifecycleEvent::Expired {
                    subject,
                    active_for: inactive,
                });
                continue;
            }

            if inactive >= policy.warn_after() && !subject.warned {
                subject.warned = true;
                events.push(LifecycleEvent::NearingExpiry {
                    subject: subject.clone(),
                    remaining: policy.max_active - inactive,
                });
            }

            kept.push(subject);
        }

        self.subjects = kept;
        events
    }

    /// Human-readable listing of active subjects.
    pub fn roster(&self) -> String {
        if self.subjects.is_empty() {
            return "No subjects currently active.".to_string();
        }
        let mut response = "Currently active:\n".to_string();
        for subject in &self.subjects {
            response.push_str(&subject.roster_line());
            response.push('\n');
        }
        response
    }
}
