//! Periodic State-Diff Notifier Library
//!
//! Polls external state for a set of watch-groups, classifies it into a
//! health label, announces label transitions, and tracks time-bounded
//! subjects that are warned and then expired when not renewed.

pub mod clock;
pub mod config;
pub mod errors;
pub mod fetcher;
pub mod metrics;
pub mod notifier;
pub mod sink;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod subject;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use errors::{NotifierError, Result};
pub use fetcher::{Fetcher, HttpStatusFetcher};
pub use notifier::{Notifier, NotifierBuilder, NotifierSettings, TickReport, WatchGroup};
pub use sink::{Audience, LogSink, MemorySink, Notification, NotificationKind, NotificationSink, WebhookSink};
pub use snapshot::ExternalSnapshot;
pub use status::{StatusLabel, StatusRecord, Thresholds};
pub use store::{JsonFileStore, MemoryStore, PersistenceStore};
pub use subject::{ExpiryHook, LifecyclePolicy, WatchedSubject};
