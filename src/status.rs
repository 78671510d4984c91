//! Status classification and the persisted per-group status record

use crate::clock::elapsed_since;
use crate::snapshot::ExternalSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusLabel {
    Online,
    Unhealthy,
    Offline,
}

impl std::fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusLabel::Online => write!(f, "Online"),
            StatusLabel::Unhealthy => write!(f, "Unhealthy"),
            StatusLabel::Offline => write!(f, "Offline"),
        }
    }
}

impl StatusLabel {
    /// Embed colour used by chat front-ends.
    pub fn color(&self) -> u32 {
        match self {
            StatusLabel::Online => 0x05E400,
            StatusLabel::Unhealthy => 0xFF9700,
            StatusLabel::Offline => 0xFF0000,
        }
    }

    pub fn presence(&self) -> Presence {
        match self {
            StatusLabel::Online => Presence::Online,
            StatusLabel::Unhealthy => Presence::Idle,
            StatusLabel::Offline => Presence::DoNotDisturb,
        }
    }
}

/// Bot presence mirroring a watch-group's health.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Presence {
    Online,
    Idle,
    DoNotDisturb,
}

/// Age bands for classification. `soft` must be strictly below `hard`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thresholds {
    pub soft: Duration,
    pub hard: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(30),
            hard: Duration::from_secs(60),
        }
    }
}

impl Thresholds {
    pub fn new(soft: Duration, hard: Duration) -> Self {
        Self { soft, hard }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.soft >= self.hard {
            return Err(format!(
                "soft threshold ({}s) must be below hard threshold ({}s)",
                self.soft.as_secs(),
                self.hard.as_secs()
            ));
        }
        Ok(())
    }

    /// Classify by the age of the last confirmed-good observation.
    /// Each band includes its lower bound.
    pub fn classify(&self, update_time: DateTime<Utc>, now: DateTime<Utc>) -> StatusLabel {
        let age = elapsed_since(update_time, now);
        if age < self.soft {
            StatusLabel::Online
        } else if age < self.hard {
            StatusLabel::Unhealthy
        } else {
            StatusLabel::Offline
        }
    }
}

/// Last classified label of a watch-group and when it began.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRecord {
    pub label: StatusLabel,
    pub since: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(label: StatusLabel, since: DateTime<Utc>) -> Self {
        Self { label, since }
    }

    /// The record that should replace `previous` after observing `label`,
    /// or `None` when the label is unchanged.
    pub fn advance(
        previous: Option<&StatusRecord>,
        label: StatusLabel,
        now: DateTime<Utc>,
    ) -> Option<StatusRecord> {
        match previous {
            Some(record) if record.label == label => None,
            _ => Some(StatusRecord::new(label, now)),
        }
    }

    pub fn describe(&self, now: DateTime<Utc>) -> String {
        format!(
            "{} for {}",
            self.label,
            format_elapsed(elapsed_since(self.since, now))
        )
    }
}

/// Presence activity line for a label and the snapshot it came from.
pub fn activity_text(label: StatusLabel, snapshot: &ExternalSnapshot) -> String {
    let players = snapshot
        .attributes
        .get("players")
        .map(|p| p.split('/').next().unwrap_or(p).to_string())
        .unwrap_or_else(|| "?".to_string());
    let mission = snapshot
        .attributes
        .get("mission")
        .cloned()
        .unwrap_or_else(|| snapshot.key.clone());
    let game = format!("{} players on {}", players, mission);

    match label {
        StatusLabel::Online => game,
        StatusLabel::Unhealthy => format!("Slow updates - {}", game),
        StatusLabel::Offline => "Server offline".to_string(),
    }
}

/// `"{h} hours {m} minutes {s} seconds"`, hours counted in total.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{} hours {} minutes {} seconds", hours, minutes, seconds)
}

/// `H:MM:SS`
pub fn format_clock(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
