//! Fetched observations of external state

use crate::errors::{NotifierError, Result};
use crate::status::format_clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One observation of a watch-group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExternalSnapshot {
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    /// Time of the last confirmed-good update reported by the remote side
    pub update_time: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
}

impl ExternalSnapshot {
    pub fn new(key: String, update_time: DateTime<Utc>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            key,
            fetched_at,
            update_time,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: String) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Build a snapshot from a decoded server-status document.
    ///
    /// The game host occupies a player slot itself; `discount_host_player`
    /// removes it from both counts.
    pub fn from_server_status(
        key: &str,
        payload: ServerStatusPayload,
        fetched_at: DateTime<Utc>,
        discount_host_player: bool,
    ) -> Result<Self> {
        let update_time = payload.data.update_time.to_datetime().map_err(|e| {
            NotifierError::fetch(key, format!("invalid data.updateTime: {}", e))
        })?;

        let (players, max_players) = if discount_host_player {
            (
                payload.players.saturating_sub(1),
                payload.max_players.saturating_sub(1),
            )
        } else {
            (payload.players, payload.max_players)
        };

        let mission_time =
            Duration::try_from_secs_f64(payload.data.uptime.max(0.0)).unwrap_or(Duration::ZERO);

        Ok(ExternalSnapshot::new(key.to_string(), update_time, fetched_at)
            .with_attribute("server_name", payload.server_name)
            .with_attribute("mission", payload.mission_name)
            .with_attribute("map", payload.map)
            .with_attribute("players", format!("{}/{}", players, max_players))
            .with_attribute("mission_time", format_clock(mission_time)))
    }
}

/// Status document served by the game-server status endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusPayload {
    pub server_name: String,
    pub mission_name: String,
    #[serde(default)]
    pub map: String,
    pub players: u32,
    pub max_players: u32,
    /// Time the status document itself was written
    #[serde(default)]
    pub update_time: Option<RemoteTimestamp>,
    pub data: ServerStatusData,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusData {
    pub update_time: RemoteTimestamp,
    /// Mission uptime in seconds
    #[serde(default)]
    pub uptime: f64,
}

/// Either an RFC 3339 string or seconds since the Unix epoch.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RemoteTimestamp {
    Text(String),
    Seconds(f64),
}

impl RemoteTimestamp {
    pub fn to_datetime(&self) -> std::result::Result<DateTime<Utc>, String> {
        match self {
            RemoteTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| format!("{:?}: {}", text, e)),
            RemoteTimestamp::Seconds(secs) => {
                if !secs.is_finite() || *secs < 0.0 {
                    return Err(format!("{} is not a valid epoch time", secs));
                }
                let whole = secs.trunc() as i64;
                let nanos = (secs.fract() * 1e9) as u32;
                DateTime::from_timestamp(whole, nanos)
                    .ok_or_else(|| format!("{} is out of range", secs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(json: &str) -> ServerStatusPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_decode_rfc3339_payload() {
        let p = payload(
            r#"{
                "serverName": "Hoggit GAW",
                "missionName": "Georgia at War",
                "map": "Caucasus",
                "players": 13,
                "maxPlayers": 33,
                "updateTime": "2024-03-01T17:59:50Z",
                "data": { "updateTime": "2024-03-01T17:59:45Z", "uptime": 3725.4 }
            }"#,
        );
        let fetched_at = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();

        let snapshot = ExternalSnapshot::from_server_status("gaw", p, fetched_at, true).unwrap();

        assert_eq!(snapshot.key, "gaw");
        assert_eq!(
            snapshot.update_time,
            Utc.with_ymd_and_hms(2024, 3, 1, 17, 59, 45).unwrap()
        );
        assert_eq!(snapshot.attributes["players"], "12/32");
        assert_eq!(snapshot.attributes["mission"], "Georgia at War");
        assert_eq!(snapshot.attributes["mission_time"], "1:02:05");
    }

    #[test]
    fn test_decode_epoch_payload_without_discount() {
        let p = payload(
            r#"{
                "serverName": "PGAW",
                "missionName": "Persian Gulf at War",
                "players": 0,
                "maxPlayers": 0,
                "data": { "updateTime": 1709315985 }
            }"#,
        );
        let fetched_at = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();

        let snapshot = ExternalSnapshot::from_server_status("pgaw", p, fetched_at, false).unwrap();
        assert_eq!(snapshot.update_time.timestamp(), 1709315985);
        assert_eq!(snapshot.attributes["players"], "0/0");
        assert_eq!(snapshot.attributes["map"], "");
    }

    #[test]
    fn test_host_discount_saturates() {
        let p = payload(
            r#"{"serverName":"s","missionName":"m","players":0,"maxPlayers":0,
                "data":{"updateTime":0}}"#,
        );
        let snapshot = ExternalSnapshot::from_server_status("s", p, Utc::now(), true).unwrap();
        assert_eq!(snapshot.attributes["players"], "0/0");
    }

    #[test]
    fn test_bad_timestamp_is_fetch_error() {
        let p = payload(
            r#"{"serverName":"s","missionName":"m","players":1,"maxPlayers":2,
                "data":{"updateTime":"yesterday"}}"#,
        );
        let err = ExternalSnapshot::from_server_status("s", p, Utc::now(), true).unwrap_err();
        assert!(matches!(err, NotifierError::Fetch { ref key, .. } if key == "s"));
    }
}
