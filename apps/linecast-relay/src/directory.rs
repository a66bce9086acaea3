use std::time::Duration;

use dashmap::DashMap;
use linecast_core::ChannelId;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

/// A display is reported online while its last heartbeat is younger
/// than this.
pub const ONLINE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRecord {
    pub display_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub online: bool,
}

#[derive(Debug, Clone)]
struct StoredDisplay {
    name: String,
    channel_id: Option<ChannelId>,
    registered_at: OffsetDateTime,
    last_seen: OffsetDateTime,
}

impl StoredDisplay {
    fn record(&self, display_id: &str, now: OffsetDateTime, window: Duration) -> DisplayRecord {
        DisplayRecord {
            display_id: display_id.to_string(),
            name: self.name.clone(),
            channel_id: self.channel_id.clone(),
            registered_at: self.registered_at,
            last_seen: self.last_seen,
            online: now - self.last_seen <= window,
        }
    }
}

/// Inventory of known displays. Liveness is derived from heartbeat age
/// at read time, never stored.
pub trait DisplayDirectory: Send + Sync {
    fn register(&self, name: &str, channel_id: Option<ChannelId>) -> DisplayRecord;
    fn heartbeat(&self, display_id: &str) -> Option<DisplayRecord>;
    fn list(&self) -> Vec<DisplayRecord>;
}

pub struct InMemoryDirectory {
    displays: DashMap<String, StoredDisplay>,
    online_window: Duration,
}

impl InMemoryDirectory {
    pub fn new(online_window: Duration) -> Self {
        Self {
            displays: DashMap::new(),
            online_window,
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new(ONLINE_WINDOW)
    }
}

impl DisplayDirectory for InMemoryDirectory {
    fn register(&self, name: &str, channel_id: Option<ChannelId>) -> DisplayRecord {
        let display_id = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        let stored = StoredDisplay {
            name: name.to_string(),
            channel_id,
            registered_at: now,
            last_seen: now,
        };
        let record = stored.record(&display_id, now, self.online_window);
        self.displays.insert(display_id.clone(), stored);
        debug!(%display_id, name, "display registered");
        record
    }

    fn heartbeat(&self, display_id: &str) -> Option<DisplayRecord> {
        let now = OffsetDateTime::now_utc();
        let mut stored = self.displays.get_mut(display_id)?;
        stored.last_seen = now;
        Some(stored.record(display_id, now, self.online_window))
    }

    fn list(&self) -> Vec<DisplayRecord> {
        let now = OffsetDateTime::now_utc();
        let mut records: Vec<DisplayRecord> = self
            .displays
            .iter()
            .map(|entry| entry.value().record(entry.key(), now, self.online_window))
            .collect();
        records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_display_starts_online() {
        let directory = InMemoryDirectory::default();
        let channel = ChannelId::parse("acme:line-1").ok();
        let record = directory.register("dock door 3", channel);
        assert!(record.online);
        assert_eq!(record.name, "dock door 3");

        let listed = directory.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].display_id, record.display_id);
    }

    #[test]
    fn heartbeat_refreshes_liveness() {
        let directory = InMemoryDirectory::new(Duration::from_millis(40));
        let record = directory.register("dock door 3", None);

        std::thread::sleep(Duration::from_millis(60));
        assert!(!directory.list()[0].online, "stale display reported online");

        let refreshed = directory.heartbeat(&record.display_id).unwrap();
        assert!(refreshed.online);
        assert!(directory.list()[0].online);
    }

    #[test]
    fn heartbeat_for_unknown_display_is_none() {
        let directory = InMemoryDirectory::default();
        assert!(directory.heartbeat("nope").is_none());
    }
}
