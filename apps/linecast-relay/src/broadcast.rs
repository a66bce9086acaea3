use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use linecast_core::ChannelId;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::protocol::{Envelope, Outbound};

pub const DEFAULT_DEDUPE_WINDOW: usize = 100;

/// Bounded FIFO set of recently seen transaction ids.
///
/// Strict FIFO: a re-seen id does not move to the back of the queue,
/// so the eviction order depends only on first insertion.
pub struct DedupeCache {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.seen.contains(tx_id)
    }

    /// Insert `tx_id` if unseen; returns false if it was already held.
    /// Evicts the oldest entry once the bound is exceeded.
    pub fn check_and_insert(&mut self, tx_id: &str) -> bool {
        if self.seen.contains(tx_id) {
            return false;
        }
        self.order.push_back(tx_id.to_string());
        self.seen.insert(tx_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Forget an id that was inserted but never reached a subscriber.
    fn forget(&mut self, tx_id: &str) {
        if self.seen.remove(tx_id) {
            self.order.retain(|id| id != tx_id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of a publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered(usize),
    Duplicate,
    NoSubscribers,
    InvalidInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub subscriber_count: usize,
    pub online: bool,
}

struct Member {
    channel_id: String,
    tx: UnboundedSender<Outbound>,
}

struct BroadcasterInner {
    /// channel id -> connection ids currently subscribed.
    channels: HashMap<String, HashSet<String>>,
    /// connection id -> its one membership and outbound queue.
    members: HashMap<String, Member>,
    dedupe: DedupeCache,
}

/// Maintains channel membership and fans envelopes out to the current
/// subscriber set, at most once per transaction id.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    inner: Arc<Mutex<BroadcasterInner>>,
}

impl ChannelBroadcaster {
    pub fn new(dedupe_window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcasterInner {
                channels: HashMap::new(),
                members: HashMap::new(),
                dedupe: DedupeCache::new(dedupe_window),
            })),
        }
    }

    /// Subscribe a connection to a channel. A connection holds exactly
    /// one membership; re-subscribing moves it.
    pub fn subscribe(
        &self,
        connection_id: &str,
        channel_id: &ChannelId,
        tx: UnboundedSender<Outbound>,
    ) {
        let mut inner = self.inner.lock();
        detach_member(&mut inner, connection_id);
        inner
            .channels
            .entry(channel_id.as_str().to_string())
            .or_default()
            .insert(connection_id.to_string());
        inner.members.insert(
            connection_id.to_string(),
            Member {
                channel_id: channel_id.as_str().to_string(),
                tx,
            },
        );
        debug!(connection_id, channel = %channel_id, "subscribed");
    }

    /// Remove a connection's membership. Safe to call repeatedly.
    pub fn unsubscribe(&self, connection_id: &str) {
        let mut inner = self.inner.lock();
        detach_member(&mut inner, connection_id);
    }

    /// Deliver `envelope` to every current subscriber of `channel_id`.
    ///
    /// The tx id is inserted into the dedupe cache before membership is
    /// consulted, so a second publish racing this one always observes
    /// the duplicate. An id that found no subscribers is forgotten
    /// again, since nothing was delivered and a retry after a
    /// subscription should succeed.
    pub fn publish(&self, channel_id: &str, envelope: Envelope) -> DeliveryResult {
        // Only the addressing fields are validated here; the payload
        // itself is opaque to the broadcaster.
        if envelope.tx_id.trim().is_empty()
            || envelope.event_type.trim().is_empty()
            || channel_id.trim().is_empty()
            || envelope.channel_id.trim().is_empty()
        {
            counter!("linecast_publish_total", 1, "outcome" => "invalid_input");
            return DeliveryResult::InvalidInput;
        }

        let recipients: Vec<UnboundedSender<Outbound>> = {
            let mut inner = self.inner.lock();
            if !inner.dedupe.check_and_insert(&envelope.tx_id) {
                counter!("linecast_publish_total", 1, "outcome" => "duplicate");
                return DeliveryResult::Duplicate;
            }
            let subscriber_ids = match inner.channels.get(channel_id) {
                Some(set) if !set.is_empty() => set.clone(),
                _ => {
                    inner.dedupe.forget(&envelope.tx_id);
                    counter!("linecast_publish_total", 1, "outcome" => "no_subscribers");
                    return DeliveryResult::NoSubscribers;
                }
            };
            subscriber_ids
                .iter()
                .filter_map(|id| inner.members.get(id).map(|member| member.tx.clone()))
                .collect()
        };

        // Point-in-time snapshot; individual receipt is not confirmed.
        let delivered = recipients.len();
        for tx in recipients {
            let _ = tx.send(Outbound::Event(envelope.clone()));
        }
        counter!("linecast_publish_total", 1, "outcome" => "delivered");
        debug!(
            tx_id = %envelope.tx_id,
            channel = channel_id,
            count = delivered,
            "envelope delivered"
        );
        DeliveryResult::Delivered(delivered)
    }

    /// Point-in-time channel status. Pure read.
    pub fn status(&self, channel_id: &str) -> ChannelStatus {
        let inner = self.inner.lock();
        let subscriber_count = inner
            .channels
            .get(channel_id)
            .map(|set| set.len())
            .unwrap_or(0);
        ChannelStatus {
            subscriber_count,
            online: subscriber_count > 0,
        }
    }
}

fn detach_member(inner: &mut BroadcasterInner, connection_id: &str) {
    if let Some(member) = inner.members.remove(connection_id) {
        let mut drop_channel = false;
        if let Some(set) = inner.channels.get_mut(&member.channel_id) {
            set.remove(connection_id);
            drop_channel = set.is_empty();
        }
        // Membership vanishes when the last subscriber leaves.
        if drop_channel {
            inner.channels.remove(&member.channel_id);
        }
    }
}
