//! Broadcast fan-out.
//!
//! Broadcasts are fire-and-forget: the emitter never waits and never learns
//! whether anyone listened. Subscribers register for exact channel names and
//! receive every broadcast on them through an unbounded channel.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Sink for broadcasts emitted by workers and the service supervisor.
pub trait BroadcastSink: Send + Sync {
    fn emit(&self, channel: &str, data: Value);
}

/// A delivered broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub channel: String,
    pub data: Value,
    pub timestamp_ms: i64,
}

/// Subscription receipt for managing subscriptions.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub channels: Vec<String>,
}

#[derive(Debug)]
struct Subscriber {
    id: String,
    tx: mpsc::UnboundedSender<Broadcast>,
}

/// Statistics about broadcast traffic.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub broadcasts_emitted: u64,
    pub deliveries: u64,
    pub active_subscribers: usize,
}

/// In-memory broadcast fan-out keyed by channel name.
#[derive(Debug, Default)]
pub struct Broadcaster {
    /// channel -> subscribers
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    stats: Mutex<BroadcastStats>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to channels.
    ///
    /// Returns (subscription handle, receiver channel) for receiving broadcasts.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        channels: Vec<String>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Broadcast>) {
        let subscriber_id = subscriber_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.subscribers.write();
        for channel in &channels {
            subscribers
                .entry(channel.clone())
                .or_default()
                .push(Subscriber {
                    id: subscriber_id.clone(),
                    tx: tx.clone(),
                });
        }
        self.stats.lock().active_subscribers = subscribers.values().map(Vec::len).sum();

        tracing::debug!(subscriber = %subscriber_id, ?channels, "broadcast subscriber registered");

        (
            Subscription {
                id: subscriber_id,
                channels,
            },
            rx,
        )
    }

    /// Unsubscribe from every channel of the subscription.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.write();
        for channel in &subscription.channels {
            if let Some(subs) = subscribers.get_mut(channel) {
                subs.retain(|s| s.id != subscription.id);
            }
        }
        subscribers.retain(|_, subs| !subs.is_empty());
        self.stats.lock().active_subscribers = subscribers.values().map(Vec::len).sum();

        tracing::debug!(subscriber = %subscription.id, "broadcast subscriber removed");
    }

    /// Publish a broadcast to every subscriber of its channel.
    ///
    /// Subscribers whose receiver was dropped are pruned. Returns the number
    /// of deliveries.
    pub fn publish(&self, broadcast: Broadcast) -> usize {
        let mut delivered = 0;
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            if let Some(subs) = subscribers.get(&broadcast.channel) {
                for subscriber in subs {
                    if subscriber.tx.send(broadcast.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed = true;
                    }
                }
            }
        }

        if closed {
            let mut subscribers = self.subscribers.write();
            if let Some(subs) = subscribers.get_mut(&broadcast.channel) {
                subs.retain(|s| !s.tx.is_closed());
            }
            subscribers.retain(|_, subs| !subs.is_empty());
            self.stats.lock().active_subscribers = subscribers.values().map(Vec::len).sum();
        }

        let mut stats = self.stats.lock();
        stats.broadcasts_emitted += 1;
        stats.deliveries += delivered as u64;
        drop(stats);

        tracing::trace!(channel = %broadcast.channel, delivered, "broadcast published");
        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.lock().clone()
    }
}

impl BroadcastSink for Broadcaster {
    fn emit(&self, channel: &str, data: Value) {
        self.publish(Broadcast {
            channel: channel.to_string(),
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
    }
}
