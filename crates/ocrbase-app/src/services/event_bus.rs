//! Per-job ordered event fan-out.
//!
//! Each channel is a ref-counted `broadcast` sender held in a registry.
//! `subscribe` is synchronous under the registry lock, so once it returns
//! the subscriber is guaranteed to observe subsequent publishes; callers
//! read their job snapshot only after that point. Dropping a
//! [`BusSubscription`] releases its reference; the last release removes
//! the channel. The bus retains no history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::pipeline::events::JobEvent;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus registry is poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum BusRecvError {
    #[error("event channel closed")]
    Closed,
}

struct ChannelEntry {
    sender: broadcast::Sender<JobEvent>,
    subscribers: usize,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, ChannelEntry>,
}

/// In-process event bus. Cheap to clone; all clones share one registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every subscriber currently bound to `channel`.
    /// Publishing to a channel with no subscribers is a no-op; the job
    /// store remains the source of truth for terminal state.
    pub fn publish(&self, channel: &str, event: JobEvent) -> Result<usize, BusError> {
        debug_assert!(!channel.is_empty());
        let registry = self.registry.lock().map_err(|_| BusError::Poisoned)?;
        match registry.channels.get(channel) {
            Some(entry) => Ok(entry.sender.send(event).unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Bind to a channel. Readiness is the return of this call: any event
    /// published after `subscribe` returns will be observed.
    pub fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        debug_assert!(!channel.is_empty());
        let mut registry = self.registry.lock().map_err(|_| BusError::Poisoned)?;
        let entry = registry
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                ChannelEntry {
                    sender,
                    subscribers: 0,
                }
            });
        entry.subscribers += 1;
        let receiver = entry.sender.subscribe();
        Ok(BusSubscription {
            channel: channel.to_string(),
            receiver,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Number of live channels, for tests and introspection.
    pub fn channel_count(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.channels.len())
            .unwrap_or(0)
    }

    fn release(registry: &Arc<Mutex<Registry>>, channel: &str) {
        let Ok(mut registry) = registry.lock() else {
            return;
        };
        let remove = match registry.channels.get_mut(channel) {
            Some(entry) => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            None => false,
        };
        if remove {
            registry.channels.remove(channel);
        }
    }
}

/// One subscriber's handle on a channel. Dropping it releases the shared
/// upstream subscription.
pub struct BusSubscription {
    channel: String,
    receiver: broadcast::Receiver<JobEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl BusSubscription {
    /// Receive the next event. A slow subscriber that lags behind the
    /// channel capacity skips to the oldest retained event rather than
    /// failing; callers needing stronger guarantees reconcile against a
    /// job snapshot.
    pub async fn recv(&mut self) -> Result<JobEvent, BusRecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusRecvError::Closed),
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        EventBus::release(&self.registry, &self.channel);
    }
}
