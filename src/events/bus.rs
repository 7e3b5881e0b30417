//! Bounded broadcast bus
//!
//! Every subscriber gets every item published after it joined, in publish
//! order. There is no replay. Each subscriber has its own bounded buffer;
//! what happens when that buffer is full depends on [`OverflowPolicy`].

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Behaviour when a subscriber's buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The publisher waits until the slow subscriber makes room
    #[default]
    Block,
    /// The slow subscriber loses its oldest pending items; the publisher never waits
    DropOldest,
}

enum Fanout<T> {
    Block(Mutex<Vec<mpsc::Sender<T>>>),
    DropOldest(broadcast::Sender<T>),
}

struct BusInner<T> {
    capacity: usize,
    fanout: Fanout<T>,
}

/// Cloneable handle to a broadcast bus
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a bus; a zero capacity is raised to one
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let fanout = match policy {
            OverflowPolicy::Block => Fanout::Block(Mutex::new(Vec::new())),
            OverflowPolicy::DropOldest => Fanout::DropOldest(broadcast::channel(capacity).0),
        };

        Self {
            inner: Arc::new(BusInner { capacity, fanout }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        match self.inner.fanout {
            Fanout::Block(_) => OverflowPolicy::Block,
            Fanout::DropOldest(_) => OverflowPolicy::DropOldest,
        }
    }

    /// Join the bus; only items published from now on are delivered
    pub fn subscribe(&self) -> Subscription<T> {
        match &self.inner.fanout {
            Fanout::Block(senders) => {
                let (tx, rx) = mpsc::channel(self.inner.capacity);
                lock(senders).push(tx);
                Subscription::Blocking(rx)
            }
            Fanout::DropOldest(sender) => Subscription::Lossy {
                receiver: sender.subscribe(),
                dropped: 0,
            },
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        match &self.inner.fanout {
            Fanout::Block(senders) => lock(senders).iter().filter(|s| !s.is_closed()).count(),
            Fanout::DropOldest(sender) => sender.receiver_count(),
        }
    }

    /// Deliver `item` to every current subscriber.
    ///
    /// Under [`OverflowPolicy::Block`] this suspends while any subscriber's
    /// buffer is full. Returns the number of subscribers the item was handed to.
    pub async fn publish(&self, item: T) -> usize {
        match &self.inner.fanout {
            Fanout::Block(senders) => {
                let targets: Vec<mpsc::Sender<T>> = lock(senders).clone();
                let mut delivered = 0;
                for target in &targets {
                    if target.send(item.clone()).await.is_ok() {
                        delivered += 1;
                    }
                }
                if delivered < targets.len() {
                    let mut senders = lock(senders);
                    senders.retain(|s| !s.is_closed());
                    debug!(remaining = senders.len(), "Pruned closed subscribers");
                }
                delivered
            }
            Fanout::DropOldest(sender) => sender.send(item).unwrap_or(0),
        }
    }
}

fn lock<T>(senders: &Mutex<Vec<mpsc::Sender<T>>>) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<T>>> {
    senders.lock().unwrap_or_else(|e| e.into_inner())
}

/// Receiving side of one subscriber
pub enum Subscription<T> {
    Blocking(mpsc::Receiver<T>),
    Lossy {
        receiver: broadcast::Receiver<T>,
        dropped: u64,
    },
}

impl<T: Clone> Subscription<T> {
    /// Next item, or `None` once every bus handle is gone
    pub async fn recv(&mut self) -> Option<T> {
        match self {
            Subscription::Blocking(receiver) => receiver.recv().await,
            Subscription::Lossy { receiver, dropped } => loop {
                match receiver.recv().await {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        *dropped += skipped;
                        warn!(skipped, "Slow subscriber lost its oldest events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Next item if one is already buffered
    pub fn try_recv(&mut self) -> Option<T> {
        match self {
            Subscription::Blocking(receiver) => receiver.try_recv().ok(),
            Subscription::Lossy { receiver, dropped } => loop {
                match receiver.try_recv() {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => *dropped += skipped,
                    Err(_) => return None,
                }
            },
        }
    }

    /// Items this subscriber lost to overflow (always zero under `Block`)
    pub fn dropped(&self) -> u64 {
        match self {
            Subscription::Blocking(_) => 0,
            Subscription::Lossy { dropped, .. } => *dropped,
        }
    }
}
