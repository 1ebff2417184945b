//! Bounded publish/subscribe queues.
//!
//! Each subscriber owns a bounded mpsc queue. A published message goes to the first live
//! subscriber (in registration order) whose filter matches its channel, so a message is
//! consumed at most once and all messages for one channel land in one queue in publish order.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{InboundMessage, OutboundMessage};

/// Behaviour when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Discard the message being published.
    #[default]
    DropNewest,
    /// Wait up to the given duration for room, then discard.
    Wait(Duration),
}

/// Outcome of a publish. None of these are errors for the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// A subscriber matched but its queue stayed full.
    Dropped,
    /// No live subscriber matched.
    Unrouted,
}

/// Which channels a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFilter {
    Any,
    Channel(String),
}

impl ChannelFilter {
    pub fn channel(id: impl Into<String>) -> Self {
        ChannelFilter::Channel(id.into())
    }

    fn matches(&self, channel: &str) -> bool {
        match self {
            ChannelFilter::Any => true,
            ChannelFilter::Channel(c) => c == channel,
        }
    }
}

/// Messages the bus can route.
pub trait Routed: Send + 'static {
    fn channel(&self) -> &str;
}

impl Routed for InboundMessage {
    fn channel(&self) -> &str {
        &self.channel
    }
}

impl Routed for OutboundMessage {
    fn channel(&self) -> &str {
        &self.channel
    }
}

struct Subscriber<T> {
    filter: ChannelFilter,
    tx: mpsc::Sender<T>,
}

struct Topic<T> {
    name: &'static str,
    subscribers: RwLock<Vec<Subscriber<T>>>,
}

impl<T: Routed> Topic<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn subscribe(&self, filter: ChannelFilter, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Ok(mut subs) = self.subscribers.write() {
            subs.retain(|s| !s.tx.is_closed());
            subs.push(Subscriber { filter, tx });
        }
        Subscription { rx }
    }

    fn route(&self, channel: &str) -> Option<mpsc::Sender<T>> {
        let subs = self.subscribers.read().ok()?;
        subs.iter()
            .find(|s| !s.tx.is_closed() && s.filter.matches(channel))
            .map(|s| s.tx.clone())
    }

    async fn publish(&self, msg: T, policy: BackpressurePolicy) -> Delivery {
        let channel = msg.channel().to_string();
        let Some(tx) = self.route(&channel) else {
            log::debug!("bus: no {} subscriber for channel {}", self.name, channel);
            return Delivery::Unrouted;
        };
        match policy {
            BackpressurePolicy::DropNewest => match tx.try_send(msg) {
                Ok(()) => Delivery::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("bus: {} queue full for channel {}, dropping message", self.name, channel);
                    Delivery::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("bus: {} subscriber for {} closed", self.name, channel);
                    Delivery::Unrouted
                }
            },
            BackpressurePolicy::Wait(limit) => {
                match tokio::time::timeout(limit, tx.send(msg)).await {
                    Ok(Ok(())) => Delivery::Queued,
                    Ok(Err(_)) => Delivery::Unrouted,
                    Err(_) => {
                        log::warn!(
                            "bus: {} queue for channel {} still full after {:?}, dropping message",
                            self.name,
                            channel,
                            limit
                        );
                        Delivery::Dropped
                    }
                }
            }
        }
    }
}

/// Receiving end of a bus subscription.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Next message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; later publishes route past this subscriber.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Shared bus. Construct once at startup and pass by `Arc`.
pub struct MessageBus {
    inbound: Topic<InboundMessage>,
    outbound: Topic<OutboundMessage>,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(256, BackpressurePolicy::DropNewest)
    }
}

impl MessageBus {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            inbound: Topic::new("inbound"),
            outbound: Topic::new("outbound"),
            capacity,
            policy,
        }
    }

    pub fn subscribe_inbound(&self, filter: ChannelFilter) -> Subscription<InboundMessage> {
        self.inbound.subscribe(filter, self.capacity)
    }

    pub fn subscribe_outbound(&self, filter: ChannelFilter) -> Subscription<OutboundMessage> {
        self.outbound.subscribe(filter, self.capacity)
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> Delivery {
        self.inbound.publish(msg, self.policy).await
    }

    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Delivery {
        self.outbound.publish(msg, self.policy).await
    }
}

/// Drain a subscription, handing each message to `handler` in order.
///
/// Each call runs in its own task so an error or panic is logged and the loop moves on.
pub fn spawn_dispatcher<T, F, Fut>(
    name: impl Into<String>,
    mut sub: Subscription<T>,
    handler: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let fut = handler(msg);
            match tokio::spawn(fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("{}: handler failed: {}", name, e),
                Err(e) => log::error!("{}: handler panicked: {}", name, e),
            }
        }
        log::debug!("{}: subscription closed", name);
    })
}
