use crate::entity::EntityId;
use crate::event::SensorEvent;
use crate::subscription::config::BusConfig;
use crate::subscription::protocol::{
    SensorEventListener, SensorFilter, SourceFilter, Subscription, SubscriptionId,
};
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// One queued handler invocation
struct Delivery {
    subscription: SubscriptionId,
    handler: Arc<dyn SensorEventListener>,
    event: SensorEvent,
}

/// Ordered delivery queue of a single subscriber, drained by its own task
struct SubscriberQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    /// False until the subscriber entity is managed
    live: bool,
    /// Deliveries enqueued but not yet picked up
    backlog: Arc<AtomicUsize>,
}

/// Counts deliveries that are queued or running, across all subscribers
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Publish/subscribe bus for sensor events.
///
/// Each subscriber owns one unbounded queue and one delivery task, so events
/// from a given source reach it in publish order and a slow handler only
/// delays its own subscriber. `publish` enqueues and returns.
pub struct EventBus {
    /// Subscription records by id
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,

    /// (source filter, sensor filter) -> subscriptions, for O(1) dispatch
    index: DashMap<(SourceFilter, SensorFilter), Vec<SubscriptionId>>,

    /// Per-subscriber delivery queues
    queues: DashMap<EntityId, SubscriberQueue>,

    in_flight: Arc<InFlight>,
    next_id: AtomicU64,
    closed: AtomicBool,
    runtime: Handle,
    config: BusConfig,
}

impl EventBus {
    /// Create a bus whose delivery tasks run on `runtime`
    pub fn new(runtime: Handle, config: BusConfig) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            index: DashMap::new(),
            queues: DashMap::new(),
            in_flight: Arc::new(InFlight::default()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            runtime,
            config,
        }
    }

    /// Register interest in future events. No history is replayed.
    ///
    /// `live` is false while the subscriber is not yet managed; its
    /// subscriptions stay dormant until [`EventBus::activate_subscriber`].
    pub fn subscribe(
        &self,
        subscriber: EntityId,
        source: SourceFilter,
        sensor: SensorFilter,
        handler: Arc<dyn SensorEventListener>,
        live: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let subscription = Subscription {
            id,
            subscriber,
            source,
            sensor,
            handler,
        };

        self.ensure_queue(subscriber, live);
        self.index
            .entry(subscription.index_key())
            .or_default()
            .push(id);

        debug!(
            subscription = %id,
            subscriber = %subscriber,
            source = ?subscription.source,
            sensor = ?subscription.sensor,
            "Subscribed"
        );
        self.subscriptions.insert(id, subscription);

        id
    }

    /// Remove a subscription. Deliveries already queued for it are skipped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(&id) else {
            return false;
        };

        let key = subscription.index_key();
        let now_empty = match self.index.get_mut(&key) {
            Some(mut ids) => {
                ids.retain(|existing| *existing != id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove_if(&key, |_, ids| ids.is_empty());
        }

        debug!(subscription = %id, subscriber = %subscription.subscriber, "Unsubscribed");
        true
    }

    /// Make a subscriber's subscriptions live
    pub fn activate_subscriber(&self, subscriber: EntityId) {
        if let Some(mut queue) = self.queues.get_mut(&subscriber) {
            queue.live = true;
        }
    }

    /// Drop every subscription sourced on, or owned by, `entity`
    pub fn prune(&self, entity: EntityId) -> usize {
        let doomed: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|s| s.subscriber == entity || s.source == SourceFilter::Entity(entity))
            .map(|s| s.id)
            .collect();

        let count = doomed.len();
        for id in doomed {
            self.unsubscribe(id);
        }

        // Dropping the sender ends the delivery task once its buffer drains
        self.queues.remove(&entity);

        if count > 0 {
            debug!(entity_id = %entity, pruned = count, "Pruned subscriptions");
        }
        count
    }

    /// Enqueue an event for every matching live subscription
    pub fn publish(&self, event: SensorEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        let keys = [
            (
                SourceFilter::Entity(event.source),
                SensorFilter::Named(event.sensor.clone()),
            ),
            (SourceFilter::Entity(event.source), SensorFilter::Any),
            (SourceFilter::Any, SensorFilter::Named(event.sensor.clone())),
            (SourceFilter::Any, SensorFilter::Any),
        ];

        // Collect ids first so no index guard is held while touching other maps
        let mut targets: Vec<SubscriptionId> = Vec::new();
        for key in &keys {
            if let Some(ids) = self.index.get(key) {
                targets.extend(ids.iter().copied());
            }
        }
        if targets.is_empty() {
            return;
        }
        // Stable order so a subscriber with several matching subscriptions
        // always sees them in the same sequence
        targets.sort_unstable();

        for id in targets {
            let (subscriber, handler) = match self.subscriptions.get(&id) {
                Some(s) => (s.subscriber, s.handler.clone()),
                None => continue,
            };
            let Some(queue) = self.queues.get(&subscriber) else {
                continue;
            };
            if !queue.live {
                continue;
            }

            self.in_flight.enter();
            let depth = queue.backlog.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                subscription: id,
                handler,
                event: event.clone(),
            };
            if queue.tx.send(delivery).is_err() {
                queue.backlog.fetch_sub(1, Ordering::SeqCst);
                self.in_flight.exit();
                continue;
            }

            if depth == self.config.queue_warn_threshold {
                warn!(
                    subscriber = %subscriber,
                    backlog = depth,
                    "Subscriber queue is falling behind"
                );
            }
        }
    }

    /// Wait until no delivery is queued or running.
    ///
    /// Handlers that publish keep the bus busy, so this returns only once a
    /// cascade has fully settled.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting events and drop all subscriptions and queues
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let subscriptions = self.subscriptions.len();
        self.subscriptions.clear();
        self.index.clear();
        self.queues.clear();
        info!(subscriptions = subscriptions, "Event bus shut down");
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Subscriptions owned by `subscriber`
    pub fn subscriptions_of(&self, subscriber: EntityId) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.subscriber == subscriber)
            .map(|s| s.value().clone())
            .collect();
        subs.sort_by_key(|s| s.id);
        subs
    }

    pub fn is_live(&self, subscriber: EntityId) -> bool {
        self.queues.get(&subscriber).map_or(false, |q| q.live)
    }

    fn ensure_queue(&self, subscriber: EntityId, live: bool) {
        let mut queue = self.queues.entry(subscriber).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let backlog = Arc::new(AtomicUsize::new(0));
            self.runtime.spawn(run_delivery_queue(
                subscriber,
                rx,
                self.subscriptions.clone(),
                backlog.clone(),
                self.in_flight.clone(),
            ));
            SubscriberQueue {
                tx,
                live: false,
                backlog,
            }
        });
        if live {
            queue.live = true;
        }
    }
}

/// Drain one subscriber's queue, invoking handlers in order
async fn run_delivery_queue(
    subscriber: EntityId,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    subscriptions: Arc<DashMap<SubscriptionId, Subscription>>,
    backlog: Arc<AtomicUsize>,
    in_flight: Arc<InFlight>,
) {
    while let Some(delivery) = rx.recv().await {
        backlog.fetch_sub(1, Ordering::SeqCst);

        if subscriptions.contains_key(&delivery.subscription) {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                delivery.handler.on_event(&delivery.event)
            }));
            if outcome.is_err() {
                error!(
                    subscriber = %subscriber,
                    subscription = %delivery.subscription,
                    sensor = %delivery.event.sensor,
                    "Subscription handler panicked, continuing with next event"
                );
            }
        }

        in_flight.exit();
    }

    debug!(subscriber = %subscriber, "Delivery queue closed");
}
