use crate::entity::EntityId;
use crate::event::{Sensor, SensorEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which producers a subscription listens to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceFilter {
    Entity(EntityId),
    Any,
}

/// Which sensors a subscription listens to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SensorFilter {
    Named(String),
    Any,
}

impl SensorFilter {
    pub fn of<S: Sensor>(sensor: &S) -> Self {
        SensorFilter::Named(sensor.name().to_string())
    }
}

/// Receives events on the subscriber's own delivery task.
///
/// Handlers run one at a time per subscriber, in queue order. A handler may
/// call back into the graph (including operations that publish); those
/// events are queued, never delivered re-entrantly.
pub trait SensorEventListener: Send + Sync {
    fn on_event(&self, event: &SensorEvent);
}

impl<F> SensorEventListener for F
where
    F: Fn(&SensorEvent) + Send + Sync,
{
    fn on_event(&self, event: &SensorEvent) {
        self(event)
    }
}

/// A registered interest of one subscriber
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber: EntityId,
    pub source: SourceFilter,
    pub sensor: SensorFilter,
    pub(crate) handler: Arc<dyn SensorEventListener>,
}

impl Subscription {
    pub(crate) fn index_key(&self) -> (SourceFilter, SensorFilter) {
        (self.source.clone(), self.sensor.clone())
    }

    pub fn matches(&self, event: &SensorEvent) -> bool {
        let source_ok = match &self.source {
            SourceFilter::Entity(id) => *id == event.source,
            SourceFilter::Any => true,
        };
        let sensor_ok = match &self.sensor {
            SensorFilter::Named(name) => *name == event.sensor,
            SensorFilter::Any => true,
        };
        source_ok && sensor_ok
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber", &self.subscriber)
            .field("source", &self.source)
            .field("sensor", &self.sensor)
            .finish()
    }
}
