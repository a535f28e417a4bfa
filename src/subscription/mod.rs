// Event bus: per-subscriber ordered delivery of sensor events

pub mod config;
pub mod manager;
pub mod protocol;

pub use config::BusConfig;
pub use manager::EventBus;
pub use protocol::{
    SensorEventListener, SensorFilter, SourceFilter, Subscription, SubscriptionId,
};
