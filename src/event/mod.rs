use crate::entity::EntityId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;

pub mod sensors;
mod validation;

pub use validation::{validate_name, ValidationError};

/// Immutable record of an attribute change or an event-sensor emission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Entity that produced the event
    pub source: EntityId,

    /// Sensor name (e.g. "movable.container")
    pub sensor: String,

    /// New attribute value, or the emitted payload
    pub value: Value,

    /// Emission time
    pub timestamp: DateTime<Utc>,
}

impl SensorEvent {
    pub fn new(source: EntityId, sensor: impl Into<String>, value: Value) -> Self {
        Self {
            source,
            sensor: sensor.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Decode the value as `T`; `None` when it does not fit the type.
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.value.clone()).ok()
    }

    pub fn is<S: Sensor>(&self, sensor: &S) -> bool {
        self.sensor == sensor.name()
    }
}

/// Whether a sensor keeps a current value or only emits transient events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorKind {
    Attribute,
    Event,
}

/// A typed, named attribute or event channel.
pub trait Sensor {
    type Value: Serialize + DeserializeOwned;

    fn name(&self) -> &str;
    fn kind(&self) -> SensorKind;
}

/// Sensor whose current value is stored on the entity (nullable).
pub struct AttributeSensor<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeSensor<T> {
    /// Declare a sensor with a compile-time name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    /// Declare a sensor with a runtime name, validating it.
    pub fn named(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name: Cow::Owned(name),
            _marker: PhantomData,
        })
    }
}

impl<T: Serialize + DeserializeOwned> Sensor for AttributeSensor<T> {
    type Value = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Attribute
    }
}

impl<T> Clone for AttributeSensor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AttributeSensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeSensor").field(&self.name).finish()
    }
}

/// Sensor with no stored value, only transient emissions.
pub struct EventSensor<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EventSensor<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    pub fn named(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name: Cow::Owned(name),
            _marker: PhantomData,
        })
    }
}

impl<T: Serialize + DeserializeOwned> Sensor for EventSensor<T> {
    type Value = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Event
    }
}

impl<T> Clone for EventSensor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for EventSensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSensor").field(&self.name).finish()
    }
}
