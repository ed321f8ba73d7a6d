//! Task consumers: the user-provided execution side of the engine.
//!
//! A consumer implements two phases. `build_payload` turns the stored
//! parameter bag into a typed payload and is where malformed or missing
//! parameters are rejected; `consume` performs the work. Both phases fail
//! through [`ConsumerError`] and both count as a failed attempt for retry
//! purposes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::types::{GroupId, TaskId};

/// Errors raised while building a payload or executing it.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Payload construction failed.
    #[error("failed to build payload: {0}")]
    BuildPayload(String),

    /// A required property is absent.
    #[error("missing property: {0}")]
    MissingProperty(String),

    /// A property is present but has the wrong shape.
    #[error("invalid property '{property}': {reason}")]
    InvalidProperty { property: String, reason: String },

    /// The work itself failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// No consumer is registered under the requested type tag.
    #[error("unknown consumer type: {0}")]
    UnknownConsumer(String),
}

/// The properties handed to a consumer at fire time: the task's identity
/// plus the parameter bag captured when the task was scheduled.
#[derive(Debug, Clone)]
pub struct TaskProperties {
    pub group_id: GroupId,
    pub task_id: TaskId,
    /// The scheduled fire instant being served.
    pub fire_time: DateTime<Utc>,
    parameters: Map<String, Value>,
}

impl TaskProperties {
    pub fn new(
        group_id: GroupId,
        task_id: TaskId,
        fire_time: DateTime<Utc>,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            group_id,
            task_id,
            fire_time,
            parameters,
        }
    }

    /// Raw parameter lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Required string parameter.
    pub fn string(&self, key: &str) -> Result<String, ConsumerError> {
        let value = self
            .parameters
            .get(key)
            .ok_or_else(|| ConsumerError::MissingProperty(key.to_string()))?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConsumerError::InvalidProperty {
                property: key.to_string(),
                reason: format!("expected string, got {}", value),
            })
    }

    /// Optional string parameter.
    pub fn string_opt(&self, key: &str) -> Result<Option<String>, ConsumerError> {
        match self.parameters.get(key) {
            None => Ok(None),
            Some(_) => self.string(key).map(Some),
        }
    }

    /// Required integer parameter.
    pub fn integer(&self, key: &str) -> Result<i64, ConsumerError> {
        let value = self
            .parameters
            .get(key)
            .ok_or_else(|| ConsumerError::MissingProperty(key.to_string()))?;
        value
            .as_i64()
            .ok_or_else(|| ConsumerError::InvalidProperty {
                property: key.to_string(),
                reason: format!("expected integer, got {}", value),
            })
    }

    /// Required boolean parameter.
    pub fn boolean(&self, key: &str) -> Result<bool, ConsumerError> {
        let value = self
            .parameters
            .get(key)
            .ok_or_else(|| ConsumerError::MissingProperty(key.to_string()))?;
        value
            .as_bool()
            .ok_or_else(|| ConsumerError::InvalidProperty {
                property: key.to_string(),
                reason: format!("expected boolean, got {}", value),
            })
    }

    /// Typed deserialization of the whole parameter bag.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_value(Value::Object(self.parameters.clone()))
            .map_err(|e| ConsumerError::BuildPayload(e.to_string()))
    }
}

/// A typed task consumer.
///
/// Implementors define a payload type, how to build it from the stored
/// properties, and how to execute it. `consume` returns an optional output
/// string captured into the audit record's log column.
#[async_trait]
pub trait TaskConsumer: Send + Sync {
    type Payload: Send;

    /// Parse and validate the stored properties into a typed payload.
    fn build_payload(&self, properties: &TaskProperties) -> Result<Self::Payload, ConsumerError>;

    /// Execute the payload.
    async fn consume(&self, payload: Self::Payload) -> Result<Option<String>, ConsumerError>;
}

/// Object-safe wrapper over [`TaskConsumer`] so the registry can hold
/// consumers with different payload types behind one trait object.
#[async_trait]
pub trait ConsumerRunner: Send + Sync {
    async fn run(&self, properties: TaskProperties) -> Result<Option<String>, ConsumerError>;
}

#[async_trait]
impl<C: TaskConsumer> ConsumerRunner for C {
    async fn run(&self, properties: TaskProperties) -> Result<Option<String>, ConsumerError> {
        let payload = self.build_payload(&properties)?;
        self.consume(payload).await
    }
}

/// Registry mapping consumer-type tags to runners.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn ConsumerRunner>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under a type tag, replacing any previous
    /// registration for the same tag.
    pub fn register<C>(&mut self, consumer_type: impl Into<String>, consumer: C)
    where
        C: TaskConsumer + 'static,
    {
        self.consumers
            .insert(consumer_type.into(), Arc::new(consumer));
    }

    /// Resolve a runner by type tag.
    pub fn resolve(&self, consumer_type: &str) -> Result<Arc<dyn ConsumerRunner>, ConsumerError> {
        self.consumers
            .get(consumer_type)
            .cloned()
            .ok_or_else(|| ConsumerError::UnknownConsumer(consumer_type.to_string()))
    }

    /// Whether a consumer is registered under the tag.
    pub fn contains(&self, consumer_type: &str) -> bool {
        self.consumers.contains_key(consumer_type)
    }

    /// Registered type tags, sorted.
    pub fn consumer_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.consumers.keys().cloned().collect();
        types.sort();
        types
    }
}
