//! Channel abstractions for state management
//!
//! A channel is a named slot of state with a merge policy. The scheduler groups
//! one superstep's writes per channel, in deterministic task order, and hands
//! them to [`Channel::update`] in a single call.
//!
//! | Channel | Policy | Used for |
//! |---------|--------|----------|
//! | [`LastValueChannel`] | overwrite, last writer wins | plain state keys, trigger channels |
//! | [`BinaryOperatorChannel`] | accumulate through an associative reducer | lists, counters |
//! | [`TopicChannel`] | collect values until consumed | dynamic `Send` work items |
//! | [`NamedBarrierValueChannel`] | available once every named writer wrote | join edges |

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

/// Base trait for all channels
///
/// Channels are typed state containers that manage how state is stored,
/// updated, and checkpointed. Different channel types provide different
/// semantics for handling concurrent updates.
pub trait Channel: Send + Sync + Debug {
    /// Get the current value of the channel
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the channel has never been updated
    fn get(&self) -> Result<Value>;

    /// Update the channel with the ordered writes of one superstep
    ///
    /// Returns `true` if the channel was updated, `false` otherwise.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Serializable representation of the channel's state, `None` when empty
    fn checkpoint(&self) -> Option<Value>;

    /// Restore the channel from a checkpoint
    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()>;

    /// Check if the channel has a value (is not empty)
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Notify the channel that a subscribed task ran
    ///
    /// Returns `true` if the channel was updated, `false` otherwise.
    fn consume(&mut self) -> bool {
        false
    }

    /// Clone the channel into a Box
    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

fn empty_channel() -> CheckpointError {
    CheckpointError::Invalid("Channel is empty".to_string())
}

/// LastValue channel - stores only the latest value
///
/// When several tasks write in the same superstep, the last write in task
/// order wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastValueChannel {
    value: Option<Value>,
}

impl LastValueChannel {
    /// Create a new LastValue channel
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Create a new LastValue channel with an initial value
    pub fn with_value(value: Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or_else(empty_channel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.into_iter().last() {
            Some(value) => {
                self.value = Some(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Topic channel - collects values until a subscriber consumes them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicChannel {
    values: Vec<Value>,
}

impl TopicChannel {
    /// Create a new Topic channel
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Get all accumulated values
    pub fn get_all(&self) -> &[Value] {
        &self.values
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<Value> {
        if self.values.is_empty() {
            return Err(empty_channel());
        }
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.values.extend(values);
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        if self.values.is_empty() {
            None
        } else {
            Some(Value::Array(self.values.clone()))
        }
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        if let Value::Array(arr) = checkpoint {
            self.values = arr;
            Ok(())
        } else {
            Err(CheckpointError::Invalid(
                "Topic channel checkpoint must be an array".to_string(),
            ))
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn consume(&mut self) -> bool {
        if self.values.is_empty() {
            false
        } else {
            self.values.clear();
            true
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Reducer function type for BinaryOperator channel
///
/// Must be associative and order-respecting: `reduce(reduce(a, b), c)` equals
/// `reduce(a, reduce(b, c))` and the left operand is always the older value.
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// BinaryOperator channel - folds every write into the current value
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<Value>,
    reducer: ReducerFn,
}

impl BinaryOperatorChannel {
    /// Create a new BinaryOperator channel with a custom reducer
    pub fn new<F>(reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self::from_reducer(Arc::new(reducer))
    }

    /// Create a channel around a shared reducer
    pub fn from_reducer(reducer: ReducerFn) -> Self {
        Self {
            value: None,
            reducer,
        }
    }

    /// Seed the channel with an initial value
    pub fn with_initial(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Create a sum reducer (for numbers)
    pub fn sum() -> Self {
        Self::from_reducer(reducers::sum())
    }

    /// Create an append reducer (for arrays)
    pub fn append() -> Self {
        Self::from_reducer(reducers::append())
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("reducer", &"<function>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or_else(empty_channel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }

        for value in values {
            self.value = Some(match self.value.take() {
                Some(current) => (self.reducer)(current, value),
                None => value,
            });
        }
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// NamedBarrierValue channel - available once every expected name has written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBarrierValueChannel {
    names: BTreeSet<String>,
    seen: BTreeSet<String>,
}

impl NamedBarrierValueChannel {
    /// Create a new NamedBarrierValue channel with expected names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            seen: BTreeSet::new(),
        }
    }
}

impl Channel for NamedBarrierValueChannel {
    fn get(&self) -> Result<Value> {
        if self.seen != self.names {
            return Err(CheckpointError::Invalid(
                "Not all barrier values received yet".to_string(),
            ));
        }
        Ok(Value::Null)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut updated = false;

        for value in values {
            let Some(name) = value.as_str() else {
                return Err(CheckpointError::Invalid(
                    "NamedBarrierValue expects string values".to_string(),
                ));
            };
            if !self.names.contains(name) {
                return Err(CheckpointError::Invalid(format!(
                    "Value '{}' not in expected names",
                    name
                )));
            }
            updated |= self.seen.insert(name.to_string());
        }

        Ok(updated)
    }

    fn checkpoint(&self) -> Option<Value> {
        if self.seen.is_empty() {
            None
        } else {
            Some(serde_json::json!(self.seen))
        }
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        let Some(arr) = checkpoint.as_array() else {
            return Err(CheckpointError::Invalid(
                "NamedBarrierValue checkpoint must be an array".to_string(),
            ));
        };
        self.seen = arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .filter(|name| self.names.contains(name))
            .collect();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.seen == self.names
    }

    fn consume(&mut self) -> bool {
        if self.seen == self.names {
            self.seen.clear();
            true
        } else {
            false
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Stock reducers for [`BinaryOperatorChannel`]
pub mod reducers {
    use super::ReducerFn;
    use serde_json::Value;
    use std::sync::Arc;

    /// List concatenation; scalars are treated as one-element lists
    pub fn append() -> ReducerFn {
        Arc::new(|a, b| {
            let mut result = match a {
                Value::Array(arr) => arr,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            match b {
                Value::Array(arr) => result.extend(arr),
                Value::Null => {}
                other => result.push(other),
            }
            Value::Array(result)
        })
    }

    /// Numeric addition, integer-preserving when both sides are integers
    pub fn sum() -> ReducerFn {
        Arc::new(|a, b| match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Value::from(x.saturating_add(y)),
            _ => {
                let x = a.as_f64().unwrap_or(0.0);
                let y = b.as_f64().unwrap_or(0.0);
                serde_json::Number::from_f64(x + y)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        })
    }

    /// Shallow object merge, right side wins on key collisions
    pub fn merge() -> ReducerFn {
        Arc::new(|a, b| match (a, b) {
            (Value::Object(mut left), Value::Object(right)) => {
                left.extend(right);
                Value::Object(left)
            }
            (_, right) => right,
        })
    }
}
