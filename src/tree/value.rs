// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Property values stored on tree nodes.

use crate::gc::SharedObject;
pub use crate::realtime::Scalar;
use std::sync::Arc;

/// A property value.
///
/// Only [`Value::Scalar`] has a fixed in-place representation, so only
/// scalar changes can be forwarded to the replica without a full resync.
/// Objects must come from a [`DeferredCollector`] so the audio thread never
/// ends up holding the last reference.
///
/// [`DeferredCollector`]: crate::gc::DeferredCollector
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Void,
    Scalar(Scalar),
    Text(Arc<str>),
    Object(SharedObject),
}

impl Value {
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&SharedObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value.into())
    }
}

impl From<SharedObject> for Value {
    fn from(value: SharedObject) -> Self {
        Value::Object(value)
    }
}
