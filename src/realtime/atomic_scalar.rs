// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fixed-size scalar values and an atomic cell to hold them.
//!
//! An [`AtomicScalar`] lets the audio thread overwrite a parameter in place
//! through a shared reference, without locking and without allocating.
//!
//! # Usage
//!
//! ```
//! use rtbridge::realtime::{AtomicScalar, Scalar};
//!
//! let cell = AtomicScalar::new(Scalar::Int(5));
//!
//! // Audio thread writes the new value
//! cell.set(Scalar::Float(0.5));
//!
//! // and reads it back
//! assert_eq!(cell.get(), Scalar::Float(0.5));
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// A value with a fixed in-place representation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    const TAG_BOOL: u8 = 0;
    const TAG_INT: u8 = 1;
    const TAG_FLOAT: u8 = 2;

    fn encode(self) -> (u8, u64) {
        match self {
            Scalar::Bool(b) => (Self::TAG_BOOL, b as u64),
            Scalar::Int(i) => (Self::TAG_INT, i as u64),
            Scalar::Float(f) => (Self::TAG_FLOAT, f.to_bits()),
        }
    }

    fn decode(tag: u8, bits: u64) -> Self {
        match tag {
            Self::TAG_BOOL => Scalar::Bool(bits != 0),
            Self::TAG_INT => Scalar::Int(bits as i64),
            _ => Scalar::Float(f64::from_bits(bits)),
        }
    }

    /// Numeric view of the value (`true` is 1.0).
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value.into())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::Float(value.into())
    }
}

/// Atomic storage for a [`Scalar`].
///
/// The kind tag and the payload are two separate atomics, so a reader on
/// another thread racing a writer that changes the kind can observe a mix of
/// the two. Writes and reads of one cell are expected to happen on the same
/// thread (the replica is only touched by the consumer thread); the atomics
/// make that access sound through `&self`.
#[derive(Debug)]
pub struct AtomicScalar {
    tag: AtomicU8,
    bits: AtomicU64,
}

impl AtomicScalar {
    /// Create a new cell holding `value`.
    pub fn new(value: Scalar) -> Self {
        let (tag, bits) = value.encode();
        Self {
            tag: AtomicU8::new(tag),
            bits: AtomicU64::new(bits),
        }
    }

    /// Get the current value.
    #[inline]
    pub fn get(&self) -> Scalar {
        let tag = self.tag.load(Ordering::Acquire);
        let bits = self.bits.load(Ordering::Acquire);
        Scalar::decode(tag, bits)
    }

    /// Set a new value.
    #[inline]
    pub fn set(&self, value: Scalar) {
        let (tag, bits) = value.encode();
        self.bits.store(bits, Ordering::Release);
        self.tag.store(tag, Ordering::Release);
    }
}

impl Clone for AtomicScalar {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}
