//! Numeric kernels and the concurrent per-series store behind every
//! instrument.

mod aggregate;
mod exponential_histogram;
mod histogram;
mod last_value;
mod sum;
mod value_map;

use core::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) use aggregate::{
    AggregateBuilder, AggregateFns, ComputeAggregation, Filter, Measure, DEFAULT_CARDINALITY_LIMIT,
};
pub(crate) use exponential_histogram::{EXPO_MAX_SCALE, EXPO_MIN_SCALE};

use crate::instrument::ValueType;

/// Marks a type that can have a value added and retrieved atomically. Required
/// since different types have different backing atomic mechanisms.
pub trait AtomicValue<T>: Send + Sync + 'static {
    /// Adds to the current value.
    fn add(&self, value: T);
    /// Returns the current value, zeroing it first when `reset` is set.
    fn get_value(&self, reset: bool) -> T;
}

/// Marks a type that can have an atomic tracker generated for it.
pub trait AtomicallyUpdate<T> {
    /// The backing atomic storage for values of this type.
    type AtomicValue: AtomicValue<T>;
    /// Creates a zeroed tracker.
    fn new_atomic() -> Self::AtomicValue;
}

/// The measurement value types the engine aggregates.
pub trait Number:
    Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + PartialOrd
    + fmt::Debug
    + Clone
    + Copy
    + PartialEq
    + Default
    + Send
    + Sync
    + 'static
    + AtomicallyUpdate<Self>
{
    /// The [ValueType] tag carried by instrument descriptors for this type.
    const VALUE_TYPE: ValueType;

    /// The smallest representable value.
    fn min() -> Self;
    /// The largest representable value.
    fn max() -> Self;

    /// A lossy conversion used for bucket lookups and validity checks.
    fn into_float(self) -> f64;
}

impl Number for i64 {
    const VALUE_TYPE: ValueType = ValueType::I64;

    fn min() -> Self {
        i64::MIN
    }

    fn max() -> Self {
        i64::MAX
    }

    fn into_float(self) -> f64 {
        // May have precision loss at high values
        self as f64
    }
}

impl Number for u64 {
    const VALUE_TYPE: ValueType = ValueType::U64;

    fn min() -> Self {
        u64::MIN
    }

    fn max() -> Self {
        u64::MAX
    }

    fn into_float(self) -> f64 {
        // May have precision loss at high values
        self as f64
    }
}

impl Number for f64 {
    const VALUE_TYPE: ValueType = ValueType::F64;

    fn min() -> Self {
        f64::MIN
    }

    fn max() -> Self {
        f64::MAX
    }

    fn into_float(self) -> f64 {
        self
    }
}

impl AtomicValue<u64> for AtomicU64 {
    fn add(&self, value: u64) {
        self.fetch_add(value, Ordering::Relaxed);
    }

    fn get_value(&self, reset: bool) -> u64 {
        if reset {
            self.swap(0, Ordering::Relaxed)
        } else {
            self.load(Ordering::Relaxed)
        }
    }
}

impl AtomicallyUpdate<u64> for u64 {
    type AtomicValue = AtomicU64;

    fn new_atomic() -> Self::AtomicValue {
        AtomicU64::new(0)
    }
}

impl AtomicValue<i64> for AtomicI64 {
    fn add(&self, value: i64) {
        self.fetch_add(value, Ordering::Relaxed);
    }

    fn get_value(&self, reset: bool) -> i64 {
        if reset {
            self.swap(0, Ordering::Relaxed)
        } else {
            self.load(Ordering::Relaxed)
        }
    }
}

impl AtomicallyUpdate<i64> for i64 {
    type AtomicValue = AtomicI64;

    fn new_atomic() -> Self::AtomicValue {
        AtomicI64::new(0)
    }
}

/// Floating points don't have true atomics, so the running total sits behind a
/// mutex instead.
#[derive(Debug)]
pub struct F64AtomicValue {
    inner: Mutex<f64>,
}

impl AtomicValue<f64> for F64AtomicValue {
    fn add(&self, value: f64) {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        *guard += value;
    }

    fn get_value(&self, reset: bool) -> f64 {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if reset {
            let value = *guard;
            *guard = 0.0;
            value
        } else {
            *guard
        }
    }
}

impl AtomicallyUpdate<f64> for f64 {
    type AtomicValue = F64AtomicValue;

    fn new_atomic() -> Self::AtomicValue {
        F64AtomicValue {
            inner: Mutex::new(0.0),
        }
    }
}
