//! Composable time offsets.
//!
//! A time quantity is kept as a fixed basis plus a cumulative delta so that
//! concurrent updates compose by addition instead of overwriting each other.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Add;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// A time quantity that a signed delta can be applied to.
pub trait Offsettable: Copy {
    /// Shift this value by `delta`.
    fn shift(self, delta: TimeDelta) -> Self;

    /// Signed delta that takes `self` to `target`.
    fn delta_to(self, target: Self) -> TimeDelta;
}

/// Elapsed durations never go below zero.
impl Offsettable for Duration {
    fn shift(self, delta: TimeDelta) -> Self {
        (to_delta(self) + delta).to_std().unwrap_or(Duration::ZERO)
    }

    fn delta_to(self, target: Self) -> TimeDelta {
        to_delta(target) - to_delta(self)
    }
}

/// Instants saturate at the representable bounds.
impl Offsettable for DateTime<Utc> {
    fn shift(self, delta: TimeDelta) -> Self {
        self.checked_add_signed(delta).unwrap_or(if delta > TimeDelta::zero() {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        })
    }

    fn delta_to(self, target: Self) -> TimeDelta {
        target.signed_duration_since(self)
    }
}

pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// A delta applicable to a basis of type `V`.
///
/// Offsets compose by addition, and composition is associative.
pub struct Offset<V> {
    delta: TimeDelta,
    _value: PhantomData<fn() -> V>,
}

impl<V> Offset<V> {
    /// The offset that leaves its basis unchanged.
    pub fn zero() -> Self {
        Self::new(TimeDelta::zero())
    }

    /// Wrap a raw delta.
    pub fn new(delta: TimeDelta) -> Self {
        Self {
            delta,
            _value: PhantomData,
        }
    }

    /// The raw delta.
    pub fn delta(&self) -> TimeDelta {
        self.delta
    }

    pub fn is_zero(&self) -> bool {
        self.delta.is_zero()
    }
}

impl<V: Offsettable> Offset<V> {
    /// The offset that takes `from` to `to`.
    pub fn between(from: V, to: V) -> Self {
        Self::new(from.delta_to(to))
    }

    /// Apply this offset to `basis`.
    pub fn apply(&self, basis: V) -> V {
        if self.is_zero() {
            basis
        } else {
            basis.shift(self.delta)
        }
    }
}

impl<V> Add for Offset<V> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.delta + other.delta)
    }
}

impl<V> Clone for Offset<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Offset<V> {}

impl<V> PartialEq for Offset<V> {
    fn eq(&self, other: &Self) -> bool {
        self.delta == other.delta
    }
}

impl<V> Eq for Offset<V> {}

impl<V> Default for Offset<V> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<V> fmt::Debug for Offset<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Offset").field(&self.delta).finish()
    }
}

/// A value read once from the store, plus the offset accumulated locally since.
///
/// Only the offset is written back, so the store can add it to whatever it
/// holds by then.
#[derive(Debug, Clone, Copy)]
pub struct OffsetValue<V> {
    basis: V,
    offset: Offset<V>,
}

impl<V: Offsettable> OffsetValue<V> {
    pub fn new(basis: V) -> Self {
        Self {
            basis,
            offset: Offset::zero(),
        }
    }

    /// The value as read from the store.
    pub fn basis(&self) -> V {
        self.basis
    }

    /// The current value: basis plus local offset.
    pub fn get(&self) -> V {
        self.offset.apply(self.basis)
    }

    /// Replace the current value, recording it as an offset from the basis.
    pub fn set(&mut self, value: V) {
        self.offset = Offset::between(self.basis, value);
    }

    /// The local offset accumulated since the basis was read.
    pub fn offset(&self) -> Offset<V> {
        self.offset
    }

    /// Fold the local offset into the basis, as after a successful write-back.
    pub fn rebase(&mut self) {
        self.basis = self.get();
        self.offset = Offset::zero();
    }
}
