//! Bounds shared by bean identifiers and instances.

use std::fmt::Debug;
use std::hash::Hash;

/// Opaque identifier of a bean; also used for groups.
pub trait BeanId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> BeanId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// A stateful bean instance held by a group.
pub trait BeanInstance: Send + Sync + 'static {}

impl<T> BeanInstance for T where T: Send + Sync + 'static {}
