//! Activation and passivation hooks.
//!
//! The owning component model supplies these; the group manager calls them
//! when instances enter or leave process memory relative to the store.

use crate::error::Result;

/// Lifecycle callbacks for bean instances.
///
/// Both methods default to no-ops. A failing hook aborts the materialization
/// or close that invoked it.
pub trait PassivationListener<I>: Send + Sync {
    /// Called once per instance after its group is read back from the store.
    fn post_activate(&self, _instance: &I) -> Result<()> {
        Ok(())
    }

    /// Called once per instance before its group is written back to the store.
    fn pre_passivate(&self, _instance: &I) -> Result<()> {
        Ok(())
    }
}

/// Hooks for stores that never leave process memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPassivation;

impl<I> PassivationListener<I> for NoPassivation {}
