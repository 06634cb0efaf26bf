//! The reconciliation engine.
//!
//! [`ZkRegistry`] maps an abstract register/subscribe model onto the
//! coordination store's node hierarchy and keeps both sides converged:
//!
//! - callers register/unregister provider descriptors and subscribe
//!   listeners to concrete services or to the wildcard "any service"
//! - store watch events arrive on a single event-pump task, which re-arms
//!   the fired one-shot watch and fans the recomputed provider set out to
//!   every matching listener
//! - session death triggers an exclusive reconnect followed by replay of
//!   the desired state; watches that fail to (re-)arm are tracked per path
//!   and retried by the failback task

mod listener;
mod recovery;
mod registry;
mod subscribe;

pub use listener::*;
pub use registry::*;
pub use subscribe::*;

#[cfg(test)]
mod registry_test;


#[cfg(test)]
mod recovery_test;
