//! Coordination-store boundary.
//!
//! The registry talks to a session-oriented hierarchical namespace (a
//! ZooKeeper-style ensemble) exclusively through the traits in this module.
//! The store's RPC transport, serialization and ensemble consensus are a
//! correct black box behind [`ZkSession`]; the registry only relies on the
//! contract spelled out here:
//!
//! - nodes are created persistent or ephemeral; ephemeral nodes vanish with
//!   their owning session
//! - `children(path, watch = true)` leaves a **one-shot** child watch: after
//!   it fires once it must be re-armed by another watched read
//! - session-state changes and watch fires are delivered asynchronously on
//!   the event channel handed to [`SessionFactory::connect`]
//! - every call observes the session's configured operation timeout; a timed
//!   out call fails, it is never retried inside the session

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

/// Node lifetime on create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed by the store when the creating session ends
    Ephemeral,
}

/// Access-control list attached to created nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    /// World-writable; used when no credential is configured
    OpenUnsafe,
    /// Only the authenticated creator may touch the node
    CreatorAll,
}

/// Session liveness as reported by the store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session (re-)established and synced with the ensemble
    SyncConnected,
    /// Transport lost, session possibly still alive on the ensemble
    Disconnected,
    /// Session timed out on the ensemble; ephemeral nodes are gone
    Expired,
}

/// Asynchronous store notifications, delivered on the event channel in
/// store order per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Session(SessionState),
    /// A one-shot child watch fired for `path`; the watch is now disarmed
    ChildrenChanged { path: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("connection to the ensemble lost")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed")]
    AuthFailed,

    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Expected race on create: another session created the node first.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreError::NodeExists(_))
    }

    /// Expected condition on delete/read paths that tolerate absence.
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode(_))
    }
}

/// One live, authenticated connection to the coordination store.
///
/// The registry holds at most one of these at a time and replaces the handle
/// wholesale on reconnect; implementations must be safe to call from
/// multiple tasks concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ZkSession: Send + Sync {
    /// Create a node. Fails with [`StoreError::NodeExists`] when the path is
    /// already taken.
    async fn create(&self, path: &str, mode: CreateMode, acl: Acl) -> StoreResult<()>;

    /// Delete a node regardless of its version. Fails with
    /// [`StoreError::NoNode`] when absent.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Child names of `path` (raw, still segment-encoded). With `watch`,
    /// additionally arms a one-shot child watch on `path`.
    async fn children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>>;

    /// Supply the session credential. Called once, before any namespace
    /// operation, when an identity is configured.
    async fn add_auth(&self, username: &str, password: &str) -> StoreResult<()>;

    fn is_alive(&self) -> bool;

    /// Release the session; ephemeral nodes owned by it disappear.
    async fn close(&self) -> StoreResult<()>;
}

/// Produces sessions bound to an event channel.
///
/// The registry calls this on first connect and after every session death;
/// `connect_string` is the comma-joined primary + backup address list.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        connect_string: &str,
        timeout: Duration,
        events: mpsc::Sender<StoreEvent>,
    ) -> StoreResult<std::sync::Arc<dyn ZkSession>>;
}
