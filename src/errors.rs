//! Registry Error Hierarchy
//!
//! Defines error types for the registry client, categorized by operational
//! concern: session lifecycle, registration, subscription and watch handling.

use crate::store::StoreError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session lifecycle failures (connect, auth, no live handle)
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Provider node create/delete failures beyond the expected races
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Subscription setup failures on the synchronous subscribe path
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Raw store failures that have not been classified by an operation
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Configuration validation failures
    #[error("invalid registry configuration: {0}")]
    InvalidConfig(String),

    /// Descriptor string parse failures
    #[error(transparent)]
    Url(#[from] UrlError),

    /// Operations issued after `destroy()`
    #[error("registry has been destroyed")]
    Destroyed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session handle has been published yet, or the last one died
    #[error("no live session to the coordination store")]
    NotConnected,

    /// Session construction against the ensemble failed
    #[error("failed to establish session to {address}")]
    ConnectFailed {
        address: String,
        #[source]
        source: StoreError,
    },

    /// The root group node could not be created on a fresh session
    #[error("failed to prepare root node {path}")]
    RootSetup {
        path: String,
        #[source]
        source: StoreError,
    },

    /// The configured credential was rejected
    #[error("authentication rejected for {username}")]
    AuthRejected {
        username: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("failed to register {url}")]
    Register {
        url: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to unregister {url}")]
    Unregister {
        url: String,
        #[source]
        source: StoreError,
    },
}

/// Failure on the synchronous subscribe path.
///
/// Watch-fire failures are never wrapped here: they are recorded in the
/// per-path watch state and resolved by a later retry pass.
#[derive(Debug, thiserror::Error)]
#[error("failed to subscribe {url}")]
pub struct SubscriptionError {
    pub url: String,
    #[source]
    pub source: Box<Error>,
}

/// Failure while arming or re-arming a children watch.
///
/// Never surfaced to callers; logged and kept as `WatchState::Failed` until
/// a retry pass re-arms the path.
#[derive(Debug, thiserror::Error)]
#[error("failed to watch children of {path}")]
pub struct WatchError {
    pub path: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid descriptor `{input}`: {reason}")]
pub struct UrlError {
    pub input: String,
    pub reason: &'static str,
}

impl SubscriptionError {
    pub(crate) fn new(url: &crate::url::ServiceUrl, source: impl Into<Error>) -> Self {
        Self {
            url: url.to_string(),
            source: Box::new(source.into()),
        }
    }
}
