//! Listener fan-out plumbing.

use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use dashmap::DashSet;

use crate::url::ServiceUrl;

/// Receives the recomputed provider URL set whenever a subscribed service
/// changes, plus one initial delivery at subscribe time when providers
/// already exist.
///
/// Callbacks run on the store event-pump task; implementations must not
/// block. Deduplication of identical consecutive sets is the subscriber's
/// concern, not the registry's.
pub trait NotifyListener: Send + Sync {
    fn notify(&self, urls: Vec<ServiceUrl>);
}

/// Identity wrapper so the same listener `Arc` can be added to and removed
/// from concurrent sets. Two refs are equal iff they share the allocation.
#[derive(Clone)]
pub(crate) struct ListenerRef(Arc<dyn NotifyListener>);

impl ListenerRef {
    pub(crate) fn new(listener: Arc<dyn NotifyListener>) -> Self {
        Self(listener)
    }

    pub(crate) fn notify(&self, urls: Vec<ServiceUrl>) {
        self.0.notify(urls);
    }

    fn data_ptr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for ListenerRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.data_ptr(), other.data_ptr())
    }
}

impl Eq for ListenerRef {}

impl Hash for ListenerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.data_ptr() as usize).hash(state);
    }
}

/// One subscription key: the subscriber descriptor plus every listener
/// registered under it.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) url: ServiceUrl,
    pub(crate) listeners: DashSet<ListenerRef>,
}

impl Subscription {
    pub(crate) fn new(url: ServiceUrl) -> Self {
        Self {
            url,
            listeners: DashSet::new(),
        }
    }
}
