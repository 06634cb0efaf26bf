//! Subscription & watch engine.
//!
//! The store's child watches are one-shot: every successful read-with-watch
//! must be followed, when it fires, by another read-with-watch to stay
//! current. Each watched path therefore runs a small state machine,
//!
//! ```text
//! (absent) -> Requested -> Watching
//!                 |            |
//!                 v            v  (re-arm error)
//!               Failed <-------+
//! ```
//!
//! kept in an explicit per-path status map. `Failed` paths are swallowed at
//! fire time (nobody is waiting on a watch) and re-armed by the next
//! recovery or retry pass.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::listener::ListenerRef;
use super::listener::NotifyListener;
use super::listener::Subscription;
use super::registry::ZkRegistry;
use crate::constants::ADMIN_KEY;
use crate::constants::CHECK_KEY;
use crate::constants::EMPTY_PROTOCOL;
use crate::constants::REGISTER_KEY;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::SubscriptionError;
use crate::errors::WatchError;
use crate::paths;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::url::ServiceUrl;

/// Watch status of one store path. Absence from the map means unwatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// A watched read is in flight
    Requested,
    /// One-shot watch armed; the next child change will fire
    Watching,
    /// Arming or re-arming failed; waiting for a retry pass
    Failed,
}

impl ZkRegistry {
    /// Subscribe a listener to a concrete service, or to every service when
    /// the descriptor's service name is `*`.
    ///
    /// Concrete subscribers see the current provider set immediately when it
    /// is non-empty, closing the race between "current state" and "first
    /// change". Failures are recorded for failback replay and surfaced.
    pub async fn subscribe(&self, url: &ServiceUrl, listener: Arc<dyn NotifyListener>) -> Result<()> {
        self.ensure_connected().await?;
        let listener = ListenerRef::new(listener);
        if let Err(e) = self.subscribe_inner(url, &listener).await {
            let failed = self
                .failed_subscribed
                .entry(url.to_string())
                .or_insert_with(|| Subscription::new(url.clone()));
            failed.listeners.insert(listener);
            return Err(e);
        }
        Ok(())
    }

    /// Drop a listener. Wildcard: the listener leaves the any-map; the
    /// per-service watches stay armed and simply stop notifying it.
    /// Concrete: the listener leaves the subscription, and a subscriber
    /// that registered itself as a provider is unregistered.
    pub async fn unsubscribe(&self, url: &ServiceUrl, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        let listener = ListenerRef::new(Arc::clone(listener));
        let key = url.to_string();
        if url.is_any_service() {
            if let Some(sub) = self.any_subscribed.get(&key) {
                sub.listeners.remove(&listener);
            }
        } else {
            if let Some(sub) = self.subscribed.get(&key) {
                sub.listeners.remove(&listener);
            }
            if url.bool_param(REGISTER_KEY, true) {
                self.unregister(url).await?;
            }
        }
        if let Some(failed) = self.failed_subscribed.get(&key) {
            failed.listeners.remove(&listener);
        }
        Ok(())
    }

    pub(super) async fn subscribe_inner(&self, url: &ServiceUrl, listener: &ListenerRef) -> Result<()> {
        if url.is_any_service() {
            self.subscribe_any(url, listener).await
        } else {
            self.subscribe_concrete(url, listener).await
        }
    }

    /// Wildcard branch: watch the root for new services, then fan out one
    /// concrete subscription per already-known service for this listener.
    async fn subscribe_any(&self, url: &ServiceUrl, listener: &ListenerRef) -> Result<()> {
        {
            let sub = self
                .any_subscribed
                .entry(url.to_string())
                .or_insert_with(|| Subscription::new(url.clone()));
            sub.listeners.insert(listener.clone());
        }

        let root = self.paths.root_path();
        let services = self
            .children_with_watch(&root)
            .await
            .map_err(|e| SubscriptionError::new(url, Error::Store(e)))?;

        for service in services {
            self.known_services.insert(service.clone());
            let concrete = synthesize_concrete(url, &service);
            self.subscribe_concrete(&concrete, listener).await?;
        }
        Ok(())
    }

    /// Concrete branch: optionally announce the subscriber as a provider,
    /// record the subscription, arm the service watch and deliver the
    /// current matching set.
    pub(super) async fn subscribe_concrete(&self, url: &ServiceUrl, listener: &ListenerRef) -> Result<()> {
        if url.bool_param(REGISTER_KEY, true) {
            self.registered.insert(url.to_string(), url.clone());
            self.do_register(url)
                .await
                .map_err(|e| SubscriptionError::new(url, e))?;
        }

        {
            let sub = self
                .subscribed
                .entry(url.to_string())
                .or_insert_with(|| Subscription::new(url.clone()));
            sub.listeners.insert(listener.clone());
        }

        let service_path = self.paths.service_path(url.service_name());
        let providers = self
            .children_with_watch(&service_path)
            .await
            .map_err(|e| SubscriptionError::new(url, Error::Store(e)))?;

        let urls = self.to_urls(url, &providers);
        if !urls.is_empty() {
            debug!("initial providers for {}: {} urls", url.service_name(), urls.len());
            self.notify(url, listener, urls);
        }
        Ok(())
    }

    // -
    // Watch fire handling (store delivery order per path)

    pub(super) async fn handle_children_changed(&self, path: &str) {
        // the one-shot watch just fired: re-arm before reconciling
        let children = match self.rearm_watch(path).await {
            Ok(children) => children,
            Err(e) => {
                warn!("{e}, waiting for a retry pass: {}", e.source);
                return;
            }
        };
        // "children changed", never "children became empty": an empty read
        // produces no notification
        if children.is_empty() {
            return;
        }
        if path == self.paths.root_path() {
            self.handle_root_changed(&children).await;
        } else {
            self.handle_service_changed(path, &children);
        }
    }

    /// Root fire: diff against the known services; each newly-seen name gets
    /// a fresh concrete subscription for every wildcard listener. Known
    /// names are ignored, and nothing is ever removed.
    async fn handle_root_changed(&self, services: &[String]) {
        for service in services {
            if !self.known_services.insert(service.clone()) {
                continue;
            }
            info!("discovered service {service}");

            let any_subs: Vec<(ServiceUrl, Vec<ListenerRef>)> = self
                .any_subscribed
                .iter()
                .map(|e| (e.url.clone(), e.listeners.iter().map(|l| l.key().clone()).collect()))
                .collect();
            for (any_url, listeners) in any_subs {
                let concrete = synthesize_concrete(&any_url, service);
                for listener in listeners {
                    if let Err(e) = self.subscribe_concrete(&concrete, &listener).await {
                        warn!("failed to subscribe discovered service {service}: {e}");
                        let failed = self
                            .failed_subscribed
                            .entry(concrete.to_string())
                            .or_insert_with(|| Subscription::new(concrete.clone()));
                        failed.listeners.insert(listener);
                    }
                }
            }
        }
    }

    /// Service fire: recompute the filtered provider list for every
    /// subscription on this service and fan it out. An empty recomputed
    /// list is "no update".
    fn handle_service_changed(&self, path: &str, children: &[String]) {
        let service = paths::last_segment_decoded(path);

        let targets: Vec<(ServiceUrl, Vec<ListenerRef>)> = self
            .subscribed
            .iter()
            .filter(|e| e.url.service_name() == service)
            .map(|e| (e.url.clone(), e.listeners.iter().map(|l| l.key().clone()).collect()))
            .collect();

        for (subscriber, listeners) in targets {
            let urls = self.to_urls(&subscriber, children);
            if urls.is_empty() {
                continue;
            }
            info!("service {service} changed, {} matching providers", urls.len());
            for listener in listeners {
                self.notify(&subscriber, &listener, urls.clone());
            }
        }
    }

    // -
    // Watched reads

    /// Re-arm the one-shot watch on `path`, classifying failures as watch
    /// errors. Nobody synchronously waits on a fire, so callers log and
    /// leave the `Failed` state for the next retry pass.
    pub(super) async fn rearm_watch(&self, path: &str) -> std::result::Result<Vec<String>, WatchError> {
        self.children_with_watch(path)
            .await
            .map_err(|source| WatchError {
                path: path.to_string(),
                source,
            })
    }

    /// Children of `path` with the one-shot watch re-armed, tracked through
    /// the per-path state machine.
    pub(super) async fn children_with_watch(&self, path: &str) -> StoreResult<Vec<String>> {
        self.watches.insert(path.to_string(), WatchState::Requested);
        match self.children_of(path, true).await {
            Ok(children) => {
                self.watches.insert(path.to_string(), WatchState::Watching);
                Ok(children)
            }
            Err(e) => {
                self.watches.insert(path.to_string(), WatchState::Failed);
                Err(e)
            }
        }
    }

    /// Raw children read; node absence reads as an empty list, and every
    /// child name is decoded before use.
    async fn children_of(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let session = match self.current_session() {
            Ok(session) => session,
            // no published handle reads as a lost connection
            Err(_) => return Err(StoreError::ConnectionLoss),
        };
        match session.children(path, watch).await {
            Ok(raw) => Ok(raw.iter().map(|child| paths::decode(child)).collect()),
            Err(e) if e.is_no_node() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Decode and filter provider children against a subscriber. Children
    /// that are not descriptors (no `://`) are foreign nodes and skipped.
    /// An admin subscriber with no match gets itself back under the `empty`
    /// protocol.
    pub(super) fn to_urls(&self, consumer: &ServiceUrl, providers: &[String]) -> Vec<ServiceUrl> {
        let mut urls = Vec::new();
        for provider in providers {
            if !provider.contains("://") {
                continue;
            }
            match provider.parse::<ServiceUrl>() {
                Ok(url) => {
                    if consumer.is_match(&url) {
                        urls.push(url);
                    }
                }
                Err(e) => debug!("ignoring undecodable child `{provider}`: {e}"),
            }
        }
        if urls.is_empty() && consumer.bool_param(ADMIN_KEY, false) {
            urls.push(consumer.clone().with_protocol(EMPTY_PROTOCOL));
        }
        urls
    }
}

/// A wildcard subscriber rewritten for one discovered service: no liveness
/// check, no self-registration.
fn synthesize_concrete(any_url: &ServiceUrl, service: &str) -> ServiceUrl {
    any_url
        .clone()
        .with_service(service)
        .with_params(&[(CHECK_KEY, "false"), (REGISTER_KEY, "false")])
}
