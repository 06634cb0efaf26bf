//! Recovery orchestration and the failback retry task.
//!
//! Two distinct mechanisms converge the store onto the desired state:
//!
//! - [`ZkRegistry::recover`] runs after every successful (re)connect. It
//!   marks every desired registration and subscription for replay and
//!   immediately re-arms watches that were already down.
//! - [`ZkRegistry::retry`] is the periodic failback pass. It reconnects if
//!   needed, replays the failed registrations and subscriptions recorded by
//!   the synchronous paths (and by `recover`), and re-arms failed watches.
//!   Entries leave the failed sets only on success.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::listener::ListenerRef;
use super::listener::Subscription;
use super::registry::ZkRegistry;
use super::subscribe::WatchState;
use crate::errors::Result;
use crate::url::ServiceUrl;

impl ZkRegistry {
    /// Replay bookkeeping after a fresh session is established (or the
    /// existing one resyncs). Runs inside the session lock on the reconnect
    /// path, so it only touches the published handle and the concurrent
    /// containers.
    pub(super) async fn recover(&self) {
        for entry in self.registered.iter() {
            debug!("recover register {}", entry.value());
            self.failed_registered
                .insert(entry.key().clone(), entry.value().clone());
        }

        let subscriptions: Vec<Subscription> = self
            .subscribed
            .iter()
            .chain(self.any_subscribed.iter())
            .map(|entry| entry.value().clone())
            .collect();
        for sub in subscriptions {
            debug!("recover subscribe {}", sub.url);
            let failed = self
                .failed_subscribed
                .entry(sub.url.to_string())
                .or_insert_with(|| Subscription::new(sub.url.clone()));
            for listener in sub.listeners.iter() {
                failed.listeners.insert(listener.key().clone());
            }
        }

        self.retry_failed_watches().await;
    }

    /// Periodic failback entry point, also usable by an external scheduler.
    pub async fn retry(&self) -> Result<()> {
        self.ensure_connected().await?;
        self.retry_failed_registered().await;
        self.retry_failed_subscribed().await;
        self.retry_failed_watches().await;
        Ok(())
    }

    /// Anything left to replay?
    pub fn has_pending(&self) -> bool {
        !self.failed_registered.is_empty()
            || !self.failed_subscribed.is_empty()
            || self
                .watches
                .iter()
                .any(|entry| *entry.value() == WatchState::Failed)
    }

    async fn retry_failed_registered(&self) {
        let failed: Vec<(String, ServiceUrl)> = self
            .failed_registered
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if failed.is_empty() {
            return;
        }
        info!("retry register, {} pending", failed.len());
        for (key, url) in failed {
            match self.do_register(&url).await {
                Ok(()) => {
                    self.failed_registered.remove(&key);
                }
                Err(e) => warn!("failed to retry register {url}, waiting for again: {e}"),
            }
        }
    }

    async fn retry_failed_subscribed(&self) {
        let failed: Vec<Subscription> = self
            .failed_subscribed
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if failed.is_empty() {
            return;
        }
        info!("retry subscribe, {} pending", failed.len());
        for sub in failed {
            let key = sub.url.to_string();
            let listeners: Vec<ListenerRef> = sub.listeners.iter().map(|l| l.key().clone()).collect();
            for listener in listeners {
                match self.subscribe_inner(&sub.url, &listener).await {
                    Ok(()) => {
                        if let Some(entry) = self.failed_subscribed.get(&key) {
                            entry.listeners.remove(&listener);
                        }
                    }
                    Err(e) => warn!("failed to retry subscribe {}, waiting for again: {e}", sub.url),
                }
            }
            self.failed_subscribed
                .remove_if(&key, |_, sub| sub.listeners.is_empty());
        }
    }

    /// Drain the failed-watch set: re-arm each path, removing it from the
    /// failed state on success. The read result is discarded; the armed
    /// watch makes the next real change observable again.
    pub(super) async fn retry_failed_watches(&self) {
        let failed: Vec<String> = self
            .watches
            .iter()
            .filter(|entry| *entry.value() == WatchState::Failed)
            .map(|entry| entry.key().clone())
            .collect();
        if failed.is_empty() {
            return;
        }
        info!("retry watch {failed:?}");
        for path in failed {
            if let Err(e) = self.rearm_watch(&path).await {
                warn!("{e}, waiting for again: {}", e.source);
            }
        }
    }
}

/// Failback timer: wakes every configured period and runs a retry pass
/// while anything is pending (or the session is down). Stops on `destroy`.
pub(super) fn spawn_retry_task(registry: Arc<ZkRegistry>) {
    let period = registry.config().retry_period();
    let shutdown = registry.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("failback retry task started, period {period:?}");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if registry.is_available() && !registry.has_pending() {
                        continue;
                    }
                    if let Err(e) = registry.retry().await {
                        warn!("retry pass failed, waiting for the next period: {e}");
                    }
                }
            }
        }
        debug!("failback retry task stopped");
    });
}
