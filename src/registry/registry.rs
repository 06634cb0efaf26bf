//! Registry core: session lifecycle and the registration engine.
//!
//! Exactly one live session handle exists at a time. The handle is published
//! through an [`ArcSwapOption`] so every reader takes a cheap local copy;
//! only (re)creation is serialized, behind a single async mutex with a
//! double-checked liveness test around it. After a fresh session is
//! established the desired state is recovered before the previous handle is
//! released.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::listener::ListenerRef;
use super::listener::Subscription;
use super::recovery::spawn_retry_task;
use super::subscribe::WatchState;
use crate::config::RegistryConfig;
use crate::constants::ROUTE_PROTOCOL;
use crate::errors::Error;
use crate::errors::RegistrationError;
use crate::errors::Result;
use crate::errors::SessionError;
use crate::paths::PathCodec;
use crate::store::Acl;
use crate::store::CreateMode;
use crate::store::SessionFactory;
use crate::store::SessionState;
use crate::store::StoreError;
use crate::store::StoreEvent;
use crate::store::ZkSession;
use crate::url::ServiceUrl;

/// Store events queued between the session's delivery thread and the pump
/// task. Sized generously; a full queue would stall the store client.
const EVENT_QUEUE_SIZE: usize = 1024;

/// Published session handle. Replaced wholesale, never mutated.
pub(super) struct SessionSlot {
    pub(super) session: Arc<dyn ZkSession>,
}

/// A service-registry client backed by one coordination-store connection.
///
/// Created with [`ZkRegistry::connect`]; torn down with
/// [`ZkRegistry::destroy`]. One instance manages exactly one store
/// connection for its configured address and namespace for its entire
/// lifetime.
pub struct ZkRegistry {
    pub(super) config: RegistryConfig,
    pub(super) paths: PathCodec,
    pub(super) acl: Acl,
    pub(super) factory: Arc<dyn SessionFactory>,

    /// The single live handle; readers clone outside the lock
    pub(super) session: ArcSwapOption<SessionSlot>,
    /// Guards session (re)creation only
    pub(super) session_lock: Mutex<()>,

    pub(super) events_tx: mpsc::Sender<StoreEvent>,
    pub(super) shutdown: CancellationToken,
    pub(super) destroyed: AtomicBool,

    /// Desired registrations, keyed by canonical descriptor string
    pub(super) registered: DashMap<String, ServiceUrl>,
    /// Concrete subscriptions, keyed by canonical subscriber string
    pub(super) subscribed: DashMap<String, Subscription>,
    /// Wildcard ("any service") subscriptions
    pub(super) any_subscribed: DashMap<String, Subscription>,

    /// Service names the wildcard mechanism has discovered. Grows only.
    pub(super) known_services: DashSet<String>,

    /// Per-path watch status; absence means unwatched
    pub(super) watches: DashMap<String, WatchState>,

    /// Failback state, drained by [`ZkRegistry::retry`]
    pub(super) failed_registered: DashMap<String, ServiceUrl>,
    pub(super) failed_subscribed: DashMap<String, Subscription>,

    /// Last URL set delivered per subscription key
    pub(super) notified: DashMap<String, Vec<ServiceUrl>>,
}

impl ZkRegistry {
    /// Connect to the store and start the event pump and the failback retry
    /// task. Fails when the initial session cannot be established.
    pub async fn connect(
        config: RegistryConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let acl = if config.credential().is_some() {
            Acl::CreatorAll
        } else {
            Acl::OpenUnsafe
        };
        let paths = PathCodec::new(config.group.as_deref());

        let registry = Arc::new(Self {
            config,
            paths,
            acl,
            factory,
            session: ArcSwapOption::empty(),
            session_lock: Mutex::new(()),
            events_tx,
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            registered: DashMap::new(),
            subscribed: DashMap::new(),
            any_subscribed: DashMap::new(),
            known_services: DashSet::new(),
            watches: DashMap::new(),
            failed_registered: DashMap::new(),
            failed_subscribed: DashMap::new(),
            notified: DashMap::new(),
        });

        registry.ensure_connected().await?;

        tokio::spawn(Arc::clone(&registry).run_event_pump(events_rx));
        spawn_retry_task(Arc::clone(&registry));

        Ok(registry)
    }

    /// Bring up a live session if there is none.
    ///
    /// Double-checked: the fast path reads the published handle without the
    /// lock; the slow path re-checks under the lock so racing triggers
    /// (expiry event, caller action, retry timer) produce one reconnect.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        if self.session_is_alive() {
            return Ok(());
        }

        let _guard = self.session_lock.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        if self.session_is_alive() {
            return Ok(());
        }

        let session = self.create_session().await?;
        // publish the new handle before releasing the old one
        let old = self.session.swap(Some(Arc::new(SessionSlot { session })));
        info!("session established to {}", self.config.connect_string());

        self.recover().await;

        if let Some(old) = old {
            if let Err(e) = old.session.close().await {
                warn!("failed to close the replaced session: {e}");
            }
        }
        Ok(())
    }

    async fn create_session(&self) -> Result<Arc<dyn ZkSession>> {
        let connect_string = self.config.connect_string();
        let session = self
            .factory
            .connect(&connect_string, self.config.timeout(), self.events_tx.clone())
            .await
            .map_err(|source| SessionError::ConnectFailed {
                address: connect_string.clone(),
                source,
            })?;

        if let Some((username, password)) = self.config.credential() {
            session
                .add_auth(username, password)
                .await
                .map_err(|source| SessionError::AuthRejected {
                    username: username.to_string(),
                    source,
                })?;
        }

        // establish the root namespace node, tolerating a concurrent creator
        if self.paths.has_group() {
            let root = self.paths.root_path();
            let root_err = |source| SessionError::RootSetup {
                path: root.clone(),
                source,
            };
            match session.exists(&root).await {
                Ok(true) => {}
                Ok(false) => match session.create(&root, CreateMode::Persistent, self.acl).await {
                    Ok(()) | Err(StoreError::NodeExists(_)) => {}
                    Err(source) => return Err(root_err(source).into()),
                },
                Err(source) => return Err(root_err(source).into()),
            }
        }
        Ok(session)
    }

    pub(super) fn session_is_alive(&self) -> bool {
        self.session
            .load_full()
            .map(|slot| slot.session.is_alive())
            .unwrap_or(false)
    }

    /// Local copy of the published handle, taken outside the lock.
    pub(super) fn current_session(&self) -> std::result::Result<Arc<dyn ZkSession>, SessionError> {
        self.session
            .load_full()
            .map(|slot| slot.session.clone())
            .ok_or(SessionError::NotConnected)
    }

    // -
    // Store event routing

    async fn run_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<StoreEvent>) {
        debug!("store event pump started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(event) => self.handle_store_event(event).await,
                },
            }
        }
        debug!("store event pump stopped");
    }

    async fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Session(SessionState::Expired) => {
                warn!("store session expired, reconnecting");
                if let Err(e) = self.ensure_connected().await {
                    error!("reconnect after expiry failed, leaving it to the retry task: {e}");
                }
            }
            StoreEvent::Session(SessionState::SyncConnected) => {
                // same session resynced: replay state, keep the handle
                self.recover().await;
            }
            StoreEvent::Session(SessionState::Disconnected) => {
                debug!("store connection dropped, waiting for the client to resync");
            }
            StoreEvent::ChildrenChanged { path } => self.handle_children_changed(&path).await,
        }
    }

    // -
    // Registration engine

    /// Announce a provider. The descriptor is recorded as desired state
    /// first, so it is replayed after any reconnect.
    pub async fn register(&self, url: &ServiceUrl) -> Result<()> {
        self.ensure_connected().await?;
        self.registered.insert(url.to_string(), url.clone());
        if let Err(e) = self.do_register(url).await {
            self.failed_registered.insert(url.to_string(), url.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Withdraw a provider. Absence of the node is not an error.
    pub async fn unregister(&self, url: &ServiceUrl) -> Result<()> {
        self.ensure_connected().await?;
        let key = url.to_string();
        self.registered.remove(&key);
        self.failed_registered.remove(&key);
        self.do_unregister(url).await
    }

    pub(super) async fn do_register(&self, url: &ServiceUrl) -> Result<()> {
        let session = self.current_session()?;
        let wrap = |source| RegistrationError::Register {
            url: url.to_string(),
            source,
        };

        // the service node is persistent and created lazily, first come wins
        let service = self.paths.service_path(url.service_name());
        match session.exists(&service).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = session.create(&service, CreateMode::Persistent, self.acl).await {
                    if !e.is_node_exists() {
                        return Err(wrap(e).into());
                    }
                }
            }
            Err(e) => return Err(wrap(e).into()),
        }

        // a stale node under the same descriptor is a leftover of a crashed
        // prior session: delete it so the fresh create is unambiguous
        let provider = self.paths.provider_path(url);
        match session.exists(&provider).await {
            Ok(true) => {
                if let Err(e) = session.delete(&provider).await {
                    if !e.is_no_node() {
                        return Err(wrap(e).into());
                    }
                }
            }
            Ok(false) => {}
            Err(e) => return Err(wrap(e).into()),
        }

        let mode = if url.protocol() == ROUTE_PROTOCOL {
            CreateMode::Persistent
        } else {
            CreateMode::Ephemeral
        };
        if let Err(e) = session.create(&provider, mode, self.acl).await {
            if !e.is_node_exists() {
                return Err(wrap(e).into());
            }
            // lost a create race: delete and recreate once more
            if let Err(e) = session.delete(&provider).await {
                if !e.is_no_node() {
                    return Err(wrap(e).into());
                }
            }
            session
                .create(&provider, mode, self.acl)
                .await
                .map_err(wrap)?;
        }
        debug!("registered provider node {provider}");
        Ok(())
    }

    pub(super) async fn do_unregister(&self, url: &ServiceUrl) -> Result<()> {
        let session = self.current_session()?;
        let provider = self.paths.provider_path(url);
        match session.delete(&provider).await {
            Ok(()) => {
                debug!("removed provider node {provider}");
                Ok(())
            }
            Err(e) if e.is_no_node() => Ok(()),
            Err(source) => Err(RegistrationError::Unregister {
                url: url.to_string(),
                source,
            }
            .into()),
        }
    }

    // -
    // Notification bookkeeping

    /// Deliver a recomputed URL set to one listener, remembering it as the
    /// last known set for the subscription key.
    pub(super) fn notify(&self, subscriber: &ServiceUrl, listener: &ListenerRef, urls: Vec<ServiceUrl>) {
        self.notified.insert(subscriber.to_string(), urls.clone());
        listener.notify(urls);
    }

    /// Last provider set delivered for this subscriber, if any.
    pub fn lookup(&self, url: &ServiceUrl) -> Vec<ServiceUrl> {
        self.notified
            .get(&url.to_string())
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    // -
    // Lifecycle surface

    pub fn is_available(&self) -> bool {
        self.session_is_alive()
    }

    /// Release the session and stop the background tasks. Idempotent;
    /// failures are logged and swallowed.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        // serialize with any in-flight reconnect before releasing the handle
        let _guard = self.session_lock.lock().await;
        if let Some(slot) = self.session.swap(None) {
            if let Err(e) = slot.session.close().await {
                warn!("failed to close session on destroy: {e}");
            }
        }
        info!("registry destroyed");
    }

    pub(super) fn config(&self) -> &RegistryConfig {
        &self.config
    }
}
