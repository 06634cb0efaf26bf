//! In-memory coordination store and listener doubles.
//!
//! [`MemoryStore`] implements the full store contract (hierarchy, ephemeral
//! ownership, one-shot child watches, session expiry) so the watch flow can
//! be exercised end to end without an ensemble. Failure injection toggles
//! cover the connect and watched-read paths.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::paths;
use crate::registry::NotifyListener;
use crate::store::Acl;
use crate::store::CreateMode;
use crate::store::SessionFactory;
use crate::store::SessionState;
use crate::store::StoreError;
use crate::store::StoreEvent;
use crate::store::StoreResult;
use crate::store::ZkSession;
use crate::url::ServiceUrl;

struct NodeMeta {
    mode: CreateMode,
    owner: u64,
}

struct SessionMeta {
    events: mpsc::Sender<StoreEvent>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct StoreInner {
    nodes: Mutex<HashMap<String, NodeMeta>>,
    /// path -> session ids with an armed one-shot child watch
    watches: Mutex<HashMap<String, HashSet<u64>>>,
    sessions: Mutex<HashMap<u64, SessionMeta>>,
    next_session_id: AtomicU64,
    connect_count: AtomicU64,
    fail_connect: AtomicBool,
    fail_children: AtomicBool,
}

impl StoreInner {
    fn node_exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.lock().contains_key(path)
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .lock()
            .keys()
            .filter(|p| {
                p.starts_with(&prefix)
                    && !p[prefix.len()..].is_empty()
                    && !p[prefix.len()..].contains('/')
            })
            .map(|p| p[prefix.len()..].to_string())
            .collect()
    }

    /// Drain armed watches on `parent` and deliver the one-shot fire.
    fn fire_children_changed(&self, parent: &str) {
        let armed: Vec<u64> = self
            .watches
            .lock()
            .remove(parent)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if armed.is_empty() {
            return;
        }
        let sessions = self.sessions.lock();
        for id in armed {
            if let Some(meta) = sessions.get(&id) {
                if meta.alive.load(Ordering::SeqCst) {
                    let _ = meta.events.try_send(StoreEvent::ChildrenChanged {
                        path: parent.to_string(),
                    });
                }
            }
        }
    }

    fn end_session(&self, id: u64, expired: bool) {
        let meta = match self.sessions.lock().get(&id) {
            Some(meta) => SessionMeta {
                events: meta.events.clone(),
                alive: Arc::clone(&meta.alive),
            },
            None => return,
        };
        if !meta.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        // the dead session's watches never fire again
        for set in self.watches.lock().values_mut() {
            set.remove(&id);
        }

        // ephemeral nodes vanish with their owning session
        let removed: Vec<String> = {
            let mut nodes = self.nodes.lock();
            let doomed: Vec<String> = nodes
                .iter()
                .filter(|(_, meta)| meta.mode == CreateMode::Ephemeral && meta.owner == id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &doomed {
                nodes.remove(path);
            }
            doomed
        };
        let mut parents: Vec<String> = removed.iter().map(|p| parent_of(p)).collect();
        parents.sort();
        parents.dedup();
        for parent in parents {
            self.fire_children_changed(&parent);
        }

        if expired {
            let _ = meta
                .events
                .try_send(StoreEvent::Session(SessionState::Expired));
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Shared fake ensemble. Clone-cheap; all sessions see the same namespace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        Arc::new(MemorySessionFactory {
            inner: Arc::clone(&self.inner),
        })
    }

    // - failure injection

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every watched read fail with a lost connection.
    pub fn set_fail_children(&self, fail: bool) {
        self.inner.fail_children.store(fail, Ordering::SeqCst);
    }

    // - session control

    /// Expire every live session, as the ensemble would on timeout.
    pub fn expire_sessions(&self) {
        let ids: Vec<u64> = self.inner.sessions.lock().keys().copied().collect();
        for id in ids {
            self.inner.end_session(id, true);
        }
    }

    /// Deliver a resync notification to every live session.
    pub fn fire_sync_connected(&self) {
        let sessions = self.inner.sessions.lock();
        for meta in sessions.values() {
            if meta.alive.load(Ordering::SeqCst) {
                let _ = meta
                    .events
                    .try_send(StoreEvent::Session(SessionState::SyncConnected));
            }
        }
    }

    // - inspection

    pub fn connect_count(&self) -> u64 {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.inner.node_exists(path)
    }

    /// Raw (still encoded) child names.
    pub fn raw_children(&self, path: &str) -> Vec<String> {
        self.inner.children_of(path)
    }

    /// Decoded child names.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner
            .children_of(path)
            .iter()
            .map(|c| paths::decode(c))
            .collect()
    }
}

struct MemorySessionFactory {
    inner: Arc<StoreInner>,
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn connect(
        &self,
        _connect_string: &str,
        _timeout: Duration,
        events: mpsc::Sender<StoreEvent>,
    ) -> StoreResult<Arc<dyn ZkSession>> {
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.inner.sessions.lock().insert(
            id,
            SessionMeta {
                events,
                alive: Arc::clone(&alive),
            },
        );
        Ok(Arc::new(MemorySession {
            id,
            alive,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySession {
    id: u64,
    alive: Arc<AtomicBool>,
    inner: Arc<StoreInner>,
}

impl MemorySession {
    fn check_alive(&self) -> StoreResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::SessionExpired)
        }
    }
}

#[async_trait]
impl ZkSession for MemorySession {
    async fn create(&self, path: &str, mode: CreateMode, _acl: Acl) -> StoreResult<()> {
        self.check_alive()?;
        let parent = parent_of(path);
        if !self.inner.node_exists(&parent) {
            return Err(StoreError::NoNode(parent));
        }
        {
            let mut nodes = self.inner.nodes.lock();
            if nodes.contains_key(path) {
                return Err(StoreError::NodeExists(path.to_string()));
            }
            nodes.insert(
                path.to_string(),
                NodeMeta {
                    mode,
                    owner: self.id,
                },
            );
        }
        self.inner.fire_children_changed(&parent);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.check_alive()?;
        if self.inner.nodes.lock().remove(path).is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        self.inner.fire_children_changed(&parent_of(path));
        Ok(())
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.check_alive()?;
        Ok(self.inner.node_exists(path))
    }

    async fn children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        self.check_alive()?;
        if self.inner.fail_children.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        if !self.inner.node_exists(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if watch {
            self.inner
                .watches
                .lock()
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(self.inner.children_of(path))
    }

    async fn add_auth(&self, _username: &str, _password: &str) -> StoreResult<()> {
        self.check_alive()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.end_session(self.id, false);
        Ok(())
    }
}

/// Collects every delivered URL set.
#[derive(Default)]
pub struct RecordingListener {
    deliveries: Mutex<Vec<Vec<ServiceUrl>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Vec<ServiceUrl>> {
        self.deliveries.lock().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn last(&self) -> Option<Vec<ServiceUrl>> {
        self.deliveries.lock().last().cloned()
    }
}

impl NotifyListener for RecordingListener {
    fn notify(&self, urls: Vec<ServiceUrl>) {
        self.deliveries.lock().push(urls);
    }
}

/// A registry wired to the given store. Retries are driven manually in
/// tests, so the failback period is pushed out of the way.
pub async fn connect_registry(
    store: &MemoryStore,
    group: Option<&str>,
) -> Arc<crate::registry::ZkRegistry> {
    let mut cfg = crate::config::RegistryConfig::new("zk1:2181");
    cfg.group = group.map(str::to_string);
    cfg.retry_period_ms = 60_000;
    crate::registry::ZkRegistry::connect(cfg, store.factory())
        .await
        .expect("registry connect failed")
}

/// Let the event pump drain. Tests pause the clock, so this is a scheduling
/// point rather than a real wait.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Canonical, order-independent view of one delivery.
pub fn url_strings(urls: &[ServiceUrl]) -> Vec<String> {
    let mut rendered: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
    rendered.sort();
    rendered
}
