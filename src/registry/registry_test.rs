use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::*;
use crate::errors::Error;
use crate::store::MockSessionFactory;
use crate::store::MockZkSession;
use crate::store::StoreError;
use crate::store::ZkSession;
use crate::test_utils::connect_registry;
use crate::test_utils::settle;
use crate::test_utils::MemoryStore;
use crate::url::ServiceUrl;

fn provider() -> ServiceUrl {
    "dubbo://10.0.0.1:20880/com.foo.Greeter?version=1.0".parse().unwrap()
}

#[tokio::test]
async fn test_register_creates_service_and_provider_nodes() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider()).await.unwrap();

    assert!(store.node_exists("/dubbo"));
    assert!(store.node_exists("/dubbo/com.foo.Greeter"));
    assert_eq!(store.children("/dubbo/com.foo.Greeter"), vec![provider().to_string()]);
}

#[tokio::test]
async fn test_provider_segment_is_encoded() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider()).await.unwrap();

    let raw = store.raw_children("/dubbo/com.foo.Greeter");
    assert_eq!(raw.len(), 1);
    assert!(raw[0].starts_with("dubbo%3A%2F%2F10.0.0.1%3A20880"));
}

#[tokio::test]
async fn test_register_without_group() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, None).await;

    registry.register(&provider()).await.unwrap();

    assert!(store.node_exists("/com.foo.Greeter"));
    assert_eq!(store.children("/com.foo.Greeter").len(), 1);
}

#[tokio::test]
async fn test_register_twice_yields_one_node() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider()).await.unwrap();
    registry.register(&provider()).await.unwrap();

    assert_eq!(store.children("/dubbo/com.foo.Greeter").len(), 1);
}

#[tokio::test]
async fn test_unregister_keeps_service_node() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider()).await.unwrap();
    registry.unregister(&provider()).await.unwrap();

    assert!(store.node_exists("/dubbo/com.foo.Greeter"));
    assert!(store.children("/dubbo/com.foo.Greeter").is_empty());
}

#[tokio::test]
async fn test_unregister_missing_provider_is_not_an_error() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.unregister(&provider()).await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_surfaces_as_session_error() {
    tokio::time::pause();
    let store = MemoryStore::new();
    store.set_fail_connect(true);

    let cfg = crate::config::RegistryConfig::new("zk1:2181");
    let result = ZkRegistry::connect(cfg, store.factory()).await;
    assert!(matches!(result, Err(Error::Session(_))));
}

#[tokio::test]
async fn test_is_available_tracks_session_liveness() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, None).await;
    assert!(registry.is_available());

    registry.destroy().await;
    assert!(!registry.is_available());
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_blocks_operations() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, None).await;

    registry.destroy().await;
    registry.destroy().await;

    assert!(matches!(registry.register(&provider()).await, Err(Error::Destroyed)));
    assert!(matches!(
        registry.ensure_connected().await,
        Err(Error::Destroyed)
    ));
}

#[tokio::test]
async fn test_destroy_releases_ephemeral_nodes() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider()).await.unwrap();
    registry.destroy().await;
    settle().await;

    assert!(store.children("/dubbo/com.foo.Greeter").is_empty());
}

#[tokio::test]
async fn test_concurrent_reconnect_creates_exactly_one_session() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;
    assert_eq!(store.connect_count(), 1);

    store.expire_sessions();
    // racing triggers: two caller-side retries plus the expiry event that
    // the pump handles on its own
    let (a, b) = tokio::join!(registry.ensure_connected(), registry.ensure_connected());
    a.unwrap();
    b.unwrap();
    settle().await;

    assert_eq!(store.connect_count(), 2);
    assert!(registry.is_available());
}

#[tokio::test]
async fn test_ensure_connected_is_a_noop_while_alive() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, None).await;

    registry.ensure_connected().await.unwrap();
    registry.ensure_connected().await.unwrap();
    assert_eq!(store.connect_count(), 1);
}

// -
// Race handling against a mocked session

fn mock_factory(session: MockZkSession) -> Arc<MockSessionFactory> {
    let session: Arc<dyn ZkSession> = Arc::new(session);
    let mut factory = MockSessionFactory::new();
    factory
        .expect_connect()
        .returning(move |_, _, _| Ok(Arc::clone(&session)));
    Arc::new(factory)
}

#[tokio::test]
async fn test_register_resolves_create_race_by_delete_and_recreate() {
    tokio::time::pause();
    let url = provider();
    let service_path = "/com.foo.Greeter".to_string();
    let provider_path = format!("{service_path}/{}", crate::paths::encode(&url.to_string()));

    let mut session = MockZkSession::new();
    session.expect_is_alive().return_const(true);
    {
        let service_path = service_path.clone();
        session
            .expect_exists()
            .withf(move |path| path == service_path)
            .returning(|_| Ok(true));
    }
    {
        let provider_path = provider_path.clone();
        session
            .expect_exists()
            .withf(move |path| path == provider_path)
            .returning(|_| Ok(false));
    }
    // first create loses the race, the retry after delete wins
    let attempts = AtomicUsize::new(0);
    {
        let provider_path = provider_path.clone();
        session
            .expect_create()
            .withf(move |path, _, _| path == provider_path)
            .times(2)
            .returning(move |path, _, _| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::NodeExists(path.to_string()))
                } else {
                    Ok(())
                }
            });
    }
    session
        .expect_delete()
        .withf(move |path| path == provider_path)
        .times(1)
        .returning(|_| Ok(()));

    let cfg = crate::config::RegistryConfig::new("zk1:2181");
    let registry = ZkRegistry::connect(cfg, mock_factory(session)).await.unwrap();

    registry.register(&url).await.unwrap();
}

#[tokio::test]
async fn test_register_wraps_unexpected_store_errors() {
    tokio::time::pause();
    let url = provider();

    let mut session = MockZkSession::new();
    session.expect_is_alive().return_const(true);
    session
        .expect_exists()
        .returning(|path| Err(StoreError::Other(format!("fault reading {path}"))));

    let cfg = crate::config::RegistryConfig::new("zk1:2181");
    let registry = ZkRegistry::connect(cfg, mock_factory(session)).await.unwrap();

    let err = registry.register(&url).await.unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
    // the failure is recorded for the failback pass
    assert!(registry.has_pending());
}
