use super::*;
use crate::test_utils::connect_registry;
use crate::test_utils::settle;
use crate::test_utils::url_strings;
use crate::test_utils::MemoryStore;
use crate::test_utils::RecordingListener;
use crate::url::ServiceUrl;

fn provider(n: u32) -> ServiceUrl {
    format!("dubbo://10.0.0.{n}:20880/com.foo.Greeter?version=1.0")
        .parse()
        .unwrap()
}

fn consumer() -> ServiceUrl {
    "consumer://10.1.1.1/com.foo.Greeter?register=false".parse().unwrap()
}

#[tokio::test]
async fn test_expiry_reconnects_and_replays_registrations() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider(1)).await.unwrap();
    store.expire_sessions();
    settle().await;

    // the pump reconnected on its own; the ephemeral node died with the
    // old session and waits for the failback pass
    assert_eq!(store.connect_count(), 2);
    assert!(registry.is_available());
    assert!(store.children("/dubbo/com.foo.Greeter").is_empty());
    assert!(registry.has_pending());

    registry.retry().await.unwrap();
    assert_eq!(store.children("/dubbo/com.foo.Greeter"), vec![provider(1).to_string()]);

    // replaying the same registration again yields the same single node
    registry.retry().await.unwrap();
    assert_eq!(store.children("/dubbo/com.foo.Greeter").len(), 1);
}

#[tokio::test]
async fn test_route_providers_survive_expiry() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    let route: ServiceUrl = "route://0.0.0.0/com.foo.Greeter?rule=host".parse().unwrap();
    registry.register(&route).await.unwrap();
    registry.register(&provider(1)).await.unwrap();

    store.expire_sessions();
    settle().await;

    let children = store.children("/dubbo/com.foo.Greeter");
    assert_eq!(children, vec![route.to_string()]);
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions_and_rearms_watches() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider(1)).await.unwrap();
    let listener = RecordingListener::new();
    registry.subscribe(&consumer(), listener.clone()).await.unwrap();
    assert_eq!(listener.delivery_count(), 1);

    store.expire_sessions();
    settle().await;
    registry.retry().await.unwrap();
    settle().await;

    // the replayed registration and subscription reconverge on the new
    // session: the provider node is back and the listener saw it again
    assert_eq!(store.children("/dubbo/com.foo.Greeter"), vec![provider(1).to_string()]);
    assert!(listener.delivery_count() >= 2);

    // the re-armed watch observes changes made after the reconnect
    let before = listener.delivery_count();
    registry.register(&provider(2)).await.unwrap();
    settle().await;
    assert_eq!(listener.delivery_count(), before + 1);
    assert_eq!(
        url_strings(&listener.last().unwrap()),
        vec![provider(1).to_string(), provider(2).to_string()]
    );
}

#[tokio::test]
async fn test_sync_connected_triggers_recovery_without_new_session() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider(1)).await.unwrap();
    store.fire_sync_connected();
    settle().await;

    assert_eq!(store.connect_count(), 1);
    // the resync marked the desired state for replay; draining it leaves
    // exactly one node
    registry.retry().await.unwrap();
    assert_eq!(store.children("/dubbo/com.foo.Greeter").len(), 1);
}

#[tokio::test]
async fn test_failed_watch_is_rearmed_by_retry_pass() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider(1)).await.unwrap();
    let listener = RecordingListener::new();
    registry.subscribe(&consumer(), listener.clone()).await.unwrap();
    assert_eq!(listener.delivery_count(), 1);

    // the fire arrives but re-arming fails: the path goes into the failed
    // set and the change is silently dropped
    store.set_fail_children(true);
    registry.register(&provider(2)).await.unwrap();
    settle().await;
    assert_eq!(listener.delivery_count(), 1);
    assert!(registry.has_pending());

    store.set_fail_children(false);
    registry.retry().await.unwrap();
    assert!(!registry.has_pending());

    // subsequent real changes are observed again
    registry.register(&provider(3)).await.unwrap();
    settle().await;
    assert_eq!(listener.delivery_count(), 2);
    assert_eq!(
        url_strings(&listener.last().unwrap()),
        vec![
            provider(1).to_string(),
            provider(2).to_string(),
            provider(3).to_string()
        ]
    );
}

#[tokio::test]
async fn test_retry_reconnects_when_session_creation_failed() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;

    registry.register(&provider(1)).await.unwrap();

    store.set_fail_connect(true);
    store.expire_sessions();
    settle().await;
    assert!(!registry.is_available());
    assert!(registry.retry().await.is_err());

    // one later pass both reconnects and replays
    store.set_fail_connect(false);
    registry.retry().await.unwrap();
    assert!(registry.is_available());
    assert_eq!(store.children("/dubbo/com.foo.Greeter"), vec![provider(1).to_string()]);
}

#[tokio::test]
async fn test_has_pending_reflects_failback_state() {
    tokio::time::pause();
    let store = MemoryStore::new();
    let registry = connect_registry(&store, Some("dubbo")).await;
    assert!(!registry.has_pending());

    registry.register(&provider(1)).await.unwrap();
    store.expire_sessions();
    settle().await;
    assert!(registry.has_pending());

    registry.retry().await.unwrap();
    assert!(!registry.has_pending());
}
