use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::*;
use crate::MemoryStore;

fn manager(store: &Arc<MemoryStore<TestSecret>>) -> SubscriptionManager<TestSecret> {
    let multiplexer = KeyedMultiplexer::new(as_store(store), fast_config(), CancellationToken::new());
    SubscriptionManager::new(Arc::new(multiplexer))
}

fn owner(name: &str) -> OwnerKey {
    OwnerKey::new("ns1", name)
}

#[tokio::test]
#[traced_test]
async fn register_resolves_target_in_owner_namespace() {
    let store = fake_store();
    let secret = store.apply(TestSecret::new("ns1", "s1"));
    store.apply(TestSecret::new("ns2", "s1"));
    let manager = manager(&store);

    manager.register(owner("o1"), "s1", &CancellationToken::new()).await.unwrap();

    assert!(manager.is_registered(&owner("o1")).await);
    assert_eq!(manager.registered_target(&owner("o1")).await, Some(secret.key()));
    assert_eq!(manager.get_current(&owner("o1")).await.unwrap(), secret);
    assert!(logs_contain("owner registered"));
}

#[tokio::test]
async fn second_register_for_same_owner_is_rejected() {
    let store = fake_store();
    let s1 = store.apply(TestSecret::new("ns1", "s1"));
    store.apply(TestSecret::new("ns1", "s2"));
    let manager = manager(&store);
    let cancel = CancellationToken::new();

    manager.register(owner("o1"), "s1", &cancel).await.unwrap();
    let err = manager.register(owner("o1"), "s2", &cancel).await.unwrap_err();

    assert!(err.is_already_exists());
    assert_eq!(manager.get_current(&owner("o1")).await.unwrap(), s1);
    assert!(!manager.multiplexer().contains(&ObjectKey::new("ns1", "s2")));
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn owners_referencing_one_object_share_its_stream() {
    let store = fake_store();
    let secret = store.apply(TestSecret::new("ns1", "shared"));
    let manager = manager(&store);
    let cancel = CancellationToken::new();

    manager.register(owner("o1"), "shared", &cancel).await.unwrap();
    manager.register(owner("o2"), "shared", &cancel).await.unwrap();

    let multiplexer = manager.multiplexer();
    assert_eq!(multiplexer.active_streams(), 1);
    assert_eq!(multiplexer.refcount(&secret.key()), 2);
    assert_eq!(store.list_calls(), 1);

    manager.unregister(&owner("o1")).await.unwrap();
    assert_eq!(multiplexer.refcount(&secret.key()), 1);
    assert_eq!(manager.get_current(&owner("o2")).await.unwrap(), secret);

    manager.unregister(&owner("o2")).await.unwrap();
    assert_eq!(multiplexer.active_streams(), 0);
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn unregister_unknown_owner_is_not_found() {
    let store = fake_store();
    let manager = manager(&store);

    let err = manager.unregister(&owner("ghost")).await.unwrap_err();

    assert!(matches!(err, Error::NotFound(NotFoundError::Owner(_))));
    assert!(matches!(
        manager.get_current(&owner("ghost")).await,
        Err(Error::NotFound(NotFoundError::Owner(_)))
    ));
}

#[tokio::test]
async fn owner_can_register_again_after_unregister() {
    let store = fake_store();
    store.apply(TestSecret::new("ns1", "s1"));
    let s2 = store.apply(TestSecret::new("ns1", "s2"));
    let manager = manager(&store);
    let cancel = CancellationToken::new();

    manager.register(owner("o1"), "s1", &cancel).await.unwrap();
    manager.unregister(&owner("o1")).await.unwrap();
    manager.register(owner("o1"), "s2", &cancel).await.unwrap();

    assert_eq!(manager.get_current(&owner("o1")).await.unwrap(), s2);
    assert!(!manager.multiplexer().contains(&ObjectKey::new("ns1", "s1")));
}

#[tokio::test]
async fn invalid_owner_or_target_is_rejected() {
    let store = fake_store();
    let manager = manager(&store);
    let cancel = CancellationToken::new();

    assert!(matches!(
        manager.register(OwnerKey::new("", "o1"), "s1", &cancel).await,
        Err(Error::Validation(ValidationError::EmptyNamespace))
    ));
    assert!(matches!(
        manager.register(OwnerKey::new("ns1", ""), "s1", &cancel).await,
        Err(Error::Validation(ValidationError::EmptyOwner))
    ));
    assert!(matches!(
        manager.register(owner("o1"), "", &cancel).await,
        Err(Error::Validation(ValidationError::EmptyName))
    ));
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn failed_register_leaves_no_trace() {
    let store = fake_store();
    store.fail_next_lists(usize::MAX);
    let manager = manager(&store);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager.register(owner("o1"), "s1", &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)));
    assert!(!manager.is_registered(&owner("o1")).await);
    assert_eq!(manager.multiplexer().active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configured_handler_sees_target_changes() {
    let store = fake_store();
    let secret = store.apply(TestSecret::new("ns1", "s1"));
    let handler = Arc::new(RecordingHandler::new());
    let multiplexer = KeyedMultiplexer::new(as_store(&store), fast_config(), CancellationToken::new());
    let manager = SubscriptionManager::new(Arc::new(multiplexer)).with_handler(handler.clone());

    manager.register(owner("o1"), "s1", &CancellationToken::new()).await.unwrap();
    let updated = store.apply(secret.clone().with_data("k", b"v"));

    assert!(eventually(|| handler.updates() == 1).await);
    assert_eq!(
        handler.events(),
        vec![Recorded::Add(secret.clone()), Recorded::Update(secret, updated)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_target_reports_object_not_found() {
    let store = fake_store();
    let secret = store.apply(TestSecret::new("ns1", "s1"));
    let manager = manager(&store);

    manager.register(owner("o1"), "s1", &CancellationToken::new()).await.unwrap();
    store.delete(&secret.key());

    let manager = &manager;
    assert!(
        eventually_async(|| async move {
            manager
                .get_current(&owner("o1"))
                .await
                .is_err_and(|e| e.is_object_deleted())
        })
        .await
    );
    // the owner stays registered while its target is gone
    assert!(manager.is_registered(&owner("o1")).await);
}

#[tokio::test]
async fn owner_recovers_after_its_stream_is_stopped_externally() {
    let store = fake_store();
    let secret = store.apply(TestSecret::new("ns1", "s1"));
    let manager = manager(&store);
    let cancel = CancellationToken::new();

    manager.register(owner("o1"), "s1", &cancel).await.unwrap();
    manager.multiplexer().stream(&secret.key()).unwrap().stop();

    manager.unregister(&owner("o1")).await.unwrap();
    assert!(!manager.is_registered(&owner("o1")).await);
    assert!(!manager.multiplexer().contains(&secret.key()));

    manager.register(owner("o1"), "s1", &cancel).await.unwrap();
    assert_eq!(manager.get_current(&owner("o1")).await.unwrap(), secret);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_register_blocks_other_owners_until_it_resolves() {
    let store = fake_store();
    let secret = store.apply(TestSecret::new("ns1", "s1"));
    let config = crate::WatchConfig {
        sync_timeout_ms: 150,
        ..fast_config()
    };
    let multiplexer = KeyedMultiplexer::new(as_store(&store), config, CancellationToken::new());
    let manager = Arc::new(SubscriptionManager::new(Arc::new(multiplexer)));
    manager.register(owner("o1"), "s1", &CancellationToken::new()).await.unwrap();

    store.fail_next_lists(usize::MAX);
    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.register(owner("o2"), "s2", &CancellationToken::new()).await })
    };
    assert!(eventually(|| manager.multiplexer().contains(&ObjectKey::new("ns1", "s2"))).await);

    let started = std::time::Instant::now();
    assert_eq!(manager.get_current(&owner("o1")).await.unwrap(), secret);
    assert!(started.elapsed() >= std::time::Duration::from_millis(50));

    assert!(matches!(pending.await.unwrap(), Err(Error::SyncTimeout { .. })));
    assert!(!manager.is_registered(&owner("o2")).await);
}
