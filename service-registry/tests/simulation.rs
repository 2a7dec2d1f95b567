//! Multi-node simulation tests for service-registry.
//!
//! Each simulated node owns its own session against a shared in-memory
//! coordination store, the same way separate processes would share one
//! coordination service.

use service_registry::{
    CoordinationStore, MemorySession, MemoryStore, Registration, RegistryRoot, Role,
    RoleTransitionHandler, ServiceRegistry, Unregistration, DEFAULT_REGISTRY_ROOT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,service_registry=debug")
        .try_init();
}

struct Node {
    session: Arc<MemorySession>,
    registry: Arc<ServiceRegistry>,
    handler: RoleTransitionHandler,
    cancel: CancellationToken,
    watch: JoinHandle<()>,
}

impl Node {
    async fn start(store: &MemoryStore, host: &str) -> Self {
        let (session, events) = store.connect();
        let registry = Arc::new(ServiceRegistry::new(session.clone()));
        registry.ensure_registry_exists().await.unwrap();

        let cancel = CancellationToken::new();
        let watch = ServiceRegistry::spawn_watch_task(registry.clone(), events, cancel.clone());
        let handler =
            RoleTransitionHandler::new(registry.clone(), 8080).with_advertised_host(host);

        Self {
            session,
            registry,
            handler,
            cancel,
            watch,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.watch.await;
    }
}

fn sorted(addresses: &[String]) -> Vec<String> {
    let mut v = addresses.to_vec();
    v.sort();
    v
}

/// Poll the cache until it matches `expected` (order ignored).
async fn wait_for_addresses(registry: &ServiceRegistry, expected: &[&str]) -> Vec<String> {
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();

    let mut seen = Vec::new();
    for _ in 0..300 {
        seen = registry
            .cached_addresses()
            .map(|a| sorted(&a))
            .unwrap_or_default();
        if seen == expected {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    seen
}

#[tokio::test]
async fn test_end_to_end_leader_observes_workers() {
    init_tracing();
    let store = MemoryStore::new();

    // Parent node is absent until the first node ensures it
    let (probe, _probe_rx) = store.connect();
    assert!(probe.exists(DEFAULT_REGISTRY_ROOT).await.unwrap().is_none());
    assert_eq!(
        ServiceRegistry::new(probe.clone()).ensure_registry_exists().await.unwrap(),
        RegistryRoot::Created
    );

    let worker1 = Node::start(&store, "h1").await;
    let worker2 = Node::start(&store, "h2").await;
    let leader = Node::start(&store, "leader").await;

    worker1.handler.apply(Role::Worker).await;
    worker2.handler.apply(Role::Worker).await;
    leader.handler.apply(Role::Leader).await;

    let addresses = leader.registry.addresses().await.unwrap();
    assert_eq!(sorted(&addresses), vec!["http://h1:8080", "http://h2:8080"]);

    // Worker 1 loses its session; the watch-triggered refresh drops it
    worker1.session.expire();
    let seen = wait_for_addresses(&leader.registry, &["http://h2:8080"]).await;
    assert_eq!(seen, vec!["http://h2:8080"]);

    worker1.stop().await;
    worker2.stop().await;
    leader.stop().await;
}

#[tokio::test]
async fn test_watch_stays_armed_across_many_changes() {
    init_tracing();
    let store = MemoryStore::new();
    let leader = Node::start(&store, "leader").await;
    leader.handler.apply(Role::Leader).await;

    let mut workers = Vec::new();
    let mut expected = Vec::new();
    for i in 0..10 {
        let host = format!("w{}", i);
        let worker = Node::start(&store, &host).await;
        worker.handler.apply(Role::Worker).await;
        expected.push(format!("http://{}:8080", host));
        workers.push(worker);

        let want: Vec<&str> = expected.iter().map(String::as_str).collect();
        let seen = wait_for_addresses(&leader.registry, &want).await;
        assert_eq!(seen.len(), i + 1, "leader missed join #{}", i + 1);
    }

    // Leaves are observed as well
    for _ in 0..5 {
        let worker = workers.remove(0);
        worker.session.expire();
        expected.remove(0);
        worker.stop().await;

        let want: Vec<&str> = expected.iter().map(String::as_str).collect();
        let seen = wait_for_addresses(&leader.registry, &want).await;
        assert_eq!(seen.len(), expected.len());
    }

    for worker in workers {
        worker.stop().await;
    }
    leader.stop().await;
}

#[tokio::test]
async fn test_promoted_worker_disappears_from_every_view() {
    init_tracing();
    let store = MemoryStore::new();
    let old_leader_view = Node::start(&store, "observer").await;
    old_leader_view.handler.apply(Role::Leader).await;

    let promoted = Node::start(&store, "h1").await;
    let other = Node::start(&store, "h2").await;
    promoted.handler.apply(Role::Worker).await;
    other.handler.apply(Role::Worker).await;

    let seen = wait_for_addresses(
        &old_leader_view.registry,
        &["http://h1:8080", "http://h2:8080"],
    )
    .await;
    assert_eq!(seen.len(), 2);

    promoted.handler.apply(Role::Leader).await;

    // The new leader's first snapshot already excludes itself
    assert_eq!(
        *promoted.registry.cached_addresses().unwrap(),
        vec!["http://h2:8080"]
    );
    assert!(!promoted.registry.is_registered().await);

    // And so does every other node's view
    let seen = wait_for_addresses(&old_leader_view.registry, &["http://h2:8080"]).await;
    assert_eq!(seen, vec!["http://h2:8080"]);
    assert_eq!(*other.registry.refresh().await.unwrap(), vec!["http://h2:8080"]);

    promoted.stop().await;
    other.stop().await;
    old_leader_view.stop().await;
}

#[tokio::test]
async fn test_concurrent_root_creation_is_benign() {
    let store = MemoryStore::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let (session, _rx) = store.connect();
        handles.push(tokio::spawn(async move {
            ServiceRegistry::new(session).ensure_registry_exists().await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_watch_recovers_after_transient_failures() {
    init_tracing();
    let store = MemoryStore::new();
    let leader = Node::start(&store, "leader").await;
    leader.handler.apply(Role::Leader).await;

    // The refresh triggered by the next join fails twice, then succeeds
    leader.session.fail_next(2);
    let worker = Node::start(&store, "h1").await;
    worker.handler.apply(Role::Worker).await;

    let seen = wait_for_addresses(&leader.registry, &["http://h1:8080"]).await;
    assert_eq!(seen, vec!["http://h1:8080"]);

    // Watch was re-armed by the successful retry
    let worker2 = Node::start(&store, "h2").await;
    worker2.handler.apply(Role::Worker).await;
    let seen = wait_for_addresses(&leader.registry, &["http://h1:8080", "http://h2:8080"]).await;
    assert_eq!(seen.len(), 2);

    worker.stop().await;
    worker2.stop().await;
    leader.stop().await;
}

#[tokio::test]
async fn test_session_loss_clears_local_registration() {
    init_tracing();
    let store = MemoryStore::new();
    let worker = Node::start(&store, "h1").await;
    worker.handler.apply(Role::Worker).await;
    assert!(worker.registry.is_registered().await);

    worker.session.expire();

    let mut registered = true;
    for _ in 0..100 {
        registered = worker.registry.is_registered().await;
        if !registered {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!registered);
    assert_eq!(
        worker.registry.unregister().await.unwrap(),
        Unregistration::NotRegistered
    );

    worker.stop().await;
}

#[tokio::test]
async fn test_double_worker_assignment_registers_once() {
    let store = MemoryStore::new();
    let worker = Node::start(&store, "h1").await;

    worker.handler.apply(Role::Worker).await;
    let second = worker.handler.become_worker().await.unwrap();
    assert!(matches!(second, Registration::AlreadyRegistered(_)));

    let (observer, _rx) = store.connect();
    let observer = ServiceRegistry::new(observer);
    assert_eq!(*observer.addresses().await.unwrap(), vec!["http://h1:8080"]);

    worker.stop().await;
}

#[tokio::test]
async fn test_session_loss_noticed_while_refresh_keeps_failing() {
    init_tracing();
    let store = MemoryStore::new();
    let worker = Node::start(&store, "h1").await;
    worker.handler.apply(Role::Worker).await;
    worker.registry.subscribe_to_updates().await.unwrap();

    // A change notification is queued, then the session dies before the
    // watch task gets to refresh
    let peer = Node::start(&store, "h2").await;
    peer.handler.apply(Role::Worker).await;
    worker.session.expire();

    let mut registered = true;
    for _ in 0..300 {
        registered = worker.registry.is_registered().await;
        if !registered {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!registered);

    worker.stop().await;
    peer.stop().await;
}

#[tokio::test]
async fn test_promotion_retries_transient_unregister_failure() {
    init_tracing();
    let store = MemoryStore::new();
    let node = Node::start(&store, "h1").await;
    node.handler.apply(Role::Worker).await;

    node.session.fail_next(1);
    node.handler.apply(Role::Leader).await;

    assert!(!node.registry.is_registered().await);
    assert!(node.registry.cached_addresses().unwrap().is_empty());

    let (observer, _rx) = store.connect();
    assert!(ServiceRegistry::new(observer).addresses().await.unwrap().is_empty());

    node.stop().await;
}
