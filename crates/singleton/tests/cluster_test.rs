//! Cluster singleton integration tests
//!
//! These run one provider per simulated node on top of the in-memory entity ownership
//! service, and check that each service group runs on at most one node at any time.

use assert_matches::assert_matches;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use proven_eos::EntityOwnershipErrorKind;
use proven_eos_memory::{MemoryCluster, MemoryEntityOwnershipService};
use proven_singleton::{
    BoxError, ClusterSingletonService, ClusterSingletonServiceProvider, Error, ProviderConfig,
    SERVICE_ENTITY_TYPE, ServiceGroupIdentifier, create_entity,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

/// Tracks how many instances of a group run across the whole cluster
#[derive(Clone, Default)]
struct ActivityTracker {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ActivityTracker {
    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Test service recording its lifecycle
struct TestService {
    identifier: ServiceGroupIdentifier,
    tracker: ActivityTracker,
    starts: AtomicUsize,
    stops: AtomicUsize,
    /// When present, the next stop completes only once the sender fires
    stop_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl TestService {
    fn new(identifier: &str, tracker: &ActivityTracker) -> Arc<Self> {
        Arc::new(Self {
            identifier: ServiceGroupIdentifier::new(identifier).unwrap(),
            tracker: tracker.clone(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            stop_gate: Mutex::new(None),
        })
    }

    fn gated(identifier: &str, tracker: &ActivityTracker) -> (Arc<Self>, oneshot::Sender<()>) {
        let service = Self::new(identifier, tracker);
        let (tx, rx) = oneshot::channel();
        *service.stop_gate.lock() = Some(rx);
        (service, tx)
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ClusterSingletonService for TestService {
    fn identifier(&self) -> &ServiceGroupIdentifier {
        &self.identifier
    }

    fn instantiate_service_instance(&self) -> Result<(), BoxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let now = self.tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.max_active.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    fn close_service_instance(
        &self,
    ) -> Result<BoxFuture<'static, Result<(), BoxError>>, BoxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.tracker.active);

        match self.stop_gate.lock().take() {
            Some(gate) => Ok(gate
                .map(move |_| {
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .boxed()),
            None => {
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(futures::future::ready(Ok(())).boxed())
            }
        }
    }
}

/// A provider bound to one simulated node
struct TestNode {
    eos: MemoryEntityOwnershipService,
    provider: ClusterSingletonServiceProvider<MemoryEntityOwnershipService>,
}

impl TestNode {
    fn new(cluster: &MemoryCluster) -> Self {
        let eos = cluster.node();
        let provider =
            ClusterSingletonServiceProvider::new(Arc::new(eos.clone()), ProviderConfig::default());
        Self { eos, provider }
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn identifier(value: &str) -> ServiceGroupIdentifier {
    ServiceGroupIdentifier::new(value).unwrap()
}

#[tokio::test]
#[traced_test]
async fn test_single_node_lifecycle() {
    let cluster = MemoryCluster::new();
    let node = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let service = TestService::new("lifecycle", &tracker);

    let registration = node
        .provider
        .register_cluster_singleton_service(service.clone())
        .unwrap();
    assert_eq!(service.starts(), 1);
    assert_eq!(
        cluster.owner(&create_entity(SERVICE_ENTITY_TYPE, &identifier("lifecycle"))),
        Some(node.eos.node_id())
    );

    registration.close();
    assert_eq!(service.stops(), 1);
    assert_eq!(tracker.active(), 0);
    assert!(!node.provider.has_service_group(&identifier("lifecycle")));

    // Closing twice does nothing.
    registration.close();
    assert_eq!(service.stops(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_handover_between_nodes() {
    let cluster = MemoryCluster::new();
    let first = TestNode::new(&cluster);
    let second = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let first_service = TestService::new("handover", &tracker);
    let second_service = TestService::new("handover", &tracker);

    let first_registration = first
        .provider
        .register_cluster_singleton_service(first_service.clone())
        .unwrap();
    let _second_registration = second
        .provider
        .register_cluster_singleton_service(second_service.clone())
        .unwrap();
    assert_eq!(first_service.starts(), 1);
    assert_eq!(second_service.starts(), 0);

    first_registration.close();

    wait_until(|| second_service.starts() == 1).await;
    assert_eq!(first_service.stops(), 1);
    assert_eq!(tracker.active(), 1);
    assert_eq!(tracker.max_active(), 1);
}

#[tokio::test]
async fn test_handover_waits_for_pending_stop() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let cluster = MemoryCluster::new();
    let first = TestNode::new(&cluster);
    let second = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let (first_service, gate) = TestService::gated("slow-stop", &tracker);
    let second_service = TestService::new("slow-stop", &tracker);

    let first_registration = first
        .provider
        .register_cluster_singleton_service(first_service.clone())
        .unwrap();
    let _second_registration = second
        .provider
        .register_cluster_singleton_service(second_service.clone())
        .unwrap();

    first_registration.close();
    assert_eq!(first_service.stops(), 1);

    // The second node owns the service entity now, but not the cleanup entity.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(second_service.starts(), 0);
    assert_eq!(
        cluster.owner(&create_entity(SERVICE_ENTITY_TYPE, &identifier("slow-stop"))),
        Some(second.eos.node_id())
    );

    gate.send(()).unwrap();
    wait_until(|| second_service.starts() == 1).await;
    assert_eq!(tracker.max_active(), 1);
    wait_until(|| !first.provider.has_service_group(&identifier("slow-stop"))).await;
}

#[tokio::test]
#[traced_test]
async fn test_jeopardy_stops_and_restarts() {
    let cluster = MemoryCluster::new();
    let node = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let service = TestService::new("jeopardy", &tracker);

    let _registration = node
        .provider
        .register_cluster_singleton_service(service.clone())
        .unwrap();
    assert_eq!(service.starts(), 1);

    cluster.set_jeopardy(node.eos.node_id(), true);
    assert_eq!(service.stops(), 1);
    assert_eq!(tracker.active(), 0);
    assert!(logs_contain("Cleanup entity ownership is in jeopardy"));

    cluster.set_jeopardy(node.eos.node_id(), false);
    assert_eq!(service.starts(), 2);
    assert!(logs_contain("ownership ascertained"));
}

#[tokio::test]
async fn test_reregistration_during_shutdown() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let cluster = MemoryCluster::new();
    let node = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let (old_service, gate) = TestService::gated("restart", &tracker);
    let new_service = TestService::new("restart", &tracker);

    let old_registration = node
        .provider
        .register_cluster_singleton_service(old_service.clone())
        .unwrap();
    old_registration.close();
    assert_eq!(old_service.stops(), 1);

    // Queued behind the group still shutting down.
    let _new_registration = node
        .provider
        .register_cluster_singleton_service(new_service.clone())
        .unwrap();
    assert_eq!(new_service.starts(), 0);
    assert!(node.provider.has_service_group(&identifier("restart")));

    gate.send(()).unwrap();
    wait_until(|| new_service.starts() == 1).await;
    assert_eq!(tracker.max_active(), 1);
}

#[tokio::test]
async fn test_withdrawn_during_shutdown_is_not_started() {
    let cluster = MemoryCluster::new();
    let node = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let (old_service, gate) = TestService::gated("withdrawn", &tracker);
    let new_service = TestService::new("withdrawn", &tracker);

    let old_registration = node
        .provider
        .register_cluster_singleton_service(old_service.clone())
        .unwrap();
    old_registration.close();

    let new_registration = node
        .provider
        .register_cluster_singleton_service(new_service.clone())
        .unwrap();
    new_registration.close();

    gate.send(()).unwrap();
    wait_until(|| !node.provider.has_service_group(&identifier("withdrawn"))).await;
    assert_eq!(new_service.starts(), 0);
}

#[tokio::test]
async fn test_duplicate_candidate_on_same_node() {
    let cluster = MemoryCluster::new();
    let eos = Arc::new(cluster.node());
    let first = ClusterSingletonServiceProvider::new(Arc::clone(&eos), ProviderConfig::default());
    let second = ClusterSingletonServiceProvider::new(eos, ProviderConfig::default());
    let tracker = ActivityTracker::default();

    let _registration = first
        .register_cluster_singleton_service(TestService::new("duplicate", &tracker))
        .unwrap();
    let result = second.register_cluster_singleton_service(TestService::new("duplicate", &tracker));

    assert_matches!(
        result,
        Err(Error::CandidateRegistration {
            kind: EntityOwnershipErrorKind::CandidateAlreadyRegistered,
            ..
        })
    );
    assert!(!second.has_service_group(&identifier("duplicate")));
    assert!(first.has_service_group(&identifier("duplicate")));
}

#[tokio::test]
#[traced_test]
async fn test_provider_close() {
    let cluster = MemoryCluster::new();
    let node = TestNode::new(&cluster);
    let tracker = ActivityTracker::default();
    let alpha = TestService::new("alpha", &tracker);
    let beta = TestService::new("beta", &tracker);

    let alpha_registration = node
        .provider
        .register_cluster_singleton_service(alpha.clone())
        .unwrap();
    let _beta_registration = node
        .provider
        .register_cluster_singleton_service(beta.clone())
        .unwrap();
    assert_eq!(tracker.active(), 2);

    timeout(Duration::from_secs(5), node.provider.close())
        .await
        .unwrap();
    assert_eq!(alpha.stops(), 1);
    assert_eq!(beta.stops(), 1);
    assert_eq!(tracker.active(), 0);
    assert!(!node.provider.has_service_group(&identifier("alpha")));

    // Idempotent, and the provider refuses further work.
    node.provider.close().await;
    assert_matches!(
        node.provider
            .register_cluster_singleton_service(TestService::new("gamma", &tracker)),
        Err(Error::ProviderClosed)
    );
    alpha_registration.close();
    assert_eq!(alpha.stops(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_groups_across_nodes() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let cluster = MemoryCluster::new();
    let nodes: Vec<_> = (0..3).map(|_| TestNode::new(&cluster)).collect();
    let trackers: Vec<_> = (0..8).map(|_| ActivityTracker::default()).collect();

    let mut registrations = Vec::new();
    for node in &nodes {
        for (index, tracker) in trackers.iter().enumerate() {
            let service = TestService::new(&format!("group-{index}"), tracker);
            registrations.push(
                node.provider
                    .register_cluster_singleton_service(service)
                    .unwrap(),
            );
        }
    }

    for tracker in &trackers {
        assert_eq!(tracker.active(), 1);
    }

    // Withdraw everything on the first node; every group moves elsewhere.
    for registration in registrations.iter().take(trackers.len()) {
        registration.close();
    }

    for tracker in &trackers {
        let tracker = tracker.clone();
        wait_until(move || tracker.active() == 1).await;
    }
    for tracker in &trackers {
        assert_eq!(tracker.max_active(), 1);
    }
}
