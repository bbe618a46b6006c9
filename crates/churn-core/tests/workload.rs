use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use churn_core::transport::{ConnectOptions, LocalBroker, Transport};
use churn_core::{
    Action, ChurnOptions, RandomStrategy, RunPlan, RunReport, ScriptedStrategy, Strategy,
    SupervisorError, Workload,
};
use churn_events::{AuditEvent, ClientId, EventKind, MemoryStore};
use churn_topics::TopicUniverse;
use rand::rngs::StdRng;
use rand::SeedableRng;

const CLIENT: &str = "ClientW8";

fn plan(iterations: u64, churn: Option<ChurnOptions>) -> RunPlan {
    RunPlan {
        iterations,
        connect: ConnectOptions {
            host: "localhost".into(),
            port: 8883,
            keep_alive: Duration::from_secs(60),
            client_id: CLIENT.into(),
        },
        pacing: Duration::from_secs(1),
        settle_delay: Duration::from_secs(2),
        warmup: Duration::ZERO,
        churn,
        log_topic: "connection/logs".into(),
        disconnect_topic: "disconnection/logs".into(),
    }
}

fn universe(n: usize, seed: u64) -> TopicUniverse {
    TopicUniverse::generate(n, &mut StdRng::seed_from_u64(seed))
}

async fn run<S: Strategy>(
    broker: &LocalBroker,
    store: &Arc<MemoryStore>,
    plan: RunPlan,
    universe: TopicUniverse,
    strategy: S,
) -> Result<RunReport, SupervisorError> {
    let transport: Arc<dyn Transport> = Arc::new(broker.transport().await);
    Workload::new(
        plan,
        ClientId::new(CLIENT),
        universe,
        transport,
        store.clone(),
        strategy,
    )
    .run()
    .await
}

fn is_action(ev: &AuditEvent) -> bool {
    matches!(
        ev.event_type,
        EventKind::Subscribe | EventKind::Unsubscribe | EventKind::Publish
    )
}

#[tokio::test(start_paused = true)]
async fn five_publishes_over_five_topics() {
    let broker = LocalBroker::new();
    let store = Arc::new(MemoryStore::new());
    let topics = universe(5, 11);
    let known: HashSet<String> = topics.iter().map(str::to_string).collect();

    let report = run(
        &broker,
        &store,
        plan(5, None),
        topics,
        ScriptedStrategy::always(Action::Publish),
    )
    .await
    .unwrap();

    assert_eq!(report.metrics.success_count, 5);
    assert_eq!(report.metrics.failure_count, 0);
    let events = store.events().await;
    let publishes: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventKind::Publish)
        .collect();
    assert_eq!(publishes.len(), 5);
    assert!(publishes.iter().all(|e| known.contains(&e.topic)));
    for e in &publishes {
        assert_eq!(e.message.len(), 5);
        assert!(e.message.chars().all(|c| c.is_ascii_lowercase()));
    }

    // one CONNECT from the initial connect, one DISCONNECT from the final one
    assert_eq!(report.aggregate.connect_count, 1);
    assert_eq!(report.aggregate.disconnect_count, 1);
    assert_eq!(report.aggregate.current_status, Some(EventKind::Disconnect));
    assert_eq!(report.metrics.disconnect_count, 1);
    assert_eq!(report.client_id, CLIENT);
}

#[tokio::test(start_paused = true)]
async fn action_count_matches_iterations() {
    for (n, seed) in [(0u64, 1u64), (1, 2), (9, 3), (24, 4)] {
        let broker = LocalBroker::new();
        let store = Arc::new(MemoryStore::new());
        let topics = universe(4, seed);
        let known: HashSet<String> = topics.iter().map(str::to_string).collect();

        let report = run(
            &broker,
            &store,
            plan(n, None),
            topics,
            RandomStrategy::seeded(seed),
        )
        .await
        .unwrap();

        assert_eq!(report.metrics.actions(), n, "n = {n}");
        let actions: Vec<_> = store
            .events()
            .await
            .into_iter()
            .filter(is_action)
            .collect();
        assert_eq!(actions.len() as u64, report.metrics.success_count);
        assert!(actions.iter().all(|e| known.contains(&e.topic)));
    }
}

#[tokio::test(start_paused = true)]
async fn churn_shorter_than_run_disconnects_and_recovers() {
    let broker = LocalBroker::new();
    let store = Arc::new(MemoryStore::new());
    let churn = ChurnOptions {
        interval: Duration::from_millis(2500),
        reconnect_timeout: Duration::from_secs(1),
    };

    let report = run(
        &broker,
        &store,
        plan(10, Some(churn)),
        universe(3, 5),
        ScriptedStrategy::always(Action::Publish),
    )
    .await
    .unwrap();

    assert_eq!(report.metrics.actions(), 10);
    // the action issued at t=3s lands inside the first disconnected window
    assert!(report.metrics.failure_count >= 1);
    assert!(report.churn_cycles >= 1);

    let events = store.events().await;
    let first_disconnect = events
        .iter()
        .position(|e| e.event_type == EventKind::Disconnect)
        .expect("a forced disconnect is recorded");
    assert!(events[first_disconnect..]
        .iter()
        .any(|e| e.event_type == EventKind::Publish));
    assert!(report.aggregate.connect_count >= 2);
}

#[tokio::test(start_paused = true)]
async fn refused_connect_is_fatal() {
    let broker = LocalBroker::new();
    let store = Arc::new(MemoryStore::new());
    broker.refuse_next_connects(1);

    let err = run(
        &broker,
        &store,
        plan(3, None),
        universe(3, 6),
        ScriptedStrategy::always(Action::Publish),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SupervisorError::Connect(_)));
    assert!(broker.published().await.is_empty());
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn local_subscription_set_outlives_churn() {
    let broker = LocalBroker::new();
    let store = Arc::new(MemoryStore::new());
    let churn = ChurnOptions {
        interval: Duration::from_millis(1500),
        reconnect_timeout: Duration::from_millis(500),
    };

    let report = run(
        &broker,
        &store,
        plan(3, Some(churn)),
        TopicUniverse::from_topics(vec!["home/kitchen/fire".into()]),
        ScriptedStrategy::always(Action::Subscribe),
    )
    .await
    .unwrap();

    // local bookkeeping still believes the topic is subscribed
    assert_eq!(report.subscriptions, 1);
    assert!(report.metrics.success_count >= 1);
}
