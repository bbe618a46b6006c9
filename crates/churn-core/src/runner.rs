use std::sync::Arc;
use std::time::{Duration, Instant};

use churn_events::{ClientAggregate, ClientId, EventStore};
use churn_topics::TopicUniverse;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, DEFAULT_ITERATIONS};
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::handler::MessageHandler;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::recorder::EventRecorder;
use crate::scheduler::{ActionScheduler, Strategy, SubscriptionSet};
use crate::supervisor::{ChurnOptions, ConnectionSupervisor, SupervisorError, SupervisorOptions};
use crate::transport::{ConnectOptions, Transport};

/// Everything a run needs to know besides its collaborators.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub iterations: u64,
    pub connect: ConnectOptions,
    pub pacing: Duration,
    pub settle_delay: Duration,
    pub warmup: Duration,
    /// `None` disables forced churn.
    pub churn: Option<ChurnOptions>,
    pub log_topic: String,
    pub disconnect_topic: String,
}

impl RunPlan {
    pub fn from_config(cfg: &Config, iterations: Option<u64>, client_id: &ClientId) -> Self {
        let churn = cfg.churn.enabled().then(|| ChurnOptions {
            interval: cfg.churn.interval(),
            reconnect_timeout: cfg.churn.reconnect_timeout(),
        });
        Self {
            iterations: iterations
                .or(cfg.run.iterations)
                .unwrap_or(DEFAULT_ITERATIONS),
            connect: ConnectOptions {
                host: cfg.broker.host().to_string(),
                port: cfg.broker.port(),
                keep_alive: cfg.broker.keep_alive(),
                client_id: client_id.to_string(),
            },
            pacing: cfg.run.pacing(),
            settle_delay: cfg.run.settle_delay(),
            warmup: cfg.run.warmup(),
            churn,
            log_topic: cfg.audit.log_topic().to_string(),
            disconnect_topic: cfg.audit.disconnect_topic().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub client_id: String,
    pub iterations: u64,
    pub elapsed_seconds: f64,
    pub metrics: MetricsSnapshot,
    /// Size of the local subscription set at the end of the run.
    pub subscriptions: usize,
    pub churn_cycles: u64,
    pub aggregate: ClientAggregate,
}

/// One configured workload run over a transport and an event store.
pub struct Workload<S> {
    plan: RunPlan,
    client_id: ClientId,
    universe: Arc<TopicUniverse>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EventStore>,
    strategy: S,
}

impl<S: Strategy> Workload<S> {
    pub fn new(
        plan: RunPlan,
        client_id: ClientId,
        universe: TopicUniverse,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EventStore>,
        strategy: S,
    ) -> Self {
        Self {
            plan,
            client_id,
            universe: Arc::new(universe),
            transport,
            store,
            strategy,
        }
    }

    /// Connect, run the foreground loop with churn in the background, then
    /// shut both down and report. Only the initial connect is fatal.
    pub async fn run(self) -> Result<RunReport, SupervisorError> {
        let started = Instant::now();
        let plan = self.plan;
        let metrics = Arc::new(Metrics::new());
        let subscriptions = Arc::new(SubscriptionSet::new());
        let recorder = Arc::new(EventRecorder::new(
            self.client_id.clone(),
            self.transport.clone(),
            self.store,
            plan.log_topic.clone(),
        ));
        let supervisor = ConnectionSupervisor::new(
            self.transport.clone(),
            recorder.clone(),
            metrics.clone(),
            SupervisorOptions {
                connect: plan.connect.clone(),
                settle_delay: plan.settle_delay,
                disconnect_topic: plan.disconnect_topic.clone(),
            },
        );
        let handler = Arc::new(MessageHandler::new(
            recorder.clone(),
            self.universe.clone(),
            plan.pacing,
        ));

        // subscribe before connecting so the first CONNECT callback is seen
        let dispatch_cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(supervisor.clone(), handler)
            .spawn(self.transport.events(), dispatch_cancel.clone());

        if let Err(err) = supervisor.connect().await {
            dispatch_cancel.cancel();
            finish_dispatch(dispatcher).await;
            return Err(err);
        }
        tokio::time::sleep(plan.warmup).await;

        let churn_cancel = CancellationToken::new();
        let churn = plan
            .churn
            .map(|opts| supervisor.spawn_churn(opts, churn_cancel.clone()));

        let mut scheduler = ActionScheduler::new(
            self.strategy,
            self.transport.clone(),
            recorder.clone(),
            metrics.clone(),
            self.universe.clone(),
            subscriptions.clone(),
            plan.pacing,
        );
        scheduler.run(plan.iterations).await;

        churn_cancel.cancel();
        if let Some(handle) = churn {
            if let Err(err) = handle.await {
                warn!(target: "churn::supervisor", error = %err, "churn task join failed");
            }
        }
        supervisor.disconnect().await;
        dispatch_cancel.cancel();
        finish_dispatch(dispatcher).await;

        let aggregate = recorder.query_aggregate(self.client_id.as_str()).await;
        let report = RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            client_id: self.client_id.to_string(),
            iterations: plan.iterations,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            metrics: metrics.snapshot(),
            subscriptions: subscriptions.len().await,
            churn_cycles: supervisor.churn_cycles(),
            aggregate,
        };
        info!(
            target: "churn::supervisor",
            run_id = %report.run_id,
            success = report.metrics.success_count,
            failure = report.metrics.failure_count,
            disconnects = report.metrics.disconnect_count,
            "run complete"
        );
        Ok(report)
    }
}

async fn finish_dispatch(handle: tokio::task::JoinHandle<DispatchStats>) {
    match handle.await {
        Ok(stats) if stats.lagged > 0 => {
            warn!(
                target: "churn::dispatch",
                lagged = stats.lagged,
                "callbacks were dropped during the run"
            );
        }
        Ok(_) => {}
        Err(err) => warn!(target: "churn::dispatch", error = %err, "dispatcher join failed"),
    }
}
