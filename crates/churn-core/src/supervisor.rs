use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use churn_events::{AuditEvent, EventKind};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::recorder::EventRecorder;
use crate::transport::{ConnectOptions, Transport, TransportError, CODE_OK};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

/// How the transport explained a lost link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    Clean,
    Abnormal(i32),
    Unknown,
}

impl DisconnectCause {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(CODE_OK) => DisconnectCause::Clean,
            Some(rc) => DisconnectCause::Abnormal(rc),
            None => DisconnectCause::Unknown,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("initial connect failed: {0}")]
    Connect(#[source] TransportError),
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub connect: ConnectOptions,
    /// Grace period between a successful connect and the CONNECT event.
    pub settle_delay: Duration,
    pub disconnect_topic: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ChurnOptions {
    pub interval: Duration,
    pub reconnect_timeout: Duration,
}

/// Owns the single broker connection and its lifecycle.
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    recorder: Arc<EventRecorder>,
    metrics: Arc<Metrics>,
    options: SupervisorOptions,
    state: watch::Sender<ConnectionState>,
    churn_cycles: AtomicU64,
    /// Clean disconnect notices still owed by the transport for our own
    /// `disconnect` calls.
    own_disconnects: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        recorder: Arc<EventRecorder>,
        metrics: Arc<Metrics>,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            recorder,
            metrics,
            options,
            state,
            churn_cycles: AtomicU64::new(0),
            own_disconnects: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Completed disconnect/reconnect cycles of the churn loop.
    pub fn churn_cycles(&self) -> u64 {
        self.churn_cycles.load(Ordering::Relaxed)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(
                    target: "churn::supervisor",
                    from = ?*current,
                    to = ?next,
                    "rejected connection state transition"
                );
                return false;
            }
            debug!(target: "churn::supervisor", from = ?*current, to = ?next, "connection state");
            *current = next;
            true
        })
    }

    /// Initial connect. Not retried; a failure is fatal to the run.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        let opts = &self.options.connect;
        self.transition(ConnectionState::Connecting);
        match self.transport.connect(opts).await {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                info!(
                    target: "churn::supervisor",
                    client = %opts.client_id,
                    host = %opts.host,
                    port = opts.port,
                    keep_alive_secs = opts.keep_alive.as_secs(),
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                error!(
                    target: "churn::supervisor",
                    client = %opts.client_id,
                    host = %opts.host,
                    port = opts.port,
                    error = %err,
                    "connect failed"
                );
                Err(SupervisorError::Connect(err))
            }
        }
    }

    /// Re-establish the link after a forced disconnect. Only valid from
    /// DISCONNECTED; a call while connected is a no-op.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        if !self.transition(ConnectionState::Connecting) {
            debug!(target: "churn::supervisor", state = ?self.state(), "reconnect skipped");
            return Ok(());
        }
        match self.transport.reconnect().await {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Drop the link regardless of what the foreground is doing.
    pub async fn disconnect(&self) {
        match self.transport.disconnect().await {
            Ok(()) => {
                self.own_disconnects.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                debug!(target: "churn::supervisor", error = %err, "disconnect reported error");
            }
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Consumes one outstanding notice for our own disconnect, if any.
    fn take_own_disconnect(&self) -> bool {
        self.own_disconnects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Connect callback. Emits CONNECT after the settle delay on success.
    pub async fn on_connect(&self, code: i32) -> Option<AuditEvent> {
        if code != CODE_OK {
            warn!(target: "churn::supervisor", code, "connection failed with result code");
            return None;
        }
        tokio::time::sleep(self.options.settle_delay).await;
        let client = self.recorder.client_id().clone();
        let log_topic = self.recorder.log_topic().to_string();
        let event = self
            .recorder
            .record(
                EventKind::Connect,
                format!("{client}/Connected"),
                &log_topic,
            )
            .await;
        info!(target: "churn::supervisor", client = %client, "connected successfully");
        Some(event)
    }

    /// Disconnect callback. The DISCONNECT event is built before the cause is
    /// inspected and written straight to the store.
    ///
    /// Every cause ends in DISCONNECTED. The notice for our own disconnect is
    /// matched against `disconnect` and leaves the state alone, since a churn
    /// reconnect may already have happened by the time it is delivered.
    pub async fn on_disconnect(&self, code: Option<i32>) -> DisconnectCause {
        let client = self.recorder.client_id().clone();
        let event = self.recorder.event(
            EventKind::Disconnect,
            format!("{client}/Disconnected"),
            &self.options.disconnect_topic,
        );
        let cause = DisconnectCause::from_code(code);
        match cause {
            DisconnectCause::Clean => {
                if !self.take_own_disconnect() {
                    self.transition(ConnectionState::Disconnected);
                }
                self.metrics.record_disconnect();
                self.recorder.persist_retrying_once(&event).await;
                info!(target: "churn::supervisor", client = %client, rc = CODE_OK, "disconnected");
            }
            DisconnectCause::Abnormal(rc) => {
                self.transition(ConnectionState::Disconnected);
                self.recorder.persist_retrying_once(&event).await;
                warn!(
                    target: "churn::supervisor",
                    client = %client,
                    rc,
                    "disconnect failed with result code"
                );
            }
            DisconnectCause::Unknown => {
                self.transition(ConnectionState::Disconnected);
                let event = AuditEvent {
                    message: format!("{client}/Disconnected (unknown cause)"),
                    ..event
                };
                self.recorder.persist_retrying_once(&event).await;
                warn!(
                    target: "churn::supervisor",
                    client = %client,
                    "disconnected for unknown cause"
                );
            }
        }
        cause
    }

    pub fn spawn_churn(
        self: &Arc<Self>,
        churn: ChurnOptions,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run_churn(churn, cancel).await })
    }

    /// Force a disconnect every `interval`, wait `reconnect_timeout`, reconnect.
    /// Runs until `cancel` fires; checked at every wait.
    pub async fn run_churn(self: Arc<Self>, churn: ChurnOptions, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(churn.interval) => {}
            }
            info!(target: "churn::supervisor", "forcing disconnect");
            self.disconnect().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(churn.reconnect_timeout) => {}
            }
            match self.reconnect().await {
                Ok(()) => {
                    self.churn_cycles.fetch_add(1, Ordering::Relaxed);
                    info!(
                        target: "churn::supervisor",
                        interval_secs = churn.interval.as_secs(),
                        "reconnected after forced disconnect"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "churn::supervisor",
                        error = %err,
                        "reconnect failed; next cycle retries"
                    );
                }
            }
        }
        debug!(target: "churn::supervisor", "churn loop cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBroker;
    use churn_events::{ClientId, MemoryStore};

    struct Fixture {
        broker: LocalBroker,
        store: Arc<MemoryStore>,
        metrics: Arc<Metrics>,
        supervisor: Arc<ConnectionSupervisor>,
    }

    async fn fixture() -> Fixture {
        let broker = LocalBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.transport().await);
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let recorder = Arc::new(EventRecorder::new(
            ClientId::new("ClientS1"),
            transport.clone(),
            store.clone(),
            "connection/logs",
        ));
        let supervisor = ConnectionSupervisor::new(
            transport,
            recorder,
            metrics.clone(),
            SupervisorOptions {
                connect: ConnectOptions {
                    host: "localhost".into(),
                    port: 1883,
                    keep_alive: Duration::from_secs(60),
                    client_id: "ClientS1".into(),
                },
                settle_delay: Duration::from_secs(2),
                disconnect_topic: "disconnection/logs".into(),
            },
        );
        Fixture {
            broker,
            store,
            metrics,
            supervisor,
        }
    }

    #[test]
    fn only_lifecycle_transitions_are_valid() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn connect_failure_is_fatal_and_leaves_disconnected() {
        let fx = fixture().await;
        fx.broker.refuse_next_connects(1);
        let err = fx.supervisor.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Connect(TransportError::Refused(_))
        ));
        assert_eq!(fx.supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_disconnect_reconnect_cycle() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        assert_eq!(fx.supervisor.state(), ConnectionState::Connected);
        fx.supervisor.disconnect().await;
        assert_eq!(fx.supervisor.state(), ConnectionState::Disconnected);
        fx.supervisor.reconnect().await.unwrap();
        assert_eq!(fx.supervisor.state(), ConnectionState::Connected);
        // reconnect while connected does nothing
        fx.supervisor.reconnect().await.unwrap();
        assert_eq!(fx.supervisor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_reconnect_returns_to_disconnected() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        fx.supervisor.disconnect().await;
        fx.broker.refuse_next_connects(1);
        assert!(fx.supervisor.reconnect().await.is_err());
        assert_eq!(fx.supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn on_connect_records_after_settle_delay() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        let started = tokio::time::Instant::now();
        let event = fx.supervisor.on_connect(CODE_OK).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(event.event_type, EventKind::Connect);
        assert_eq!(event.message, "ClientS1/Connected");
        assert_eq!(event.topic, "connection/logs");
        assert_eq!(fx.broker.published_on("connection/logs").await.len(), 1);

        assert!(fx.supervisor.on_connect(5).await.is_none());
        assert_eq!(fx.store.len().await, 1);
    }

    #[tokio::test]
    async fn clean_disconnects_count_exactly_once_each() {
        let fx = fixture().await;
        for _ in 0..3 {
            assert_eq!(
                fx.supervisor.on_disconnect(Some(0)).await,
                DisconnectCause::Clean
            );
        }
        assert_eq!(fx.metrics.snapshot().disconnect_count, 3);
        let events = fx.store.events().await;
        assert_eq!(events.len(), 3);
        for e in &events {
            assert_eq!(e.event_type, EventKind::Disconnect);
            assert_eq!(e.topic, "disconnection/logs");
            assert_eq!(e.message, "ClientS1/Disconnected");
        }
    }

    #[tokio::test]
    async fn broker_clean_close_moves_state_to_disconnected() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        assert!(fx.broker.drop_client("ClientS1", Some(CODE_OK)).await);

        assert_eq!(
            fx.supervisor.on_disconnect(Some(CODE_OK)).await,
            DisconnectCause::Clean
        );
        assert_eq!(fx.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(fx.metrics.snapshot().disconnect_count, 1);

        // the foreground can reconnect from here
        fx.supervisor.reconnect().await.unwrap();
        assert_eq!(fx.supervisor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn late_notice_of_own_disconnect_keeps_new_connection() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        fx.supervisor.disconnect().await;
        fx.supervisor.reconnect().await.unwrap();

        assert_eq!(
            fx.supervisor.on_disconnect(Some(CODE_OK)).await,
            DisconnectCause::Clean
        );
        assert_eq!(fx.supervisor.state(), ConnectionState::Connected);
        assert_eq!(fx.metrics.snapshot().disconnect_count, 1);

        // the next clean close is not ours
        assert_eq!(
            fx.supervisor.on_disconnect(Some(CODE_OK)).await,
            DisconnectCause::Clean
        );
        assert_eq!(fx.supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn abnormal_and_unknown_disconnects_are_recorded_but_not_counted() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        assert_eq!(
            fx.supervisor.on_disconnect(Some(7)).await,
            DisconnectCause::Abnormal(7)
        );
        assert_eq!(fx.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(
            fx.supervisor.on_disconnect(None).await,
            DisconnectCause::Unknown
        );
        assert_eq!(fx.metrics.snapshot().disconnect_count, 0);

        let events = fx.store.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "ClientS1/Disconnected");
        assert_eq!(events[1].message, "ClientS1/Disconnected (unknown cause)");
    }

    #[tokio::test]
    async fn disconnect_write_is_retried_once() {
        let fx = fixture().await;
        fx.store.fail_next_puts(1);
        fx.supervisor.on_disconnect(Some(0)).await;
        assert_eq!(fx.store.len().await, 1);

        fx.store.fail_next_puts(2);
        fx.supervisor.on_disconnect(Some(0)).await;
        assert_eq!(fx.store.len().await, 1);
        assert_eq!(fx.metrics.snapshot().disconnect_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn churn_loop_cycles_until_cancelled() {
        let fx = fixture().await;
        fx.supervisor.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let handle = fx.supervisor.spawn_churn(
            ChurnOptions {
                interval: Duration::from_secs(10),
                reconnect_timeout: Duration::from_secs(4),
            },
            cancel.clone(),
        );
        let mut state = fx.supervisor.watch_state();

        // first forced disconnect lands at t=10s
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(fx.supervisor.churn_cycles(), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(fx.supervisor.state(), ConnectionState::Connected);
    }
}
