use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::MessageHandler;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::TransportEvent;

/// Counts of callbacks handled by a dispatcher before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub connects: u64,
    pub messages: u64,
    pub disconnects: u64,
    /// Callbacks skipped because the receiver fell behind.
    pub lagged: u64,
}

/// Routes transport callbacks to the supervisor and the message handler, one
/// at a time, in the order the transport produced them.
pub struct Dispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    handler: Arc<MessageHandler>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, handler: Arc<MessageHandler>) -> Self {
        Self {
            supervisor,
            handler,
        }
    }

    /// Run until `cancel` fires, then drain whatever is already queued.
    pub fn spawn(
        self,
        events: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<DispatchStats> {
        tokio::spawn(self.run(events, cancel))
    }

    pub async fn run(
        self,
        mut events: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                recv = events.recv() => match recv {
                    Ok(event) => self.handle(event, &mut stats).await,
                    Err(RecvError::Lagged(skipped)) => {
                        stats.lagged += skipped;
                        warn!(target: "churn::dispatch", skipped, "callback receiver lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!(target: "churn::dispatch", "transport callback channel closed");
                        return stats;
                    }
                },
            }
        }
        loop {
            match events.try_recv() {
                Ok(event) => self.handle(event, &mut stats).await,
                Err(TryRecvError::Lagged(skipped)) => stats.lagged += skipped,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        debug!(target: "churn::dispatch", ?stats, "dispatcher stopped");
        stats
    }

    async fn handle(&self, event: TransportEvent, stats: &mut DispatchStats) {
        match event {
            TransportEvent::Connected { code } => {
                stats.connects += 1;
                self.supervisor.on_connect(code).await;
            }
            TransportEvent::Message { topic, payload } => {
                stats.messages += 1;
                self.handler.on_message(&topic, &payload).await;
            }
            TransportEvent::Disconnected { code } => {
                stats.disconnects += 1;
                self.supervisor.on_disconnect(code).await;
            }
        }
    }
}
