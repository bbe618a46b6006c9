use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::{
    ConnectOptions, Transport, TransportError, TransportEvent, CODE_OK, EVENT_CHANNEL_CAPACITY,
};

/// Result code reported when the broker turns a connect away.
const CODE_REFUSED: i32 = 5;

/// In-process broker for single-process runs and tests.
///
/// Topics match exactly (no wildcards). A client's subscriptions are dropped
/// whenever it disconnects, as with a clean session.
#[derive(Clone, Default)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    clients: Mutex<Vec<Weak<ClientInner>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    refuse_connects: AtomicUsize,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new client handle attached to this broker.
    pub async fn transport(&self) -> LocalTransport {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(ClientInner {
            state: Mutex::new(ClientState::default()),
            events: tx,
        });
        let mut clients = self.inner.clients.lock().await;
        clients.retain(|c| c.strong_count() > 0);
        clients.push(Arc::downgrade(&client));
        LocalTransport {
            inner: client,
            broker: self.clone(),
        }
    }

    /// Refuse the next `n` connect or reconnect attempts from any client.
    pub fn refuse_next_connects(&self, n: usize) {
        self.inner.refuse_connects.store(n, Ordering::SeqCst);
    }

    fn take_refusal(&self) -> bool {
        self.inner
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Sever a client's link from the broker side and report `code` to it.
    /// Returns false when no connected client has that id.
    pub async fn drop_client(&self, client_id: &str, code: Option<i32>) -> bool {
        for client in self.live_clients().await {
            let mut state = client.state.lock().await;
            let matches = state
                .options
                .as_ref()
                .is_some_and(|o| o.client_id == client_id);
            if matches && state.connected {
                state.connected = false;
                state.subscriptions.clear();
                drop(state);
                let _ = client.events.send(TransportEvent::Disconnected { code });
                return true;
            }
        }
        false
    }

    /// Deliver a message as if published by a client outside this process.
    pub async fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.route(topic, payload).await;
    }

    /// Every accepted publish, oldest first.
    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.published.lock().await.clone()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    async fn live_clients(&self) -> Vec<Arc<ClientInner>> {
        let clients = self.inner.clients.lock().await;
        clients.iter().filter_map(Weak::upgrade).collect()
    }

    async fn route(&self, topic: &str, payload: Vec<u8>) {
        self.inner
            .published
            .lock()
            .await
            .push((topic.to_string(), payload.clone()));
        for client in self.live_clients().await {
            let interested = {
                let state = client.state.lock().await;
                state.connected && state.subscriptions.contains(topic)
            };
            if interested {
                let _ = client.events.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

struct ClientInner {
    state: Mutex<ClientState>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct ClientState {
    options: Option<ConnectOptions>,
    connected: bool,
    subscriptions: HashSet<String>,
}

/// One client connection to a [`LocalBroker`].
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<ClientInner>,
    broker: LocalBroker,
}

impl LocalTransport {
    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connected
    }

    /// Topics the broker currently routes to this client.
    pub async fn broker_subscriptions(&self) -> HashSet<String> {
        self.inner.state.lock().await.subscriptions.clone()
    }

    async fn open(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        if self.broker.take_refusal() {
            let _ = self.inner.events.send(TransportEvent::Connected {
                code: CODE_REFUSED,
            });
            return Err(TransportError::Refused(CODE_REFUSED));
        }
        {
            let mut state = self.inner.state.lock().await;
            debug!(client = %opts.client_id, host = %opts.host, port = opts.port, "local connect");
            state.options = Some(opts);
            state.connected = true;
        }
        let _ = self
            .inner
            .events
            .send(TransportEvent::Connected { code: CODE_OK });
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.inner.state.lock().await.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, opts: &ConnectOptions) -> Result<(), TransportError> {
        self.open(opts.clone()).await
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let opts = self
            .inner
            .state
            .lock()
            .await
            .options
            .clone()
            .ok_or(TransportError::NeverConnected)?;
        self.open(opts).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock().await;
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.connected = false;
            state.subscriptions.clear();
        }
        let _ = self.inner.events.send(TransportEvent::Disconnected {
            code: Some(CODE_OK),
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        self.broker.route(topic, payload).await;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.remove(topic);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}
