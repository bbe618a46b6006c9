use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_nats::Client;
use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    ConnectOptions, Transport, TransportError, TransportEvent, CODE_OK, EVENT_CHANNEL_CAPACITY,
};

/// NATS-backed transport using core subjects (at-most-once, best-effort).
///
/// Topic segments map onto subject tokens: `home/kitchen/fire` is published
/// as `home.kitchen.fire`.
pub struct NatsTransport {
    url: Option<String>,
    state: Mutex<NatsState>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct NatsState {
    client: Option<Client>,
    /// Belongs to `client`; each connection gets its own.
    closing: Option<ClosingFlag>,
    options: Option<ConnectOptions>,
    subs: HashMap<String, JoinHandle<()>>,
}

/// Set while we tear one client down ourselves so that client's own
/// disconnect notification is not reported a second time.
#[derive(Clone, Default)]
struct ClosingFlag(Arc<AtomicBool>);

impl ClosingFlag {
    fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Maps a client event to the broker-side drop it reports, if any.
    fn report(&self, event: &async_nats::Event) -> Option<TransportEvent> {
        match event {
            async_nats::Event::Disconnected if !self.0.load(Ordering::SeqCst) => {
                Some(TransportEvent::Disconnected { code: None })
            }
            _ => None,
        }
    }
}

impl NatsTransport {
    /// `url` overrides the `nats://host:port` derived from connect options.
    pub fn new(url: Option<String>) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            url,
            state: Mutex::new(NatsState::default()),
            events,
        }
    }

    fn url_for(&self, opts: &ConnectOptions) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("nats://{}:{}", opts.host, opts.port))
    }

    async fn open(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        let url = self.url_for(&opts);
        let tx = self.events.clone();
        let closing = ClosingFlag::default();
        let callback_closing = closing.clone();
        let result = async_nats::ConnectOptions::new()
            .name(opts.client_id.clone())
            .ping_interval(opts.keep_alive)
            .event_callback(move |event| {
                let tx = tx.clone();
                let closing = callback_closing.clone();
                async move {
                    if let Some(notice) = closing.report(&event) {
                        let _ = tx.send(notice);
                    }
                }
            })
            .connect(url.as_str())
            .await;
        let client = match result {
            Ok(client) => client,
            Err(err) => {
                warn!(%url, error = %err, "nats connect failed");
                return Err(TransportError::Other(err.to_string()));
            }
        };
        {
            let mut state = self.state.lock().await;
            state.client = Some(client);
            state.closing = Some(closing);
            state.options = Some(opts);
        }
        debug!(%url, "nats connected");
        let _ = self.events.send(TransportEvent::Connected { code: CODE_OK });
        Ok(())
    }

    async fn client(&self) -> Result<Client, TransportError> {
        self.state
            .lock()
            .await
            .client
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

fn subject(topic: &str) -> String {
    topic.replace('/', ".")
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, opts: &ConnectOptions) -> Result<(), TransportError> {
        self.open(opts.clone()).await
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let opts = self
            .state
            .lock()
            .await
            .options
            .clone()
            .ok_or(TransportError::NeverConnected)?;
        self.open(opts).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let (client, closing) = {
            let mut state = self.state.lock().await;
            for (_, handle) in state.subs.drain() {
                handle.abort();
            }
            (state.client.take(), state.closing.take())
        };
        let client = client.ok_or(TransportError::NotConnected)?;
        if let Some(closing) = closing {
            closing.mark();
        }
        if let Err(err) = client.flush().await {
            debug!(error = %err, "flush before disconnect failed");
        }
        drop(client);
        let _ = self.events.send(TransportEvent::Disconnected {
            code: Some(CODE_OK),
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client().await?;
        client
            .publish(subject(topic), payload.into())
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client().await?;
        let mut sub = client
            .subscribe(subject(topic))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let tx = self.events.clone();
        let local_topic = topic.to_string();
        let handle = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let _ = tx.send(TransportEvent::Message {
                    topic: local_topic.clone(),
                    payload: msg.payload.to_vec(),
                });
            }
        });
        // dropping the previous forwarder drops its subscriber
        let mut state = self.state.lock().await;
        if let Some(prev) = state.subs.insert(topic.to_string(), handle) {
            prev.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.client.is_none() {
            return Err(TransportError::NotConnected);
        }
        if let Some(handle) = state.subs.remove(topic) {
            handle.abort();
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_map_to_subjects() {
        assert_eq!(subject("home/kitchen/fire"), "home.kitchen.fire");
    }

    #[test]
    fn closing_one_client_keeps_drops_of_the_next_visible() {
        let first = ClosingFlag::default();
        let second = ClosingFlag::default();
        assert!(matches!(
            first.report(&async_nats::Event::Disconnected),
            Some(TransportEvent::Disconnected { code: None })
        ));

        first.mark();
        assert!(first.report(&async_nats::Event::Disconnected).is_none());
        // a late callback from the closed client cannot silence its successor
        assert!(matches!(
            second.report(&async_nats::Event::Disconnected),
            Some(TransportEvent::Disconnected { code: None })
        ));
        assert!(second.report(&async_nats::Event::Connected).is_none());
    }
}
