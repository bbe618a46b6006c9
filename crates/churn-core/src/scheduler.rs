use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use churn_events::EventKind;
use churn_topics::TopicUniverse;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::recorder::EventRecorder;
use crate::transport::{Transport, TransportError};

/// Length of the random lowercase text carried by each publish.
pub const PAYLOAD_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl Action {
    pub fn event_kind(self) -> EventKind {
        match self {
            Action::Subscribe => EventKind::Subscribe,
            Action::Unsubscribe => EventKind::Unsubscribe,
            Action::Publish => EventKind::Publish,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
            Action::Publish => "publish",
        })
    }
}

/// Source of every random decision the scheduler makes.
pub trait Strategy: Send {
    fn next_action(&mut self) -> Action;
    /// Index into a non-empty topic list of length `len`.
    fn pick_index(&mut self, len: usize) -> usize;
    fn payload(&mut self) -> String;
    /// Two-character label naming one subscription change, an uppercase
    /// letter then a digit in `1..=9`.
    fn subscription_tag(&mut self) -> String;
}

/// Half the iterations manage a subscription (itself a coin flip between
/// subscribe and unsubscribe), the other half publish.
pub struct RandomStrategy {
    rng: StdRng,
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RandomStrategy {
    fn next_action(&mut self) -> Action {
        if self.rng.random_bool(0.5) {
            if self.rng.random_bool(0.5) {
                Action::Subscribe
            } else {
                Action::Unsubscribe
            }
        } else {
            Action::Publish
        }
    }

    fn pick_index(&mut self, len: usize) -> usize {
        self.rng.random_range(0..len)
    }

    fn payload(&mut self) -> String {
        (0..PAYLOAD_LEN)
            .map(|_| char::from(self.rng.random_range(b'a'..=b'z')))
            .collect()
    }

    fn subscription_tag(&mut self) -> String {
        let letter = char::from(self.rng.random_range(b'A'..=b'Z'));
        let digit: u8 = self.rng.random_range(1..=9);
        format!("{letter}{digit}")
    }
}

/// Replays a fixed action cycle. Topics are taken round-robin, payloads
/// count up from `aaaaa` and subscription tags run `A1`, `B2`, `C3`...
#[derive(Debug, Clone)]
pub struct ScriptedStrategy {
    actions: Vec<Action>,
    cursor: usize,
    picks: usize,
    payloads: u64,
    tags: u64,
}

impl ScriptedStrategy {
    /// An empty script publishes every time.
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
            cursor: 0,
            picks: 0,
            payloads: 0,
            tags: 0,
        }
    }

    pub fn always(action: Action) -> Self {
        Self::new([action])
    }
}

impl Strategy for ScriptedStrategy {
    fn next_action(&mut self) -> Action {
        if self.actions.is_empty() {
            return Action::Publish;
        }
        let action = self.actions[self.cursor % self.actions.len()];
        self.cursor += 1;
        action
    }

    fn pick_index(&mut self, len: usize) -> usize {
        let idx = self.picks % len;
        self.picks += 1;
        idx
    }

    fn payload(&mut self) -> String {
        let mut n = self.payloads;
        self.payloads += 1;
        let mut chars = [b'a'; PAYLOAD_LEN];
        for slot in chars.iter_mut().rev() {
            *slot = b'a' + (n % 26) as u8;
            n /= 26;
        }
        chars.iter().map(|&b| char::from(b)).collect()
    }

    fn subscription_tag(&mut self) -> String {
        let n = self.tags;
        self.tags += 1;
        let letter = char::from(b'A' + (n % 26) as u8);
        format!("{letter}{}", 1 + n % 9)
    }
}

/// Topics this client believes it is subscribed to. Local bookkeeping only;
/// the broker may have dropped them on a reconnect.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    topics: Mutex<HashSet<String>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, topic: &str) -> bool {
        self.topics.lock().await.insert(topic.to_string())
    }

    pub async fn remove(&self, topic: &str) -> bool {
        self.topics.lock().await.remove(topic)
    }

    pub async fn len(&self) -> usize {
        self.topics.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.topics.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> HashSet<String> {
        self.topics.lock().await.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("topic universe is empty")]
    EmptyUniverse,
    #[error("payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Foreground driver: one action per iteration, then the pacing delay.
pub struct ActionScheduler<S> {
    strategy: S,
    transport: Arc<dyn Transport>,
    recorder: Arc<EventRecorder>,
    metrics: Arc<Metrics>,
    universe: Arc<TopicUniverse>,
    subscriptions: Arc<SubscriptionSet>,
    pacing: Duration,
}

impl<S: Strategy> ActionScheduler<S> {
    pub fn new(
        strategy: S,
        transport: Arc<dyn Transport>,
        recorder: Arc<EventRecorder>,
        metrics: Arc<Metrics>,
        universe: Arc<TopicUniverse>,
        subscriptions: Arc<SubscriptionSet>,
        pacing: Duration,
    ) -> Self {
        Self {
            strategy,
            transport,
            recorder,
            metrics,
            universe,
            subscriptions,
            pacing,
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionSet> {
        &self.subscriptions
    }

    /// Run exactly `iterations` actions. Returns how many succeeded.
    pub async fn run(&mut self, iterations: u64) -> u64 {
        let mut ok = 0u64;
        for i in 0..iterations {
            match self.run_iteration().await {
                Ok(action) => {
                    ok += 1;
                    debug!(
                        target: "churn::scheduler",
                        iteration = i,
                        action = %action,
                        "action ok"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "churn::scheduler",
                        iteration = i,
                        error = %err,
                        "action failed"
                    );
                }
            }
        }
        info!(target: "churn::scheduler", iterations, succeeded = ok, "workload finished");
        ok
    }

    /// One action, counted as exactly one success or one failure.
    pub async fn run_iteration(&mut self) -> Result<Action, ActionError> {
        let action = self.strategy.next_action();
        let result = self.execute(action).await;
        match &result {
            Ok(()) => self.metrics.record_success(),
            Err(_) => self.metrics.record_failure(),
        }
        tokio::time::sleep(self.pacing).await;
        result.map(|()| action)
    }

    async fn execute(&mut self, action: Action) -> Result<(), ActionError> {
        let topic = self.pick_topic()?;
        match action {
            Action::Subscribe => {
                let name = format!("Subscribe{}", self.strategy.subscription_tag());
                self.transport.subscribe(&topic).await?;
                self.subscriptions.insert(&topic).await;
                self.recorder
                    .record(action.event_kind(), format!("{name} subscribed"), &topic)
                    .await;
            }
            Action::Unsubscribe => {
                let name = format!("Unsubscribe{}", self.strategy.subscription_tag());
                self.transport.unsubscribe(&topic).await?;
                self.subscriptions.remove(&topic).await;
                self.recorder
                    .record(action.event_kind(), format!("{name} unsubscribed"), &topic)
                    .await;
            }
            Action::Publish => {
                let message = self.strategy.payload();
                let body = serde_json::to_vec(&serde_json::json!({ "message": message }))?;
                self.transport.publish(&topic, body).await?;
                self.recorder
                    .record(action.event_kind(), message, &topic)
                    .await;
            }
        }
        Ok(())
    }

    fn pick_topic(&mut self) -> Result<String, ActionError> {
        if self.universe.is_empty() {
            return Err(ActionError::EmptyUniverse);
        }
        let idx = self.strategy.pick_index(self.universe.len());
        self.universe
            .get(idx)
            .map(str::to_string)
            .ok_or(ActionError::EmptyUniverse)
    }
}
