//! Pub/sub broker workload generator: one client connection, a randomized
//! foreground action loop, periodic forced churn in the background, and an
//! audit trail of every lifecycle transition.

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod metrics;
pub mod recorder;
pub mod runner;
pub mod scheduler;
pub mod supervisor;
pub mod transport;
pub mod util;


pub use config::{load_config, Config, StoreBackend, TransportKind};
pub use handler::{extract_message, MessageHandler};
pub use metrics::{Metrics, MetricsSnapshot};
pub use recorder::EventRecorder;
pub use runner::{RunPlan, RunReport, Workload};
pub use scheduler::{
    Action, ActionError, ActionScheduler, RandomStrategy, ScriptedStrategy, Strategy,
    SubscriptionSet,
};
pub use supervisor::{
    ChurnOptions, ConnectionState, ConnectionSupervisor, DisconnectCause, SupervisorError,
    SupervisorOptions,
};
