use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use churn_events::AUDIT_LOG_TARGET;

static AUDIT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Console logging filtered by `RUST_LOG` (default `info`). With
/// `CHURN_LOG_ROLL=1` audit lines are also written to a rolling file.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_console(filter);
}

fn install_console(filter: EnvFilter) {
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if std::env::var("CHURN_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("CHURN_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix = std::env::var("CHURN_LOG_PREFIX").unwrap_or_else(|_| "audit".into());
        let rotation = std::env::var("CHURN_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create audit log directory");
        }
        let writer = match rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
            "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
            _ => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = AUDIT_GUARD.set(guard);
        let targets = Targets::new().with_target(AUDIT_LOG_TARGET, tracing::Level::INFO);
        let audit_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(nb)
            .with_filter(targets);
        let _ = registry.with(audit_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}
