//! Structured logging setup.
//!
//! ライブラリ側は `tracing` のマクロでイベントを出すだけです。
//! subscriber の設定は composition root で一度だけ `init_tracing` を呼びます。

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::TelemetryConfig;

static TRACING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `config.level`.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns whether this process' subscriber was installed by this crate.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    *TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed()
        };

        // A global subscriber may already be set by the host application.
        match tracing_subscriber::registry().with(layer).try_init() {
            Ok(()) => {
                tracing::info!(
                    pid = std::process::id(),
                    json = config.json,
                    "structured logging initialized"
                );
                true
            }
            Err(_) => {
                tracing::debug!("global tracing subscriber already set, keeping it");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = TelemetryConfig::default();
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        assert_eq!(first, second);
    }
}
