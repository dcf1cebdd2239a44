// Logging module - tracing subscriber setup for embedding applications

use crate::error::{AgentvisorError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `default_filter` applies when `RUST_LOG` is unset, e.g. `"agentvisor=info"`.
/// With `json` every event is written as one JSON line. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| AgentvisorError::ConfigError(format!("invalid log filter: {}", e)))?;

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    installed.map_err(|e| AgentvisorError::Internal(format!("tracing already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing("agentvisor=debug", false);
        assert!(init_tracing("agentvisor=debug", true).is_err());
    }
}
