//! Observer that forwards orchestration events to `tracing`.

use quill_core::events::{Observer, OrchestrationEvent};
use tracing::Level;

/// Logs every orchestration event under the `quill::events` target.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

impl TracingObserver {
    pub fn new() -> Self {
        Self
    }

    /// Level an event is logged at
    pub fn level_for(event: &OrchestrationEvent) -> Level {
        match event {
            OrchestrationEvent::RequestStarted { .. } => Level::DEBUG,
            OrchestrationEvent::RequestRetrying { .. } | OrchestrationEvent::CircuitOpened { .. } => {
                Level::WARN
            }
            OrchestrationEvent::RequestFailed { .. } => Level::ERROR,
            OrchestrationEvent::RequestCompleted { .. }
            | OrchestrationEvent::RequestCancelled { .. }
            | OrchestrationEvent::CircuitHalfOpened { .. }
            | OrchestrationEvent::CircuitClosed { .. } => Level::INFO,
        }
    }
}

fn describe(event: &OrchestrationEvent) -> String {
    match event {
        OrchestrationEvent::RequestStarted {
            request_id,
            function_id,
            priority,
            streaming,
        } => format!("request={request_id} function={function_id} priority={priority:?} streaming={streaming}"),
        OrchestrationEvent::RequestRetrying {
            request_id,
            provider,
            attempt,
            delay,
            reason,
        } => format!("request={request_id} provider={provider} attempt={attempt} delay={delay:?} reason={reason}"),
        OrchestrationEvent::RequestCompleted {
            request_id,
            provider,
            latency,
            cached,
        } => format!(
            "request={request_id} provider={} latency={latency:?} cached={cached}",
            provider.as_deref().unwrap_or("-")
        ),
        OrchestrationEvent::RequestFailed {
            request_id,
            provider,
            error,
        } => format!(
            "request={request_id} provider={} error={error}",
            provider.as_deref().unwrap_or("-")
        ),
        OrchestrationEvent::RequestCancelled { request_id } => format!("request={request_id}"),
        OrchestrationEvent::CircuitOpened { provider, cooldown } => {
            format!("provider={provider} cooldown={cooldown:?}")
        }
        OrchestrationEvent::CircuitHalfOpened { provider }
        | OrchestrationEvent::CircuitClosed { provider } => format!("provider={provider}"),
    }
}

impl Observer for TracingObserver {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_event(&self, event: &OrchestrationEvent) {
        let name = event.name();
        let detail = describe(event);
        match Self::level_for(event) {
            Level::ERROR => tracing::error!(target: "quill::events", "{name}: {detail}"),
            Level::WARN => tracing::warn!(target: "quill::events", "{name}: {detail}"),
            Level::INFO => tracing::info!(target: "quill::events", "{name}: {detail}"),
            _ => tracing::debug!(target: "quill::events", "{name}: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_levels() {
        let opened = OrchestrationEvent::CircuitOpened {
            provider: "openai".into(),
            cooldown: Duration::from_secs(30),
        };
        assert_eq!(TracingObserver::level_for(&opened), Level::WARN);

        let failed = OrchestrationEvent::RequestFailed {
            request_id: "r1".into(),
            provider: None,
            error: "All providers unavailable".into(),
        };
        assert_eq!(TracingObserver::level_for(&failed), Level::ERROR);
        assert_eq!(describe(&failed), "request=r1 provider=- error=All providers unavailable");

        let cancelled = OrchestrationEvent::RequestCancelled {
            request_id: "r2".into(),
        };
        assert_eq!(TracingObserver::level_for(&cancelled), Level::INFO);
    }

    #[test]
    fn test_on_event_without_subscriber() {
        let observer = TracingObserver::new();
        assert_eq!(observer.name(), "tracing");
        observer.on_event(&OrchestrationEvent::CircuitClosed {
            provider: "deepseek".into(),
        });
    }
}
