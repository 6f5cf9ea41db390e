//! Slow and hanging request alerts.
//!
//! Events are queued on a bounded channel and delivered by one background
//! worker. Emitting never blocks: when the queue is full the event is
//! dropped with a warning.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Named alert events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A candidate answered (or failed) after the slow-request threshold.
    LlmTooSlow,
    /// A candidate hit its invocation timeout.
    LlmRequestsHanging,
}

impl AlertKind {
    pub const ALL: [AlertKind; 2] = [AlertKind::LlmTooSlow, AlertKind::LlmRequestsHanging];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::LlmTooSlow => "llm_too_slow",
            AlertKind::LlmRequestsHanging => "llm_requests_hanging",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown alert event '{}'", s))
    }
}

/// One alert occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub alias: String,
    pub provider_id: String,
    pub target_model: String,
    pub elapsed_ms: u64,
    pub threshold_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        kind: AlertKind,
        alias: &str,
        provider_id: &str,
        target_model: &str,
        elapsed: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            kind,
            alias: alias.to_string(),
            provider_id: provider_id.to_string(),
            target_model: target_model.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            threshold_ms: threshold.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for alert events (log, webhook, pager, ...).
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &AlertEvent);
}

/// Writes every alert as a `warn` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) {
        tracing::warn!(
            alert = %event.kind,
            alias = %event.alias,
            provider = %event.provider_id,
            model = %event.target_model,
            elapsed_ms = event.elapsed_ms,
            threshold_ms = event.threshold_ms,
            "LLM alert"
        );
    }
}

/// Handle for emitting alerts. Cheap to clone.
#[derive(Clone)]
pub struct Alerter {
    tx: Option<mpsc::Sender<AlertEvent>>,
    enabled: Arc<HashSet<AlertKind>>,
}

impl fmt::Debug for Alerter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alerter")
            .field("active", &self.tx.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Default for Alerter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Alerter {
    /// An alerter that drops everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            enabled: Arc::new(HashSet::new()),
        }
    }

    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(
        sinks: Vec<Arc<dyn AlertSink>>,
        kinds: impl IntoIterator<Item = AlertKind>,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<AlertEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    sink.deliver(&event).await;
                }
            }
            tracing::debug!("Alert worker stopped");
        });

        Self {
            tx: Some(tx),
            enabled: Arc::new(kinds.into_iter().collect()),
        }
    }

    pub fn is_enabled(&self, kind: AlertKind) -> bool {
        self.tx.is_some() && self.enabled.contains(&kind)
    }

    /// Queue an event without waiting.
    pub fn emit(&self, event: AlertEvent) {
        let Some(tx) = &self.tx else { return };
        if !self.enabled.contains(&event.kind) {
            return;
        }
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(alert = %event.kind, alias = %event.alias, "Alert queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(alert = %event.kind, "Alert worker gone, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChannelSink(mpsc::UnboundedSender<AlertEvent>);

    #[async_trait]
    impl AlertSink for ChannelSink {
        fn name(&self) -> &str {
            "channel"
        }

        async fn deliver(&self, event: &AlertEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    fn event(kind: AlertKind) -> AlertEvent {
        AlertEvent::new(
            kind,
            "gpt-4",
            "openai",
            "gpt-4o",
            Duration::from_secs(40),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_alert_kind_names() {
        assert_eq!("llm_too_slow".parse(), Ok(AlertKind::LlmTooSlow));
        assert_eq!(
            "llm_requests_hanging".parse(),
            Ok(AlertKind::LlmRequestsHanging)
        );
        assert!("llm_exceptions".parse::<AlertKind>().is_err());
    }

    #[tokio::test]
    async fn test_enabled_events_are_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let alerter = Alerter::spawn(
            vec![Arc::new(ChannelSink(tx))],
            [AlertKind::LlmTooSlow],
            8,
        );

        alerter.emit(event(AlertKind::LlmRequestsHanging));
        alerter.emit(event(AlertKind::LlmTooSlow));

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.kind, AlertKind::LlmTooSlow);
        assert_eq!(delivered.elapsed_ms, 40_000);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        struct StuckSink;

        #[async_trait]
        impl AlertSink for StuckSink {
            fn name(&self) -> &str {
                "stuck"
            }

            async fn deliver(&self, _event: &AlertEvent) {
                std::future::pending::<()>().await;
            }
        }

        let alerter = Alerter::spawn(vec![Arc::new(StuckSink)], AlertKind::ALL, 1);
        for _ in 0..100 {
            alerter.emit(event(AlertKind::LlmTooSlow));
        }
    }

    #[test]
    fn test_disabled_alerter_is_inert() {
        let alerter = Alerter::disabled();
        assert!(!alerter.is_enabled(AlertKind::LlmTooSlow));
        alerter.emit(event(AlertKind::LlmTooSlow));
    }
}
