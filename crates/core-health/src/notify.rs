//! Notification sink for health transitions
//!
//! The engine never formats or sends messages; it only reports the two
//! transitions the messaging subsystem cares about. Delivery is
//! fire-and-forget: a sink must not fail the write that triggered it.

use crate::Provider;
use async_trait::async_trait;
use tether_core_classify::ErrorKind;
use tracing::{info, warn};

/// A health transition worth telling the user about
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// Automatic recovery is impossible; the user must reconnect the account
    ReconnectionRequired {
        user_id: String,
        provider: Provider,
        kind: Option<ErrorKind>,
        message: Option<String>,
    },
    /// A previously broken connection is healthy again
    Recovered { user_id: String, provider: Provider },
}

/// Fire-and-forget consumer of [`HealthEvent`]s
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: HealthEvent);
}

/// Default sink: logs transitions and nothing else
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: HealthEvent) {
        match event {
            HealthEvent::ReconnectionRequired {
                user_id,
                provider,
                kind,
                ..
            } => {
                warn!(%user_id, %provider, ?kind, "connection requires manual reconnection");
            }
            HealthEvent::Recovered { user_id, provider } => {
                info!(%user_id, %provider, "connection recovered");
            }
        }
    }
}
