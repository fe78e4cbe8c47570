use std::sync::Arc;

use popcorn_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app_server::AppEvent;
use crate::broker::Broker;

/// Reads app server notifications and applies them to the broker.
pub struct EventBridge {
    broker: Arc<Broker>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl EventBridge {
    pub fn new(broker: Arc<Broker>, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self { broker, metrics }
    }

    /// Handle one notification.
    pub fn apply(&self, event: AppEvent) {
        match event {
            AppEvent::Provide { app, machine, tree } => {
                tracing::debug!(app = ?app, machine = %machine, "bridging provide");
                self.broker.provide(&machine, tree);
            }
            AppEvent::Update { machine, ops } => {
                if let Some(m) = &self.metrics {
                    m.counter_inc("transactions.committed", &[("machine", &machine)], 1);
                }
                tracing::trace!(machine = %machine, ops, "update committed");
            }
            AppEvent::Abandon { app, machine, tree } => {
                tracing::debug!(app = ?app, machine = %machine, "bridging abandon");
                self.broker.abandon(&machine, &tree);
            }
        }
    }

    /// Spawn the forwarding task. It ends when every sender is dropped or
    /// `cancel` fires.
    pub fn start(
        self,
        mut rx: mpsc::UnboundedReceiver<AppEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => self.apply(event),
                        None => {
                            tracing::info!("event bridge channel closed");
                            break;
                        }
                    },
                }
            }
        })
    }
}

/// Create an event bridge wired to the app server's channel.
pub fn create_bridge(
    broker: Arc<Broker>,
    metrics: Option<Arc<MetricsRecorder>>,
    rx: mpsc::UnboundedReceiver<AppEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(broker, metrics).start(rx, cancel)
}
