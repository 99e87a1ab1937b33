//! Glue between the proxy pumps and the event pipeline: filter, plugin
//! fan-out, aggregation, and hand-off of sealed batches to the uploader.

use std::sync::Arc;

use km_core::{Batch, Direction, Event};
use km_pipeline::{FilterChain, SessionAggregator};
use km_plugin::PluginHost;
use km_protocol::JsonRpcEnvelope;
use tokio::sync::mpsc;

use crate::proxy::EventSink;

pub struct EventPipeline {
    filter: Arc<FilterChain>,
    aggregator: Arc<SessionAggregator>,
    plugins: Option<Arc<PluginHost>>,
    batch_tx: mpsc::Sender<Batch>,
}

impl EventPipeline {
    pub fn new(
        filter: Arc<FilterChain>,
        aggregator: Arc<SessionAggregator>,
        plugins: Option<Arc<PluginHost>>,
        batch_tx: mpsc::Sender<Batch>,
    ) -> Self {
        Self {
            filter,
            aggregator,
            plugins,
            batch_tx,
        }
    }
}

#[async_trait::async_trait]
impl EventSink for EventPipeline {
    async fn on_message(&self, direction: Direction, envelope: JsonRpcEnvelope, raw: &[u8]) {
        let id = self.aggregator.next_event_id();
        let event = match Event::new(id, direction, envelope.method(), raw) {
            Ok(event) => event,
            Err(error) => {
                tracing::debug!(target: "km::monitor", %error, "dropping malformed event");
                return;
            }
        };

        // The filter scores the event (one-shot) before any plugin sees it.
        let (captured, reason) = self.filter.should_capture(&event).await;
        if !captured {
            tracing::trace!(
                target: "km::monitor",
                event = %event.id(),
                reason = reason.as_deref().unwrap_or(""),
                "event filtered"
            );
            return;
        }

        let event = if let Some(plugins) = &self.plugins {
            match plugins.process_event(&event).await {
                None => return,
                Some(message) => rebuild_if_transformed(event, message),
            }
        } else {
            event
        };

        match self.aggregator.add_event(event) {
            Ok(Some(batch)) => {
                // Blocking on a full channel is the backpressure path.
                if self.batch_tx.send(batch).await.is_err() {
                    tracing::warn!(target: "km::monitor", "uploader channel closed, dropping batch");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(target: "km::monitor", %error, "failed to aggregate event");
            }
        }
    }
}

/// When a filter plugin rewrote the message, record the rewritten form. The
/// untouched fast path keeps the original event and its timestamp.
fn rebuild_if_transformed(event: Event, message: km_plugin::PluginMessage) -> Event {
    if message.method == event.method()
        && message
            .decode_payload()
            .is_some_and(|p| p == event.payload_view())
    {
        return event;
    }

    let payload = match message.decode_payload() {
        Some(payload) if !payload.is_empty() => payload,
        _ => return event,
    };
    match Event::new(event.id().to_string(), event.direction(), &message.method, &payload) {
        Ok(rebuilt) => {
            rebuilt.update_risk_score(km_core::RiskScore::new(message.risk_score));
            rebuilt
        }
        Err(_) => event,
    }
}
