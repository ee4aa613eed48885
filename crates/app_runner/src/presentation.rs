//! Display-side consumers. They only ever see the presentation topic, so a
//! slow terminal never holds up the dispatcher.

use chrono::Utc;
use core_types::{ChatRequestEvent, Event};
use infra_bus::{EventBus, RingBus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::spawn_detached;

pub(super) fn spawn_event_log(presentation: &RingBus<Event>, cancel: CancellationToken) {
    let mut rx = presentation.subscribe();
    spawn_detached("presentation_log", false, async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                r = rx.recv() => r,
            };
            match received {
                Ok(event) => render(&event),
                Err(RecvError::Lagged(skipped)) => {
                    metrics::counter!("presentation.lagged").increment(skipped);
                    tracing::warn!(skipped, "presentation subscriber lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    });
}

fn render(event: &Event) {
    match event {
        Event::Signal(s) => tracing::info!(
            target: "presentation",
            instrument = %s.instrument,
            action = %s.action,
            confidence = s.confidence,
            reason = %s.reason,
            "signal"
        ),
        Event::Market(m) => tracing::debug!(
            target: "presentation",
            instrument = %m.instrument,
            price = m.price,
            source = %m.source,
            "tick"
        ),
        Event::PnlUpdate(p) => tracing::info!(
            target: "presentation",
            portfolio_value = p.portfolio_value,
            cash = p.cash,
            realized_pnl = p.realized_pnl,
            "pnl"
        ),
        Event::Explanation(e) => tracing::info!(
            target: "presentation",
            request = %e.request,
            text = %e.text,
            "explanation"
        ),
        Event::Alert(a) => tracing::warn!(
            target: "presentation",
            level = %a.level,
            message = %a.message,
            "alert"
        ),
        other => tracing::debug!(target: "presentation", kind = other.kind(), "event"),
    }
}

/// Read chat questions from stdin, one per line, until EOF or cancellation.
pub(super) fn spawn_stdin_chat(bus: EventBus<Event>, cancel: CancellationToken) {
    spawn_detached("stdin_chat", false, async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                l = lines.next_line() => l,
            };
            let text = match line {
                Ok(Some(text)) => text,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(?err, "stdin read failed");
                    return;
                }
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let event = Event::ChatRequest(ChatRequestEvent {
                text: text.to_string(),
                observed_at: Utc::now(),
            });
            if bus.publish(event).await.is_err() {
                return;
            }
        }
    });
}
