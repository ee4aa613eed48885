use std::sync::Arc;
use std::time::Duration;

use core_types::{Event, ExecutionClient, OrderOutcome, OrderStatus, OrderStatusReport};
use infra_bus::EventBus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::update;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
    /// Consecutive failed status queries tolerated before giving up.
    pub max_poll_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 120,
            max_poll_errors: 3,
        }
    }
}

/// Poll the venue until the order reaches a terminal status, the poll or
/// error budget runs out, or `cancel` fires. The outcome is published as a
/// single `OrderUpdate`; cancellation publishes nothing.
pub fn spawn_order_poller(
    client: Arc<dyn ExecutionClient>,
    bus: EventBus<Event>,
    order_id: String,
    policy: PollPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(outcome) = poll_until_done(client.as_ref(), &order_id, policy, &cancel).await
        else {
            tracing::debug!(order_id = %order_id, "order polling cancelled");
            return;
        };
        if let Err(err) = bus.publish(Event::OrderUpdate(update(&order_id, outcome))).await {
            tracing::warn!(order_id = %order_id, error = %err, "dropping order update");
        }
    })
}

async fn poll_until_done(
    client: &dyn ExecutionClient,
    order_id: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Option<OrderOutcome> {
    let max_polls = policy.max_polls.max(1);
    let max_errors = policy.max_poll_errors.max(1);
    let mut ticker = tokio::time::interval(policy.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut polls = 0u32;
    let mut errors = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }
        polls += 1;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = client.order_status(order_id) => r,
        };

        match response {
            Ok(report) => {
                match terminal_outcome(report) {
                    Ok(Some(outcome)) => return Some(outcome),
                    Ok(None) => {
                        errors = 0;
                        tracing::debug!(order_id, polls, "order still pending");
                    }
                    Err(reason) => {
                        errors += 1;
                        tracing::warn!(order_id, reason = %reason, "unusable status report");
                        if errors >= max_errors {
                            return Some(OrderOutcome::Lost { reason });
                        }
                    }
                }
            }
            Err(err) if err.is_retryable() => {
                errors += 1;
                tracing::warn!(order_id, errors, error = %err, "order status query failed");
                if errors >= max_errors {
                    return Some(OrderOutcome::Lost {
                        reason: format!("{errors} consecutive status errors: {err}"),
                    });
                }
            }
            Err(err) => {
                tracing::error!(order_id, error = %err, "order status query refused");
                return Some(OrderOutcome::Lost {
                    reason: err.to_string(),
                });
            }
        }

        if polls >= max_polls {
            return Some(OrderOutcome::Lost {
                reason: format!("no terminal status after {polls} polls"),
            });
        }
    }
}

fn terminal_outcome(report: OrderStatusReport) -> Result<Option<OrderOutcome>, String> {
    match report.status {
        OrderStatus::Pending => Ok(None),
        OrderStatus::Filled => {
            let price = report
                .filled_price
                .ok_or_else(|| "filled status without a fill price".to_string())?;
            if !usable(price) {
                return Err(format!("filled status with invalid price: {price}"));
            }
            if let Some(quantity) = report.filled_quantity.filter(|q| !usable(*q)) {
                return Err(format!("filled status with invalid quantity: {quantity}"));
            }
            Ok(Some(OrderOutcome::Filled {
                price,
                quantity: report.filled_quantity,
            }))
        }
        OrderStatus::Rejected => Ok(Some(OrderOutcome::Rejected {
            reason: report.reason.unwrap_or_else(|| "rejected by venue".to_string()),
        })),
        OrderStatus::Cancelled => Ok(Some(OrderOutcome::Cancelled)),
    }
}

fn usable(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
