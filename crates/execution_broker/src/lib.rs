use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use core_types::{
    new_id, ExecutionClient, ExecutionError, OrderRequestEvent, OrderStatus, OrderStatusReport,
};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub mode: ExecutionMode,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            endpoint: "http://127.0.0.1:8000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    price: f64,
    quantity: f64,
}

/// Broker execution over REST, or an in-process paper venue that fills
/// every order immediately at its reference price.
#[derive(Clone)]
pub struct BrokerExecution {
    mode: ExecutionMode,
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    paper_orders: Arc<RwLock<HashMap<String, PaperOrder>>>,
}

#[derive(Debug, Serialize)]
struct PlaceOrder<'a> {
    ticker: &'a str,
    action: String,
    quantity: f64,
    order_type: String,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    order_id: Option<String>,
}

impl BrokerExecution {
    pub fn new(cfg: BrokerConfig) -> Result<Self> {
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            mode: cfg.mode,
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            paper_orders: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn paper() -> Result<Self> {
        Self::new(BrokerConfig::default())
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn paper_orders_count(&self) -> usize {
        self.paper_orders.read().len()
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.header(reqwest::header::ACCEPT, "application/json");
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

fn transport(err: reqwest::Error) -> ExecutionError {
    ExecutionError::Transport(err.to_string())
}

async fn classify(res: reqwest::Response) -> Result<reqwest::Response, ExecutionError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        Err(ExecutionError::UnknownOrder(body))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ExecutionError::Transport(format!("{status}: {body}")))
    } else {
        Err(ExecutionError::Rejected(format!("{status}: {body}")))
    }
}

#[async_trait]
impl ExecutionClient for BrokerExecution {
    async fn submit_order(&self, request: &OrderRequestEvent) -> Result<String, ExecutionError> {
        match self.mode {
            ExecutionMode::Paper => {
                let order_id = new_id();
                self.paper_orders.write().insert(
                    order_id.clone(),
                    PaperOrder {
                        price: request.reference_price,
                        quantity: request.quantity,
                    },
                );
                Ok(order_id)
            }
            ExecutionMode::Live => {
                let payload = PlaceOrder {
                    ticker: &request.instrument,
                    action: request.action.to_string(),
                    quantity: request.quantity,
                    order_type: request.order_type.to_string(),
                };
                let res = self
                    .with_auth(self.http.post(format!("{}/orders", self.endpoint)))
                    .json(&payload)
                    .send()
                    .await
                    .map_err(transport)?;
                let res = classify(res).await?;
                let body: PlaceOrderResponse = res
                    .json()
                    .await
                    .map_err(|e| ExecutionError::Malformed(e.to_string()))?;
                body.order_id
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| ExecutionError::Malformed("response without order_id".into()))
            }
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, ExecutionError> {
        match self.mode {
            ExecutionMode::Paper => {
                // Paper orders fill on first query and are forgotten once reported.
                let order = self
                    .paper_orders
                    .write()
                    .remove(order_id)
                    .ok_or_else(|| ExecutionError::UnknownOrder(order_id.to_string()))?;
                Ok(OrderStatusReport {
                    status: OrderStatus::Filled,
                    filled_price: Some(order.price),
                    filled_quantity: Some(order.quantity),
                    reason: None,
                })
            }
            ExecutionMode::Live => {
                let res = self
                    .with_auth(self.http.get(format!("{}/orders/{order_id}", self.endpoint)))
                    .send()
                    .await
                    .map_err(transport)?;
                let res = classify(res).await?;
                res.json::<OrderStatusReport>()
                    .await
                    .map_err(|e| ExecutionError::Malformed(e.to_string()))
            }
        }
    }
}

/// Submit with bounded retries on transient failures, doubling the pause
/// between attempts. Venue rejections are returned at once.
pub async fn submit_with_retry(
    client: &dyn ExecutionClient,
    request: &OrderRequestEvent,
    attempts: u32,
    base_backoff: Duration,
    cancel: &CancellationToken,
) -> Result<String, ExecutionError> {
    let attempts = attempts.max(1);
    let mut backoff = base_backoff;
    let mut attempt = 1;
    loop {
        match client.submit_order(request).await {
            Ok(order_id) => {
                metrics::counter!("orders.submitted").increment(1);
                tracing::info!(
                    order_id = %order_id,
                    instrument = %request.instrument,
                    action = %request.action,
                    quantity = request.quantity,
                    attempt,
                    "order placed"
                );
                return Ok(order_id);
            }
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    instrument = %request.instrument,
                    attempt,
                    error = %err,
                    "order submit failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use core_types::{OrderType, TradeAction};
    use parking_lot::Mutex;

    use super::*;

    fn request(quantity: f64, price: f64) -> OrderRequestEvent {
        OrderRequestEvent {
            request_id: new_id(),
            instrument: "RELIANCE".to_string(),
            action: TradeAction::Buy,
            quantity,
            reference_price: price,
            order_type: OrderType::Market,
            observed_at: Utc::now(),
        }
    }

    struct Flaky {
        failures: Mutex<Vec<ExecutionError>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ExecutionClient for Flaky {
        async fn submit_order(&self, _r: &OrderRequestEvent) -> Result<String, ExecutionError> {
            *self.calls.lock() += 1;
            match self.failures.lock().pop() {
                Some(err) => Err(err),
                None => Ok("ok-1".to_string()),
            }
        }

        async fn order_status(&self, id: &str) -> Result<OrderStatusReport, ExecutionError> {
            Err(ExecutionError::UnknownOrder(id.to_string()))
        }
    }

    #[tokio::test]
    async fn paper_orders_fill_at_reference_price() {
        let broker = BrokerExecution::paper().expect("client");
        let id = broker.submit_order(&request(10.0, 2_500.0)).await.expect("submit");
        let report = broker.order_status(&id).await.expect("status");
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.filled_price, Some(2_500.0));
        assert_eq!(report.filled_quantity, Some(10.0));
    }

    #[tokio::test]
    async fn reported_paper_orders_are_forgotten() {
        let broker = BrokerExecution::paper().expect("client");
        let first = broker.submit_order(&request(1.0, 10.0)).await.expect("submit");
        let second = broker.submit_order(&request(2.0, 10.0)).await.expect("submit");
        assert_eq!(broker.paper_orders_count(), 2);

        broker.order_status(&first).await.expect("status");
        assert_eq!(broker.paper_orders_count(), 1);
        broker.order_status(&second).await.expect("status");
        assert_eq!(broker.paper_orders_count(), 0);

        let err = broker.order_status(&first).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn paper_unknown_order() {
        let broker = BrokerExecution::paper().expect("client");
        let err = broker.order_status("nope").await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownOrder(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn live_mode_unreachable_is_transport_error() {
        let broker = BrokerExecution::new(BrokerConfig {
            mode: ExecutionMode::Live,
            endpoint: "http://127.0.0.1:9".to_string(),
            api_key: Some("k".to_string()),
            timeout: Duration::from_millis(500),
        })
        .expect("client");
        let err = broker.submit_order(&request(1.0, 1.0)).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let client = Flaky {
            failures: Mutex::new(vec![
                ExecutionError::Transport("reset".into()),
                ExecutionError::Transport("timeout".into()),
            ]),
            calls: Mutex::new(0),
        };
        let id = submit_with_retry(
            &client,
            &request(1.0, 1.0),
            3,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(id, "ok-1");
        assert_eq!(*client.calls.lock(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let client = Flaky {
            failures: Mutex::new(vec![
                ExecutionError::Transport("a".into()),
                ExecutionError::Transport("b".into()),
                ExecutionError::Transport("c".into()),
            ]),
            calls: Mutex::new(0),
        };
        let out = submit_with_retry(
            &client,
            &request(1.0, 1.0),
            2,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(out.is_err());
        assert_eq!(*client.calls.lock(), 2);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let client = Flaky {
            failures: Mutex::new(vec![ExecutionError::Rejected("margin".into())]),
            calls: Mutex::new(0),
        };
        let out = submit_with_retry(
            &client,
            &request(1.0, 1.0),
            5,
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(out, Err(ExecutionError::Rejected(_))));
        assert_eq!(*client.calls.lock(), 1);
    }
}
