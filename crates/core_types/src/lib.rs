use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

/// Directional outcome of fusion. `Hold` never leaves the fuser as a signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        };
        f.write_str(value)
    }
}

/// Side of an order or fill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        };
        f.write_str(value)
    }
}

impl TryFrom<Intent> for TradeAction {
    type Error = ValidationError;

    fn try_from(value: Intent) -> std::result::Result<Self, Self::Error> {
        match value {
            Intent::Buy => Ok(Self::Buy),
            Intent::Sell => Ok(Self::Sell),
            Intent::Hold => Err(ValidationError::NotTradable(value)),
        }
    }
}

impl From<TradeAction> for Intent {
    fn from(value: TradeAction) -> Self {
        match value {
            TradeAction::Buy => Self::Buy,
            TradeAction::Sell => Self::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    #[default]
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => f.write_str("MARKET"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketEvent {
    pub instrument: String,
    pub price: f64,
    pub volume: f64,
    /// Producer label, e.g. `ws` or `synthetic` once the feed has degraded.
    pub source: SmolStr,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsEvent {
    pub headline: String,
    pub source: String,
    /// Compound score in [-1, 1].
    pub sentiment: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionEvent {
    pub instrument: String,
    pub pattern: String,
    /// Detector confidence in [0, 1].
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEvent {
    pub instrument: String,
    pub action: Intent,
    pub confidence: f64,
    pub reason: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequestEvent {
    /// Correlates the submission with its ack or failure.
    pub request_id: String,
    pub instrument: String,
    pub action: TradeAction,
    pub quantity: f64,
    /// Price the request was sized against.
    pub reference_price: f64,
    #[serde(default)]
    pub order_type: OrderType,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAck {
    pub request_id: String,
    pub order_id: String,
    pub instrument: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub observed_at: DateTime<Utc>,
}

/// The broker refused or never answered a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitFailedEvent {
    pub request_id: String,
    pub instrument: String,
    pub reason: String,
    pub observed_at: DateTime<Utc>,
}

/// What an order poller observed about an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderOutcome {
    Filled { price: f64, quantity: Option<f64> },
    Rejected { reason: String },
    Cancelled,
    /// Tracking gave up (transport errors or poll budget exhausted).
    Lost { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderUpdateEvent {
    pub order_id: String,
    pub outcome: OrderOutcome,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillEvent {
    pub order_id: String,
    pub instrument: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PnLUpdateEvent {
    pub observed_at: DateTime<Utc>,
    pub portfolio_value: f64,
    pub cash: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequestEvent {
    pub text: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplanationEvent {
    pub request: String,
    pub text: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Market(MarketEvent),
    News(NewsEvent),
    Vision(VisionEvent),
    Signal(SignalEvent),
    OrderRequest(OrderRequestEvent),
    OrderAccepted(OrderAck),
    SubmitFailed(SubmitFailedEvent),
    OrderUpdate(OrderUpdateEvent),
    Fill(FillEvent),
    PnlUpdate(PnLUpdateEvent),
    ChatRequest(ChatRequestEvent),
    Explanation(ExplanationEvent),
    Alert(AlertEvent),
    Control(ControlCommand),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Market(_) => "market",
            Self::News(_) => "news",
            Self::Vision(_) => "vision",
            Self::Signal(_) => "signal",
            Self::OrderRequest(_) => "order_request",
            Self::OrderAccepted(_) => "order_accepted",
            Self::SubmitFailed(_) => "submit_failed",
            Self::OrderUpdate(_) => "order_update",
            Self::Fill(_) => "fill",
            Self::PnlUpdate(_) => "pnl_update",
            Self::ChatRequest(_) => "chat_request",
            Self::Explanation(_) => "explanation",
            Self::Alert(_) => "alert",
            Self::Control(_) => "control",
        }
    }

    /// Whether presentation subscribers care about this event.
    pub fn is_displayable(&self) -> bool {
        matches!(
            self,
            Self::Market(_)
                | Self::Signal(_)
                | Self::PnlUpdate(_)
                | Self::Alert(_)
                | Self::Explanation(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(value)
    }
}

/// Execution venue answer to an order-status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    #[serde(default, alias = "fill_price")]
    pub filled_price: Option<f64>,
    #[serde(default, alias = "quantity")]
    pub filled_quantity: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Fused directional decision for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome {
    pub action: Intent,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
    #[error("event bus full")]
    Full,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("action {0} is not tradable")]
    NotTradable(Intent),
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("missing instrument")]
    MissingInstrument,
    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: f64 },
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Network or timeout failures; callers may retry up to a bound.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("order rejected by venue: {0}")]
    Rejected(String),
    #[error("unknown order: {0}")]
    UnknownOrder(String),
    #[error("malformed venue response: {0}")]
    Malformed(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type DynStream<T> = BoxStream<'static, Result<T>>;

#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn stream_ticks(&self, instruments: Vec<String>) -> Result<DynStream<MarketEvent>>;
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit_order(
        &self,
        request: &OrderRequestEvent,
    ) -> std::result::Result<String, ExecutionError>;

    async fn order_status(
        &self,
        order_id: &str,
    ) -> std::result::Result<OrderStatusReport, ExecutionError>;
}

/// Natural-language explanation source. Implementations never fail; they
/// degrade to a fixed message instead.
#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(&self, prompt: &str) -> String;
}

pub trait SentimentScorer: Send + Sync {
    /// Compound score in [-1, 1]; 0.0 for empty or unscorable text.
    fn score(&self, text: &str) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternDetection {
    pub pattern: String,
    pub confidence: f64,
}

#[async_trait]
pub trait PatternDetector: Send {
    async fn detect(&mut self) -> Result<Vec<PatternDetection>>;
}

/// Borrowed view of everything known about one instrument.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentSnapshot<'a> {
    pub market: &'a MarketEvent,
    pub news: Option<&'a NewsEvent>,
    pub vision: Option<&'a VisionEvent>,
}

pub trait FusionStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn fuse(&self, snapshot: InstrumentSnapshot<'_>) -> FusionOutcome;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
