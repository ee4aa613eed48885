mod rate_limit;

use chrono::Utc;
use core_types::{
    new_id, OrderRequestEvent, OrderType, SignalEvent, TradeAction, ValidationError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rate_limit::SlidingWindowLimiter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskLimits {
    pub max_order_fraction_of_cash: f64,
    pub max_position_fraction_of_portfolio: f64,
    pub requests_per_second: u32,
    /// Signals below this confidence are dropped. Zero disables the gate.
    pub min_signal_confidence: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_fraction_of_cash: 0.10,
            max_position_fraction_of_portfolio: 0.20,
            requests_per_second: 10,
            min_signal_confidence: 0.0,
        }
    }
}

/// Account view the risk manager sizes against. The `pending_*` fields
/// cover orders admitted earlier that have not reached a terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RiskContext {
    pub cash: f64,
    pub held: f64,
    pub reference_price: Option<f64>,
    pub portfolio_value: f64,
    pub pending_buy: f64,
    pub pending_sell: f64,
    pub pending_buy_notional: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskRejection {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("confidence {confidence} below minimum {min}")]
    LowConfidence { confidence: f64, min: f64 },
    #[error("no usable reference price")]
    NoReferencePrice,
    #[error("sized quantity is zero: {0}")]
    ZeroQuantity(&'static str),
}

impl RiskRejection {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_signal",
            Self::LowConfidence { .. } => "low_confidence",
            Self::NoReferencePrice => "no_reference_price",
            Self::ZeroQuantity(reason) => *reason,
        }
    }
}

pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Turn a signal into a sized order request, or say why not.
    pub fn evaluate(
        &self,
        signal: &SignalEvent,
        ctx: &RiskContext,
    ) -> Result<OrderRequestEvent, RiskRejection> {
        let result = self.size(signal, ctx);
        if let Err(rejection) = &result {
            metrics::counter!("risk.rejected", "reason" => rejection.reason()).increment(1);
            tracing::warn!(
                instrument = %signal.instrument,
                action = %signal.action,
                reason = %rejection,
                "signal rejected"
            );
        }
        result
    }

    fn size(
        &self,
        signal: &SignalEvent,
        ctx: &RiskContext,
    ) -> Result<OrderRequestEvent, RiskRejection> {
        if signal.instrument.trim().is_empty() {
            return Err(ValidationError::MissingInstrument.into());
        }
        if !signal.confidence.is_finite() || !(0.0..=1.0).contains(&signal.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(signal.confidence).into());
        }
        let action = TradeAction::try_from(signal.action)?;
        if signal.confidence < self.limits.min_signal_confidence {
            return Err(RiskRejection::LowConfidence {
                confidence: signal.confidence,
                min: self.limits.min_signal_confidence,
            });
        }

        let price = ctx
            .reference_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or(RiskRejection::NoReferencePrice)?;

        let quantity = match action {
            TradeAction::Buy => self.buy_quantity(ctx, price)?,
            TradeAction::Sell => {
                let held = ctx.held.max(0.0);
                if held <= 0.0 {
                    return Err(RiskRejection::ZeroQuantity("flat_position"));
                }
                let sellable = held - ctx.pending_sell.max(0.0);
                if sellable <= 0.0 {
                    return Err(RiskRejection::ZeroQuantity("exit_pending"));
                }
                sellable
            }
        };

        Ok(OrderRequestEvent {
            request_id: new_id(),
            instrument: signal.instrument.clone(),
            action,
            quantity,
            reference_price: price,
            order_type: OrderType::Market,
            observed_at: Utc::now(),
        })
    }

    fn buy_quantity(&self, ctx: &RiskContext, price: f64) -> Result<f64, RiskRejection> {
        let free_cash = ctx.cash - ctx.pending_buy_notional.max(0.0);
        let spend = free_cash.max(0.0) * self.limits.max_order_fraction_of_cash;
        let mut quantity = (spend / price).floor();
        if quantity <= 0.0 {
            return Err(RiskRejection::ZeroQuantity("insufficient_cash"));
        }

        let cap = ctx.portfolio_value.max(0.0) * self.limits.max_position_fraction_of_portfolio;
        let committed = ctx.held.max(0.0) + ctx.pending_buy.max(0.0);
        let headroom = cap - committed * price;
        let allowed = if headroom > 0.0 {
            (headroom / price).floor()
        } else {
            0.0
        };
        if allowed < quantity {
            tracing::debug!(quantity, allowed, "buy reduced by position cap");
            quantity = allowed;
        }
        if quantity <= 0.0 {
            return Err(RiskRejection::ZeroQuantity("position_cap"));
        }
        Ok(quantity)
    }
}
