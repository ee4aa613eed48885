use std::collections::BTreeMap;

use chrono::Utc;
use core_types::{FillEvent, PnLUpdateEvent, TradeAction};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_INITIAL_CASH: f64 = 100_000.0;

const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Position {
    pub instrument: String,
    pub quantity: f64,
    pub avg_cost: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("insufficient funds for {instrument}: need {required:.2}, have {available:.2}")]
    InsufficientFunds {
        instrument: String,
        required: f64,
        available: f64,
    },
    #[error("oversell of {instrument}: selling {requested}, holding {held}")]
    Oversell {
        instrument: String,
        requested: f64,
        held: f64,
    },
    #[error("invalid fill {field}: {value}")]
    InvalidFill { field: &'static str, value: f64 },
}

impl LedgerError {
    /// Fills that contradict the ledger rather than being malformed.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::InsufficientFunds { .. } | Self::Oversell { .. })
    }
}

/// Ledger state right after a fill was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FillApplied {
    pub cash: f64,
    pub position: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Valuation {
    pub portfolio_value: f64,
    pub cash: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl Valuation {
    pub fn to_event(&self) -> PnLUpdateEvent {
        PnLUpdateEvent {
            observed_at: Utc::now(),
            portfolio_value: self.portfolio_value,
            cash: self.cash,
            realized_pnl: self.realized_pnl,
        }
    }
}

/// Cash and holdings. `cash` never goes negative and every held quantity is
/// strictly positive; a fill either applies fully or not at all.
#[derive(Debug, Clone)]
pub struct Portfolio {
    cash: f64,
    positions: BTreeMap<String, Position>,
    realized_pnl: f64,
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CASH)
    }
}

impl Portfolio {
    pub fn new(initial_cash: f64) -> Self {
        let cash = if initial_cash.is_finite() {
            initial_cash.max(0.0)
        } else {
            0.0
        };
        Self {
            cash,
            positions: BTreeMap::new(),
            realized_pnl: 0.0,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn held(&self, instrument: &str) -> f64 {
        self.positions.get(instrument).map_or(0.0, |p| p.quantity)
    }

    pub fn is_held(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn apply_fill(&mut self, fill: &FillEvent) -> Result<FillApplied, LedgerError> {
        check_positive("price", fill.price)?;
        check_positive("quantity", fill.quantity)?;

        match fill.action {
            TradeAction::Buy => {
                let cost = fill.price * fill.quantity;
                if cost > self.cash {
                    return Err(LedgerError::InsufficientFunds {
                        instrument: fill.instrument.clone(),
                        required: cost,
                        available: self.cash,
                    });
                }
                self.cash -= cost;
                let pos = self
                    .positions
                    .entry(fill.instrument.clone())
                    .or_insert_with(|| Position {
                        instrument: fill.instrument.clone(),
                        quantity: 0.0,
                        avg_cost: 0.0,
                    });
                pos.avg_cost = weighted_avg(pos.avg_cost, pos.quantity, fill.price, fill.quantity);
                pos.quantity += fill.quantity;
            }
            TradeAction::Sell => {
                let held = self.held(&fill.instrument);
                if fill.quantity > held + QTY_EPSILON {
                    return Err(LedgerError::Oversell {
                        instrument: fill.instrument.clone(),
                        requested: fill.quantity,
                        held,
                    });
                }
                if let Some(pos) = self.positions.get_mut(&fill.instrument) {
                    self.realized_pnl += (fill.price - pos.avg_cost) * fill.quantity;
                    pos.quantity -= fill.quantity;
                    if pos.quantity <= QTY_EPSILON {
                        self.positions.remove(&fill.instrument);
                    }
                }
                self.cash += fill.price * fill.quantity;
            }
        }

        metrics::counter!("ledger.fill_applied").increment(1);
        tracing::info!(
            order_id = %fill.order_id,
            instrument = %fill.instrument,
            action = %fill.action,
            quantity = fill.quantity,
            price = fill.price,
            cash = self.cash,
            "fill applied"
        );
        Ok(FillApplied {
            cash: self.cash,
            position: self.held(&fill.instrument),
            realized_pnl: self.realized_pnl,
        })
    }

    /// Mark to market. Instruments without an observed price are carried at
    /// average cost.
    pub fn value_with<F>(&self, last_price: F) -> Valuation
    where
        F: Fn(&str) -> Option<f64>,
    {
        let mut holdings = 0.0;
        let mut unrealized = 0.0;
        for pos in self.positions.values() {
            let price = last_price(&pos.instrument)
                .filter(|p| p.is_finite() && *p > 0.0)
                .unwrap_or(pos.avg_cost);
            holdings += pos.quantity * price;
            unrealized += (price - pos.avg_cost) * pos.quantity;
        }
        Valuation {
            portfolio_value: self.cash + holdings,
            cash: self.cash,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
        }
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), LedgerError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidFill { field, value })
    }
}

fn weighted_avg(current_avg: f64, current_qty: f64, px: f64, qty: f64) -> f64 {
    let total = current_qty + qty;
    if total <= 0.0 {
        return 0.0;
    }
    (current_avg * current_qty + px * qty) / total
}
