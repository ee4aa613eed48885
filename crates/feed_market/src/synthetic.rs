use std::time::Duration;

use chrono::Utc;
use core_types::MarketEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::SYNTHETIC_SOURCE;

const MAX_STEP: f64 = 0.005;

/// Bounded multiplicative random walk, one price per instrument.
pub struct SyntheticWalk {
    rng: StdRng,
    prices: Vec<(String, f64)>,
}

impl SyntheticWalk {
    pub fn new(instruments: &[String], start_price: f64) -> Self {
        let start = if start_price.is_finite() && start_price > 0.0 {
            start_price
        } else {
            100.0
        };
        Self {
            rng: StdRng::from_entropy(),
            prices: instruments.iter().map(|i| (i.clone(), start)).collect(),
        }
    }

    pub fn with_seed(instruments: &[String], start_price: f64, seed: u64) -> Self {
        let mut walk = Self::new(instruments, start_price);
        walk.rng = StdRng::seed_from_u64(seed);
        walk
    }

    /// Advance every instrument one step.
    pub fn step(&mut self) -> Vec<MarketEvent> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(self.prices.len());
        for (instrument, price) in &mut self.prices {
            let drift = self.rng.gen_range(-MAX_STEP..=MAX_STEP);
            *price = (*price * (1.0 + drift)).max(0.01);
            out.push(MarketEvent {
                instrument: instrument.clone(),
                price: *price,
                volume: f64::from(self.rng.gen_range(1u32..=500)),
                source: SYNTHETIC_SOURCE.into(),
                observed_at: now,
            });
        }
        out
    }

    pub(crate) async fn run(
        mut self,
        interval: Duration,
        tx: &mpsc::Sender<MarketEvent>,
        cancel: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for tick in self.step() {
                if tx.send(tick).await.is_err() {
                    return;
                }
            }
        }
    }
}
