use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use core_types::{Event, PatternDetection, PatternDetector, VisionEvent};
use infra_bus::EventBus;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisionConfig {
    pub enabled: bool,
    /// Instrument whose chart is being watched.
    pub instrument: String,
    pub interval_ms: u64,
    /// Detections must score strictly above this.
    pub threshold: f64,
    pub detections_path: Option<PathBuf>,
    pub replay_loop: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instrument: String::new(),
            interval_ms: 1_000,
            threshold: 0.7,
            detections_path: None,
            replay_loop: false,
        }
    }
}

/// One line of a detections file: everything the model saw in one frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DetectionFrame {
    #[serde(default)]
    pub detections: Vec<PatternDetection>,
}

/// Replays recorded model output, one frame per `detect` call.
pub struct JsonlPatternDetector {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    replay_loop: bool,
}

impl JsonlPatternDetector {
    pub async fn open(path: impl AsRef<Path>, replay_loop: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lines = open_lines(&path).await?;
        Ok(Self {
            path,
            lines,
            replay_loop,
        })
    }
}

async fn open_lines(path: &Path) -> Result<Lines<BufReader<File>>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("open detections file {}", path.display()))?;
    Ok(BufReader::new(file).lines())
}

#[async_trait]
impl PatternDetector for JsonlPatternDetector {
    async fn detect(&mut self) -> Result<Vec<PatternDetection>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let frame: DetectionFrame =
                        serde_json::from_str(&line).context("decode detection frame")?;
                    return Ok(frame.detections);
                }
                None if self.replay_loop => {
                    self.lines = open_lines(&self.path).await?;
                    // An empty file would spin forever.
                    match self.lines.next_line().await? {
                        Some(line) if !line.trim().is_empty() => {
                            let frame: DetectionFrame =
                                serde_json::from_str(&line).context("decode detection frame")?;
                            return Ok(frame.detections);
                        }
                        _ => return Ok(Vec::new()),
                    }
                }
                None => return Ok(Vec::new()),
            }
        }
    }
}

pub fn confident_detections(
    instrument: &str,
    detections: Vec<PatternDetection>,
    threshold: f64,
) -> Vec<VisionEvent> {
    let now = Utc::now();
    detections
        .into_iter()
        .filter(|d| d.confidence.is_finite() && d.confidence > threshold && d.confidence <= 1.0)
        .map(|d| VisionEvent {
            instrument: instrument.to_string(),
            pattern: d.pattern,
            confidence: d.confidence,
            observed_at: now,
        })
        .collect()
}

pub struct VisionLoop {
    detector: Box<dyn PatternDetector>,
    instrument: String,
    interval: Duration,
    threshold: f64,
}

impl VisionLoop {
    pub fn new(detector: Box<dyn PatternDetector>, cfg: &VisionConfig) -> Self {
        Self {
            detector,
            instrument: cfg.instrument.clone(),
            interval: Duration::from_millis(cfg.interval_ms.max(1)),
            threshold: cfg.threshold.clamp(0.0, 1.0),
        }
    }

    pub async fn run(mut self, bus: EventBus<Event>, cancel: CancellationToken) {
        tracing::info!(instrument = %self.instrument, "vision loop started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let detections = tokio::select! {
                _ = cancel.cancelled() => return,
                d = self.detector.detect() => d,
            };
            let detections = match detections {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(instrument = %self.instrument, ?err, "pattern detection failed");
                    continue;
                }
            };
            for event in confident_detections(&self.instrument, detections, self.threshold) {
                tracing::debug!(
                    instrument = %event.instrument,
                    pattern = %event.pattern,
                    confidence = event.confidence,
                    "pattern detected"
                );
                if bus.publish(Event::Vision(event)).await.is_err() {
                    return;
                }
            }
        }
    }
}
