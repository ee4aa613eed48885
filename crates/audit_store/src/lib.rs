//! Append-only SQLite audit trail of fills and signals. Writes happen on a
//! dedicated thread so the dispatcher never blocks on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use core_types::{FillEvent, SignalEvent};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

#[derive(Debug)]
enum AuditMsg {
    Trade(FillEvent),
    Signal(SignalEvent),
    Barrier(mpsc::Sender<()>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TradeRecord {
    pub id: i64,
    pub timestamp: String,
    pub ticker: String,
    pub action: String,
    pub quantity: f64,
    pub price: f64,
    pub order_id: Option<String>,
}

#[derive(Clone, Default)]
pub struct AuditStore {
    tx: Option<mpsc::Sender<AuditMsg>>,
    path: Option<PathBuf>,
}

impl AuditStore {
    pub fn spawn(path: PathBuf, enabled: bool) -> Self {
        if !enabled {
            return Self::default();
        }
        let (tx, rx) = mpsc::channel::<AuditMsg>();
        let writer_path = path.clone();
        thread::spawn(move || {
            if let Err(err) = run_writer(writer_path, rx) {
                tracing::warn!(error = %err, "audit writer exited");
            }
        });
        Self {
            tx: Some(tx),
            path: Some(path),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn record_trade(&self, fill: &FillEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(AuditMsg::Trade(fill.clone()));
        }
    }

    pub fn record_signal(&self, signal: &SignalEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(AuditMsg::Signal(signal.clone()));
        }
    }

    /// Wait until everything queued so far has been written.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(AuditMsg::Barrier(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        match &self.path {
            Some(path) => read_recent_trades(path, limit),
            None => Ok(Vec::new()),
        }
    }
}

fn run_writer(path: PathBuf, rx: mpsc::Receiver<AuditMsg>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(&path)?;
    init_schema(&conn)?;
    tracing::info!(path = %path.display(), "audit store ready");

    while let Ok(msg) = rx.recv() {
        let written = match msg {
            AuditMsg::Trade(fill) => insert_trade(&conn, &fill),
            AuditMsg::Signal(signal) => insert_signal(&conn, &signal),
            AuditMsg::Barrier(ack) => {
                let _ = ack.send(());
                Ok(())
            }
        };
        if let Err(err) = written {
            tracing::warn!(error = %err, "audit write failed");
        }
    }
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            ticker TEXT NOT NULL,
            action TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL NOT NULL,
            order_id TEXT UNIQUE
        );

        CREATE TABLE IF NOT EXISTS signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            ticker TEXT NOT NULL,
            signal TEXT NOT NULL,
            confidence REAL,
            reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_signals_ticker ON signals(ticker);
        "#,
    )?;
    Ok(())
}

fn insert_trade(conn: &Connection, fill: &FillEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO trades (timestamp, ticker, action, quantity, price, order_id) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            fill.observed_at.to_rfc3339(),
            fill.instrument,
            fill.action.to_string(),
            fill.quantity,
            fill.price,
            fill.order_id,
        ],
    )?;
    Ok(())
}

fn insert_signal(conn: &Connection, signal: &SignalEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO signals (timestamp, ticker, signal, confidence, reason) VALUES (?, ?, ?, ?, ?)",
        params![
            signal.observed_at.to_rfc3339(),
            signal.instrument,
            signal.action.to_string(),
            signal.confidence,
            signal.reason,
        ],
    )?;
    Ok(())
}

/// Most recent trades first.
pub fn read_recent_trades(path: &Path, limit: usize) -> Result<Vec<TradeRecord>> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, ticker, action, quantity, price, order_id \
         FROM trades ORDER BY id DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(TradeRecord {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            ticker: row.get(2)?,
            action: row.get(3)?,
            quantity: row.get(4)?,
            price: row.get(5)?,
            order_id: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn signal_count(path: &Path) -> Result<i64> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    Ok(conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?)
}
