//! SQLite write-behind journal for ledger changes.
//!
//! The engine hands every committed row to [`LedgerJournal`], which queues it for a dedicated
//! worker thread. Rows are upserted as JSON keyed by their primary id, so the latest version of a
//! referral, event or payout always wins and a restart replays nothing but the final rows.

use anyhow::Context;
use referral_ledger_execution::{LedgerChange, LedgerSink, LedgerSnapshot};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::metrics::JournalMetrics;

enum PersistRequest {
    Changes(Vec<LedgerChange>),
    Flush(oneshot::Sender<()>),
}

pub struct LedgerJournal {
    sender: mpsc::UnboundedSender<PersistRequest>,
    metrics: Arc<JournalMetrics>,
}

impl LedgerJournal {
    /// Opens (or creates) the journal at `path`, returns every stored row and starts the writer.
    pub fn load_and_start_sqlite(
        path: &Path,
        batch_size: usize,
        metrics: Arc<JournalMetrics>,
    ) -> anyhow::Result<(Self, LedgerSnapshot)> {
        let conn = Connection::open(path).context("open ledger journal db")?;
        init_schema_sqlite(&conn)?;
        let snapshot = load_snapshot_sqlite(&conn)?;
        drop(conn);

        let (sender, receiver) = mpsc::unbounded_channel();
        let path = path.to_path_buf();
        let worker_metrics = metrics.clone();
        std::thread::Builder::new()
            .name("ledger-journal".to_string())
            .spawn(move || {
                journal_worker(path, batch_size.max(1), receiver, worker_metrics);
            })
            .context("spawn ledger journal worker")?;

        Ok((Self { sender, metrics }, snapshot))
    }

    /// Resolves once every change recorded before the call has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(PersistRequest::Flush(ack)).is_err() {
            warn!("Ledger journal worker stopped; nothing to flush");
            return;
        }
        let _ = done.await;
    }
}

impl LedgerSink for LedgerJournal {
    fn record(&self, changes: &[LedgerChange]) {
        match self.sender.send(PersistRequest::Changes(changes.to_vec())) {
            Ok(()) => self.metrics.inc_queue_depth(),
            Err(_) => {
                self.metrics.inc_write_error();
                error!(
                    rows = changes.len(),
                    "Ledger journal worker stopped; changes not persisted"
                );
            }
        }
    }
}

fn init_schema_sqlite(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS settings_versions (
             version INTEGER PRIMARY KEY,
             row TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS referral_codes (
             code TEXT PRIMARY KEY,
             referrer_id TEXT NOT NULL UNIQUE,
             row TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS referrals (
             id INTEGER PRIMARY KEY,
             referrer_id TEXT NOT NULL,
             status TEXT NOT NULL,
             row TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS referrals_referrer ON referrals (referrer_id);
         CREATE TABLE IF NOT EXISTS commission_events (
             id INTEGER PRIMARY KEY,
             referral_id INTEGER NOT NULL,
             row TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS payout_requests (
             id INTEGER PRIMARY KEY,
             referrer_id TEXT NOT NULL,
             status TEXT NOT NULL,
             row TEXT NOT NULL
         );",
    )
    .context("init ledger journal schema")?;
    Ok(())
}

fn load_rows<T: DeserializeOwned>(conn: &Connection, query: &str) -> anyhow::Result<Vec<T>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        let json = row?;
        out.push(serde_json::from_str(&json).with_context(|| format!("decode row for {query}"))?);
    }
    Ok(out)
}

fn load_snapshot_sqlite(conn: &Connection) -> anyhow::Result<LedgerSnapshot> {
    let snapshot = LedgerSnapshot {
        settings: load_rows(conn, "SELECT row FROM settings_versions ORDER BY version ASC")?,
        codes: load_rows(conn, "SELECT row FROM referral_codes ORDER BY code ASC")?,
        referrals: load_rows(conn, "SELECT row FROM referrals ORDER BY id ASC")?,
        events: load_rows(conn, "SELECT row FROM commission_events ORDER BY id ASC")?,
        payouts: load_rows(conn, "SELECT row FROM payout_requests ORDER BY id ASC")?,
    };
    info!(
        settings = snapshot.settings.len(),
        codes = snapshot.codes.len(),
        referrals = snapshot.referrals.len(),
        events = snapshot.events.len(),
        payouts = snapshot.payouts.len(),
        "Loaded ledger journal"
    );
    Ok(snapshot)
}

fn write_rows_sqlite(conn: &mut Connection, changes: &[LedgerChange]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    for change in changes {
        match change {
            LedgerChange::Settings(version) => {
                tx.execute(
                    "INSERT OR REPLACE INTO settings_versions (version, row) VALUES (?, ?)",
                    params![version.version, serde_json::to_string(version)?],
                )?;
            }
            LedgerChange::Code(record) => {
                tx.execute(
                    "INSERT OR REPLACE INTO referral_codes (code, referrer_id, row) VALUES (?, ?, ?)",
                    params![record.code, record.referrer_id, serde_json::to_string(record)?],
                )?;
            }
            LedgerChange::Referral(referral) => {
                tx.execute(
                    "INSERT OR REPLACE INTO referrals (id, referrer_id, status, row) VALUES (?, ?, ?, ?)",
                    params![
                        referral.id,
                        referral.referrer_id,
                        referral.status.as_str(),
                        serde_json::to_string(referral)?
                    ],
                )?;
            }
            LedgerChange::Event(event) => {
                tx.execute(
                    "INSERT OR REPLACE INTO commission_events (id, referral_id, row) VALUES (?, ?, ?)",
                    params![event.id, event.referral_id, serde_json::to_string(event)?],
                )?;
            }
            LedgerChange::Payout(payout) => {
                tx.execute(
                    "INSERT OR REPLACE INTO payout_requests (id, referrer_id, status, row) VALUES (?, ?, ?, ?)",
                    params![
                        payout.id,
                        payout.referrer_id,
                        payout.status.as_str(),
                        serde_json::to_string(payout)?
                    ],
                )?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn journal_worker(
    path: PathBuf,
    batch_size: usize,
    mut receiver: mpsc::UnboundedReceiver<PersistRequest>,
    metrics: Arc<JournalMetrics>,
) {
    let mut conn = match Connection::open(&path) {
        Ok(conn) => conn,
        Err(err) => {
            error!("Ledger journal open failed: {err}");
            return;
        }
    };
    if let Err(err) = init_schema_sqlite(&conn) {
        error!("Ledger journal init failed: {err}");
        return;
    }

    while let Some(request) = receiver.blocking_recv() {
        let mut rows = Vec::new();
        let mut acks = Vec::new();
        let mut next = Some(request);
        while let Some(request) = next.take() {
            match request {
                PersistRequest::Changes(changes) => {
                    metrics.dec_queue_depth();
                    rows.extend(changes);
                }
                PersistRequest::Flush(ack) => acks.push(ack),
            }
            if rows.len() >= batch_size {
                break;
            }
            next = receiver.try_recv().ok();
        }

        if !rows.is_empty() {
            match write_rows_sqlite(&mut conn, &rows) {
                Ok(()) => metrics.add_rows_written(rows.len()),
                Err(err) => {
                    metrics.inc_write_error();
                    error!(rows = rows.len(), "Ledger journal write failed: {err:#}");
                }
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}
