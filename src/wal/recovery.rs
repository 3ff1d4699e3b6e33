//! Crash recovery: Analysis, Redo, Undo.
//!
//! Runs during open, before the buffer pool exists, so pages move
//! through the disk manager directly. Update records carry full page
//! images, which also repairs torn pages: a page that fails its
//! checksum is simply rewritten from the log. Redo is idempotent via
//! the `page.lsn < record.lsn` test; undo emits compensation records so
//! a crash during recovery never repeats completed undo work.

use std::collections::HashMap;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageId};
use crate::wal::log_manager::LogManager;
use crate::wal::record::{
    CheckpointPayload, CompensationPayload, LogRecord, LogRecordKind, Lsn, UpdatePayload, NO_LSN,
};

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub redo_applied: u64,
    pub losers_undone: Vec<u64>,
    /// Highest page id named by any logged image; the allocator must
    /// not hand out ids at or below this.
    pub max_page_id: PageId,
}

#[derive(PartialEq)]
enum TxnOutcome {
    Active,
    Finished,
}

pub fn recover(disk: &DiskManager, wal: &LogManager) -> Result<RecoveryReport> {
    let records = wal.read_all()?;
    let mut report = RecoveryReport {
        records_scanned: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        return Ok(report);
    }

    // ---- Analysis ----
    // Seed the tables from the most recent checkpoint, then roll
    // forward over everything after it.
    let mut txn_table: HashMap<u64, (Lsn, TxnOutcome)> = HashMap::new();
    let mut dirty_pages: HashMap<PageId, Lsn> = HashMap::new();
    let mut by_lsn: HashMap<Lsn, &LogRecord> = HashMap::new();

    let mut scan_from = 0;
    for (i, rec) in records.iter().enumerate() {
        if rec.kind == LogRecordKind::Checkpoint {
            let payload = CheckpointPayload::decode(&rec.payload)?;
            txn_table = payload
                .active_txns
                .into_iter()
                .map(|(id, last)| (id, (last, TxnOutcome::Active)))
                .collect();
            dirty_pages = payload.dirty_pages.into_iter().collect();
            scan_from = i + 1;
        }
    }

    for rec in &records {
        by_lsn.insert(rec.lsn, rec);
        if let Some(pid) = record_page_id(rec)? {
            report.max_page_id = report.max_page_id.max(pid);
        }
    }

    for rec in records.iter().skip(scan_from) {
        match rec.kind {
            LogRecordKind::Begin => {
                txn_table.insert(rec.txn_id, (rec.lsn, TxnOutcome::Active));
            }
            LogRecordKind::Update | LogRecordKind::Compensation => {
                txn_table.insert(rec.txn_id, (rec.lsn, TxnOutcome::Active));
                let pid = record_page_id(rec)?.unwrap();
                dirty_pages.entry(pid).or_insert(rec.lsn);
            }
            // An abort record means the rollback fully logged its
            // compensations, so the transaction needs nothing more.
            LogRecordKind::Commit | LogRecordKind::Abort => {
                txn_table.insert(rec.txn_id, (rec.lsn, TxnOutcome::Finished));
            }
            LogRecordKind::Checkpoint => {}
        }
    }

    // ---- Redo ----
    // Repeat history from the oldest recovery LSN in the dirty page
    // table.
    let redo_start = dirty_pages.values().copied().min().unwrap_or(Lsn::MAX);
    for rec in &records {
        if rec.lsn < redo_start {
            continue;
        }
        let image = match rec.kind {
            LogRecordKind::Update => UpdatePayload::decode(&rec.payload)?.after,
            LogRecordKind::Compensation => CompensationPayload::decode(&rec.payload)?.image,
            _ => continue,
        };
        if redo_image(disk, &image, rec.lsn)? {
            report.redo_applied += 1;
        }
    }

    // ---- Undo ----
    // Roll back every transaction still active at the crash, oldest
    // first, following each prev_lsn chain backwards.
    let mut losers: Vec<(u64, Lsn)> = txn_table
        .iter()
        .filter(|(_, (_, outcome))| *outcome == TxnOutcome::Active)
        .map(|(&id, &(last, _))| (id, last))
        .collect();
    losers.sort_unstable();

    for (txn_id, last_lsn) in &losers {
        let mut chain_head = *last_lsn;
        let mut cursor = *last_lsn;
        while cursor != NO_LSN {
            let rec = match by_lsn.get(&cursor) {
                Some(rec) => *rec,
                None => {
                    // The chain runs past the reclaimed log head; only
                    // possible for transactions whose tail predates the
                    // last checkpoint horizon.
                    warn!(
                        "txn {}: undo chain lsn {} not in the log, stopping",
                        txn_id, cursor
                    );
                    break;
                }
            };
            match rec.kind {
                LogRecordKind::Update => {
                    let payload = UpdatePayload::decode(&rec.payload)?;
                    let clr = CompensationPayload {
                        page_id: payload.page_id,
                        undo_next_lsn: rec.prev_lsn,
                        image: payload.before.clone(),
                    };
                    let clr_lsn = wal.append(
                        LogRecordKind::Compensation,
                        *txn_id,
                        chain_head,
                        clr.encode(),
                    )?;
                    chain_head = clr_lsn;

                    let mut page = Page::deserialize(&payload.before, false)?;
                    page.lsn = clr_lsn;
                    disk.write_page(&page)?;
                    cursor = rec.prev_lsn;
                }
                LogRecordKind::Compensation => {
                    // Undo already performed and logged; skip to what
                    // it points at.
                    cursor = CompensationPayload::decode(&rec.payload)?.undo_next_lsn;
                }
                LogRecordKind::Begin => break,
                other => {
                    warn!(
                        "txn {}: unexpected {:?} record in undo chain",
                        txn_id, other
                    );
                    break;
                }
            }
        }
        wal.append(LogRecordKind::Abort, *txn_id, chain_head, Vec::new())?;
        report.losers_undone.push(*txn_id);
    }

    wal.flush_all()?;
    disk.sync()?;
    info!(
        "recovery complete: {} records scanned, {} pages redone, {} transactions rolled back",
        report.records_scanned,
        report.redo_applied,
        report.losers_undone.len()
    );
    Ok(report)
}

fn record_page_id(rec: &LogRecord) -> Result<Option<PageId>> {
    match rec.kind {
        LogRecordKind::Update => Ok(Some(UpdatePayload::decode(&rec.payload)?.page_id)),
        LogRecordKind::Compensation => {
            Ok(Some(CompensationPayload::decode(&rec.payload)?.page_id))
        }
        _ => Ok(None),
    }
}

/// Writes `image` if the on-disk page is older than `lsn` (or absent,
/// or torn). Returns whether a write happened.
fn redo_image(disk: &DiskManager, image: &[u8], lsn: Lsn) -> Result<bool> {
    let mut page = Page::deserialize(image, false)?;
    let apply = match disk.read_page(page.id) {
        Ok(current) => current.lsn < lsn,
        // Never flushed, or torn by the crash: the logged image wins.
        Err(Error::PageOutOfRange { .. }) | Err(Error::ChecksumMismatch { .. }) => true,
        Err(Error::Corrupted { .. }) => true,
        Err(e) => return Err(e),
    };
    if apply {
        page.lsn = lsn;
        disk.write_page(&page)?;
    }
    Ok(apply)
}
