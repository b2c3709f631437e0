//! Durable decision journal.
//!
//! The journal records transaction decisions so recovery can complete
//! in-flight two-phase commits after a crash. It writes to two fragments of
//! equal capacity: appends always go to the active fragment, and when a
//! record would overflow it, every dangling record is copied forward to the
//! other fragment before the journal flips over. The active fragment thus
//! always contains every record needed to finish every unfinished
//! transaction, and the inactive one can be reset freely.

mod record;

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tandem_core::{Result, TransactionError, Uid};

use crate::config::Configuration;
use crate::status::TxStatus;

use record::{
    decode_file_header, encode_file_header, read_record, JournalRecord, ReadOutcome, BLOCK_SIZE,
    FILE_HEADER_LENGTH, PAD_MAGIC,
};

/// A non-terminal journal entry recovery must finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingRecord {
    status: TxStatus,
    unique_names: BTreeSet<String>,
    timestamp_ms: i64,
}

impl DanglingRecord {
    /// The decision status, COMMITTING or ROLLING_BACK.
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Unique names of the resources participating in the decision.
    pub fn unique_names(&self) -> &BTreeSet<String> {
        &self.unique_names
    }

    /// When the decision record was first written.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

struct LogFile {
    path: PathBuf,
    file: File,
    position: u64,
    header_timestamp: i64,
}

struct JournalState {
    files: [LogFile; 2],
    active: usize,
}

#[derive(Default)]
struct SyncState {
    written: u64,
    synced: u64,
    syncing: bool,
}

/// Dual-file, force-written, rotating decision log.
pub struct DiskJournal {
    part1: PathBuf,
    part2: PathBuf,
    capacity: u64,
    forced_write: bool,
    force_batching: bool,
    skip_corrupted: bool,
    filter_log_status: bool,
    state: Mutex<Option<JournalState>>,
    sync_state: Mutex<SyncState>,
    sync_cond: Condvar,
    sequence: AtomicU32,
}

impl DiskJournal {
    /// Creates a closed journal configured from `config`; call
    /// [`DiskJournal::open`] before logging.
    pub fn new(config: &Configuration) -> Self {
        Self {
            part1: PathBuf::from(config.log_part1_filename()),
            part2: PathBuf::from(config.log_part2_filename()),
            capacity: config.max_log_size_mb() * 1024 * 1024,
            forced_write: config.forced_write_enabled(),
            force_batching: config.force_batching_enabled(),
            skip_corrupted: config.skip_corrupted_logs(),
            filter_log_status: config.filter_log_status(),
            state: Mutex::new(None),
            sync_state: Mutex::new(SyncState::default()),
            sync_cond: Condvar::new(),
            sequence: AtomicU32::new(0),
        }
    }

    /// Opens both fragments, verifies their contents and selects the active
    /// one (the fragment with the most recent header).
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock().expect("journal state poisoned");
        if state.is_some() {
            return Err(TransactionError::Protocol(
                "journal is already open".to_string(),
            ));
        }

        let part1 = self.open_fragment(&self.part1)?;
        let part2 = self.open_fragment(&self.part2)?;
        let active = usize::from(part2.header_timestamp > part1.header_timestamp);

        tracing::info!(
            active = %[&part1, &part2][active].path.display(),
            position = [&part1, &part2][active].position,
            "journal opened"
        );
        *state = Some(JournalState {
            files: [part1, part2],
            active,
        });
        Ok(())
    }

    /// Returns `true` between a successful `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.state.lock().expect("journal state poisoned").is_some()
    }

    /// Appends a record. When forced writes are enabled the call does not
    /// return before its record is on stable storage; concurrent calls may
    /// share a single fsync when batching is enabled.
    pub fn log(
        &self,
        status: TxStatus,
        gtrid: &Uid,
        unique_names: &BTreeSet<String>,
    ) -> Result<()> {
        let is_decision = matches!(
            status,
            TxStatus::Committing | TxStatus::Committed | TxStatus::RollingBack | TxStatus::Rolledback
        );
        if self.filter_log_status && !is_decision {
            tracing::debug!(%status, %gtrid, "filtered out journal write");
            return Ok(());
        }

        let record = JournalRecord {
            status,
            gtrid: gtrid.clone(),
            unique_names: unique_names.clone(),
            timestamp_ms: now_millis(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let encoded = record.encode()?;

        let (mark, handle) = {
            let mut guard = self.state.lock().expect("journal state poisoned");
            let state = guard
                .as_mut()
                .ok_or_else(|| TransactionError::Protocol("journal is not open".to_string()))?;

            if !self.fits(&state.files[state.active], encoded.len() as u64) {
                self.rotate(state)?;
                if !self.fits(&state.files[state.active], encoded.len() as u64) {
                    return Err(TransactionError::System(
                        "journal fragments are too small for the current set of in-flight transactions".to_string(),
                    ));
                }
            }

            let active = &mut state.files[state.active];
            append_record(active, &encoded)?;

            let mut sync = self.sync_state.lock().expect("journal sync state poisoned");
            sync.written += 1;
            (sync.written, active.file.try_clone()?)
        };

        tracing::debug!(%status, %gtrid, names = unique_names.len(), "journal record written");

        if self.forced_write {
            if self.force_batching {
                self.batched_sync(mark, &handle)?;
            } else {
                handle.sync_data()?;
                let mut sync = self.sync_state.lock().expect("journal sync state poisoned");
                sync.synced = sync.synced.max(mark);
            }
        }
        Ok(())
    }

    /// Scans the active fragment and returns, per gtrid, the most recent
    /// record when its status is COMMITTING or ROLLING_BACK. Gtrids whose
    /// latest record is terminal are absent.
    pub fn collect_dangling_records(&self) -> Result<HashMap<Uid, DanglingRecord>> {
        let mut guard = self.state.lock().expect("journal state poisoned");
        let state = guard
            .as_mut()
            .ok_or_else(|| TransactionError::Protocol("journal is not open".to_string()))?;

        let active = &state.files[state.active];
        let records = self.scan_records(&active.path)?.1;
        Ok(dangling_from(records))
    }

    /// Flushes and closes both fragments.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().expect("journal state poisoned");
        if let Some(state) = guard.take() {
            for log_file in state.files.iter() {
                log_file.file.sync_data()?;
            }
            tracing::info!("journal closed");
        }
        Ok(())
    }

    /// Closes the journal, logging instead of surfacing errors.
    pub fn shutdown(&self) {
        if let Err(error) = self.close() {
            tracing::warn!(%error, "error closing journal during shutdown");
        }
    }

    fn fits(&self, log_file: &LogFile, record_len: u64) -> bool {
        let block_remaining = BLOCK_SIZE - (log_file.position % BLOCK_SIZE);
        let position = if record_len > block_remaining {
            log_file.position + block_remaining
        } else {
            log_file.position
        };
        position + record_len <= self.capacity
    }

    /// Copies every dangling record to the passive fragment, then flips the
    /// active side.
    fn rotate(&self, state: &mut JournalState) -> Result<()> {
        let active_path = state.files[state.active].path.clone();
        let active_header = state.files[state.active].header_timestamp;
        let dangling = dangling_from(self.scan_records(&active_path)?.1);

        let passive_index = 1 - state.active;
        let header_timestamp = now_millis().max(active_header + 1);
        {
            let passive = &mut state.files[passive_index];
            reset_fragment(passive, self.capacity, header_timestamp)?;

            for (gtrid, entry) in dangling.iter() {
                let record = JournalRecord {
                    status: entry.status,
                    gtrid: gtrid.clone(),
                    unique_names: entry.unique_names.clone(),
                    timestamp_ms: entry.timestamp_ms,
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                };
                let encoded = record.encode()?;
                let block_remaining = BLOCK_SIZE - (passive.position % BLOCK_SIZE);
                if (encoded.len() as u64) > block_remaining {
                    write_pad(passive, block_remaining)?;
                }
                if passive.position + encoded.len() as u64 > self.capacity {
                    return Err(TransactionError::System(
                        "dangling records overflow the journal fragment capacity".to_string(),
                    ));
                }
                append_record(passive, &encoded)?;
            }
            passive.file.sync_data()?;
        }

        state.active = passive_index;
        tracing::info!(
            active = %state.files[state.active].path.display(),
            carried = dangling.len(),
            "journal rotated"
        );

        // the rotation fsync covered every record that still matters
        let mut sync = self.sync_state.lock().expect("journal sync state poisoned");
        sync.synced = sync.written;
        self.sync_cond.notify_all();
        Ok(())
    }

    /// Group commit: one caller syncs on behalf of everyone that wrote
    /// before the fsync started; the others wait for coverage.
    fn batched_sync(&self, mark: u64, handle: &File) -> Result<()> {
        let mut sync = self.sync_state.lock().expect("journal sync state poisoned");
        loop {
            if sync.synced >= mark {
                return Ok(());
            }
            if !sync.syncing {
                sync.syncing = true;
                let covered = sync.written;
                drop(sync);

                let outcome = handle.sync_data();

                sync = self.sync_state.lock().expect("journal sync state poisoned");
                sync.syncing = false;
                if outcome.is_ok() {
                    sync.synced = sync.synced.max(covered);
                }
                self.sync_cond.notify_all();
                outcome?;
            } else {
                sync = self
                    .sync_cond
                    .wait(sync)
                    .expect("journal sync state poisoned");
            }
        }
    }

    fn open_fragment(&self, path: &Path) -> Result<LogFile> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let length = file.metadata()?.len();
        if length < u64::from(FILE_HEADER_LENGTH) {
            let header_timestamp = now_millis();
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encode_file_header(header_timestamp))?;
            file.set_len(self.capacity)?;
            file.sync_data()?;
            return Ok(LogFile {
                path: path.to_path_buf(),
                file,
                position: u64::from(FILE_HEADER_LENGTH),
                header_timestamp,
            });
        }

        if length < self.capacity {
            file.set_len(self.capacity)?;
        }

        let (position, _) = self.scan_records(path)?;
        let mut header = [0u8; FILE_HEADER_LENGTH as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let header_timestamp = decode_file_header(&header)?;

        Ok(LogFile {
            path: path.to_path_buf(),
            file,
            position,
            header_timestamp,
        })
    }

    /// Walks a fragment, returning the append position (first byte past the
    /// last valid record) and every valid record in write order.
    fn scan_records(&self, path: &Path) -> Result<(u64, Vec<JournalRecord>)> {
        let buf = std::fs::read(path)?;
        decode_file_header(&buf)?;

        let mut records = Vec::new();
        let mut position = u64::from(FILE_HEADER_LENGTH);
        let limit = (buf.len() as u64).min(self.capacity);

        while position < limit {
            let block_end = (position - position % BLOCK_SIZE + BLOCK_SIZE).min(limit);
            let window = &buf[position as usize..block_end as usize];
            match read_record(window) {
                ReadOutcome::Record(record, consumed) => {
                    records.push(record);
                    position += consumed as u64;
                }
                ReadOutcome::Pad => position = block_end,
                ReadOutcome::EndOfLog => break,
                ReadOutcome::Corrupted(message) => {
                    if self.skip_corrupted {
                        tracing::warn!(
                            path = %path.display(),
                            position,
                            %message,
                            "skipping corrupted journal record, truncating log here"
                        );
                        break;
                    }
                    return Err(TransactionError::System(format!(
                        "corrupted journal record in {} at offset {position}: {message}",
                        path.display()
                    )));
                }
            }
        }
        Ok((position, records))
    }
}

impl Drop for DiskJournal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn append_record(log_file: &mut LogFile, encoded: &[u8]) -> Result<()> {
    let block_remaining = BLOCK_SIZE - (log_file.position % BLOCK_SIZE);
    if (encoded.len() as u64) > block_remaining {
        write_pad(log_file, block_remaining)?;
    }
    log_file.file.seek(SeekFrom::Start(log_file.position))?;
    log_file.file.write_all(encoded)?;
    log_file.position += encoded.len() as u64;
    Ok(())
}

fn write_pad(log_file: &mut LogFile, block_remaining: u64) -> Result<()> {
    let mut pad = vec![0u8; block_remaining as usize];
    pad[0] = PAD_MAGIC;
    log_file.file.seek(SeekFrom::Start(log_file.position))?;
    log_file.file.write_all(&pad)?;
    log_file.position += block_remaining;
    Ok(())
}

fn reset_fragment(log_file: &mut LogFile, capacity: u64, header_timestamp: i64) -> Result<()> {
    log_file.file.set_len(0)?;
    log_file.file.seek(SeekFrom::Start(0))?;
    log_file.file.write_all(&encode_file_header(header_timestamp))?;
    log_file.file.set_len(capacity)?;
    log_file.position = u64::from(FILE_HEADER_LENGTH);
    log_file.header_timestamp = header_timestamp;
    Ok(())
}

fn dangling_from(records: Vec<JournalRecord>) -> HashMap<Uid, DanglingRecord> {
    let mut latest: HashMap<Uid, JournalRecord> = HashMap::new();
    for record in records {
        latest.insert(record.gtrid.clone(), record);
    }
    latest
        .into_iter()
        .filter(|(_, record)| record.status.is_dangling())
        .map(|(gtrid, record)| {
            (
                gtrid,
                DanglingRecord {
                    status: record.status,
                    unique_names: record.unique_names,
                    timestamp_ms: record.timestamp_ms,
                },
            )
        })
        .collect()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::UidGenerator;
    use tempfile::TempDir;

    fn journal_in(dir: &TempDir, max_mb: u64) -> DiskJournal {
        let config = Configuration::builder()
            .journal_files(
                dir.path().join("part1.tlog").display().to_string(),
                dir.path().join("part2.tlog").display().to_string(),
            )
            .max_log_size_mb(max_mb)
            .build()
            .unwrap();
        DiskJournal::new(&config)
    }

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_log_before_open_fails() {
        let dir = TempDir::new().unwrap();
        let journal = journal_in(&dir, 1);
        let generator = UidGenerator::new("j");
        let err = journal
            .log(TxStatus::Committing, &generator.generate_uid(), &names(&["r"]))
            .unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[test]
    fn test_dangling_round_trip() {
        let dir = TempDir::new().unwrap();
        let journal = journal_in(&dir, 1);
        journal.open().unwrap();

        let generator = UidGenerator::new("j");
        let committed = generator.generate_uid();
        let committing = generator.generate_uid();
        let rolling_back = generator.generate_uid();

        journal
            .log(TxStatus::Committing, &committed, &names(&["a", "b"]))
            .unwrap();
        journal
            .log(TxStatus::Committed, &committed, &names(&["a", "b"]))
            .unwrap();
        journal
            .log(TxStatus::Committing, &committing, &names(&["a"]))
            .unwrap();
        journal
            .log(TxStatus::RollingBack, &rolling_back, &names(&["b"]))
            .unwrap();

        let dangling = journal.collect_dangling_records().unwrap();
        assert_eq!(dangling.len(), 2);
        assert_eq!(dangling[&committing].status(), TxStatus::Committing);
        assert_eq!(dangling[&committing].unique_names(), &names(&["a"]));
        assert_eq!(dangling[&rolling_back].status(), TxStatus::RollingBack);
        assert!(!dangling.contains_key(&committed));
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        let generator = UidGenerator::new("j");
        let gtrid = generator.generate_uid();

        {
            let journal = journal_in(&dir, 1);
            journal.open().unwrap();
            journal
                .log(TxStatus::Committing, &gtrid, &names(&["r1"]))
                .unwrap();
            journal.close().unwrap();
        }

        let journal = journal_in(&dir, 1);
        journal.open().unwrap();
        let dangling = journal.collect_dangling_records().unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[&gtrid].unique_names(), &names(&["r1"]));
    }

    #[test]
    fn test_rotation_carries_dangling_records() {
        let dir = TempDir::new().unwrap();
        let config = Configuration::builder()
            .journal_files(
                dir.path().join("part1.tlog").display().to_string(),
                dir.path().join("part2.tlog").display().to_string(),
            )
            .max_log_size_mb(1)
            .forced_write_enabled(false)
            .build()
            .unwrap();
        let journal = DiskJournal::new(&config);
        journal.open().unwrap();

        let generator = UidGenerator::new("j");
        let dangling_gtrids: Vec<Uid> =
            (0..10).map(|_| generator.generate_uid()).collect();
        for gtrid in dangling_gtrids.iter() {
            journal
                .log(TxStatus::Committing, gtrid, &names(&["keep"]))
                .unwrap();
        }

        // fill both fragments several times over with completed transactions
        for _ in 0..12_000 {
            let gtrid = generator.generate_uid();
            journal
                .log(TxStatus::Committing, &gtrid, &names(&["churn"]))
                .unwrap();
            journal
                .log(TxStatus::Committed, &gtrid, &names(&["churn"]))
                .unwrap();
        }

        let dangling = journal.collect_dangling_records().unwrap();
        for gtrid in dangling_gtrids.iter() {
            assert_eq!(dangling[gtrid].status(), TxStatus::Committing);
            assert_eq!(dangling[gtrid].unique_names(), &names(&["keep"]));
        }
    }

    #[test]
    fn test_corrupted_tail_is_fatal_by_default() {
        let dir = TempDir::new().unwrap();
        let generator = UidGenerator::new("j");

        {
            let journal = journal_in(&dir, 1);
            journal.open().unwrap();
            journal
                .log(TxStatus::Committing, &generator.generate_uid(), &names(&["r"]))
                .unwrap();
            journal.close().unwrap();
        }

        // clobber a byte inside the first record
        let path = dir.path().join("part1.tlog");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[30] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let journal = journal_in(&dir, 1);
        assert!(journal.open().is_err());
    }

    #[test]
    fn test_corrupted_tail_skipped_when_configured() {
        let dir = TempDir::new().unwrap();
        let generator = UidGenerator::new("j");
        let first = generator.generate_uid();

        {
            let journal = journal_in(&dir, 1);
            journal.open().unwrap();
            journal
                .log(TxStatus::Committing, &first, &names(&["r"]))
                .unwrap();
            journal.close().unwrap();
        }

        let path = dir.path().join("part1.tlog");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[30] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let config = Configuration::builder()
            .journal_files(
                dir.path().join("part1.tlog").display().to_string(),
                dir.path().join("part2.tlog").display().to_string(),
            )
            .max_log_size_mb(1)
            .skip_corrupted_logs(true)
            .build()
            .unwrap();
        let journal = DiskJournal::new(&config);
        journal.open().unwrap();

        // the damaged record is gone, the journal accepts fresh writes
        assert!(journal.collect_dangling_records().unwrap().is_empty());
        journal
            .log(TxStatus::Committing, &generator.generate_uid(), &names(&["r"]))
            .unwrap();
    }

    #[test]
    fn test_unforced_writes_skip_fsync() {
        let dir = TempDir::new().unwrap();
        let config = Configuration::builder()
            .journal_files(
                dir.path().join("part1.tlog").display().to_string(),
                dir.path().join("part2.tlog").display().to_string(),
            )
            .max_log_size_mb(1)
            .forced_write_enabled(false)
            .build()
            .unwrap();
        let journal = DiskJournal::new(&config);
        journal.open().unwrap();

        let generator = UidGenerator::new("j");
        for _ in 0..100 {
            journal
                .log(TxStatus::Committing, &generator.generate_uid(), &names(&["r"]))
                .unwrap();
        }
    }

    #[test]
    fn test_filter_log_status_drops_non_decision_records() {
        let dir = TempDir::new().unwrap();
        let config = Configuration::builder()
            .journal_files(
                dir.path().join("part1.tlog").display().to_string(),
                dir.path().join("part2.tlog").display().to_string(),
            )
            .max_log_size_mb(1)
            .filter_log_status(true)
            .build()
            .unwrap();
        let journal = DiskJournal::new(&config);
        journal.open().unwrap();

        let generator = UidGenerator::new("j");
        let gtrid = generator.generate_uid();
        journal.log(TxStatus::Active, &gtrid, &names(&[])).unwrap();
        journal
            .log(TxStatus::Preparing, &gtrid, &names(&["r"]))
            .unwrap();

        assert!(journal.collect_dangling_records().unwrap().is_empty());

        journal
            .log(TxStatus::Committing, &gtrid, &names(&["r"]))
            .unwrap();
        assert_eq!(journal.collect_dangling_records().unwrap().len(), 1);
    }
}
