//! Tamper-evident, hash-chained, append-only JSONL ledger.
//!
//! One receipt per line. A single writer (this handle, guarded by an
//! exclusive advisory file lock) owns the chain tail; readers stream the
//! file up to the last fully committed byte and never see a partial line.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, Read as _, Take, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::error::{FishoilError, Result, ResultExt as _};
use crate::fraud::RuleKind;
use crate::hash;
use crate::receipt::Receipt;
use crate::util;
use crate::verify::ChainVerifier;

// ---------------------------------------------------------------------------
// Halt state
// ---------------------------------------------------------------------------

/// Why the ledger stopped accepting appends. Persisted next to the ledger
/// in `<ledger>.halt` until explicitly cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReason {
    pub kind: RuleKind,
    pub detail: String,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

impl HaltReason {
    pub fn new(kind: RuleKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            raised_at: util::now_utc(),
        }
    }

    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::new(RuleKind::Integrity, detail)
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, util::format_rfc3339(self.raised_at), self.detail)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct WriterState {
    file: File,
    tail: Option<Receipt>,
    last_seq: u64,
    last_ts: Option<OffsetDateTime>,
    halt: Option<HaltReason>,
    committed_len: u64,
}

pub struct Ledger {
    path: PathBuf,
    halt_path: PathBuf,
    state: Mutex<WriterState>,
    /// Byte length of the fully written prefix; readers stop here.
    committed: AtomicU64,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("len", &st.last_seq)
            .field("halted", &st.halt.is_some())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open (or create) the ledger at `path` for writing.
    ///
    /// Takes an exclusive lock, discards an unterminated trailing fragment
    /// left by an interrupted write, verifies the whole chain, and restores
    /// any persisted halt. A broken chain opens the ledger halted.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .ctx_ledger(&format!("create ledger dir {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .ctx_ledger(&format!("open ledger {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|e| FishoilError::LedgerLocked(format!("{}: {e}", path.display())))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .ctx_ledger(&format!("read ledger {}", path.display()))?;

        let committed_len = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if committed_len < bytes.len() {
            warn!(
                path = %path.display(),
                discarded_bytes = bytes.len() - committed_len,
                "discarding torn trailing write"
            );
            file.set_len(committed_len as u64).ctx_ledger("truncate torn tail")?;
            file.sync_data().ctx_ledger("sync after torn-tail recovery")?;
        }

        // Unreadable lines stay in place as `None` so positions are kept.
        let entries: Vec<Option<Receipt>> = match bytes[..committed_len].split_last() {
            Some((_newline, body)) => body
                .split(|b| *b == b'\n')
                .map(|line| {
                    std::str::from_utf8(line)
                        .ok()
                        .and_then(|s| Receipt::from_json_line(s).ok())
                })
                .collect(),
            None => Vec::new(),
        };
        let line_count = entries.len();
        let report = ChainVerifier::verify_entries(entries.iter().map(Option::as_ref), None);

        let halt_path = halt_sidecar(path);
        let mut halt = read_halt(&halt_path)?;
        if !report.chain_ok() && halt.is_none() {
            let reason = HaltReason::integrity(format!(
                "chain verification failed at sequence {} on open",
                report.first_violation_sequence.unwrap_or_default()
            ));
            error!(path = %path.display(), reason = %reason, "ledger opened halted");
            write_halt(&halt_path, &reason)?;
            halt = Some(reason);
        }

        let tail = entries.iter().rev().find_map(Clone::clone);
        let last_ts = tail.as_ref().map(|r| r.timestamp);
        info!(
            path = %path.display(),
            receipts = line_count,
            halted = halt.is_some(),
            "ledger opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            halt_path,
            state: Mutex::new(WriterState {
                file,
                tail,
                last_seq: line_count as u64,
                last_ts,
                halt,
                committed_len: committed_len as u64,
            }),
            committed: AtomicU64::new(committed_len as u64),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one receipt and return its assigned sequence number.
    ///
    /// The receipt must chain onto the current tail and carry a correct
    /// `payload_hash`. Sequence number and (clamped) timestamp are assigned
    /// here. The line is written with a single `write_all` and synced
    /// before it becomes visible to readers; a failed write is rolled back.
    pub fn append(&self, mut receipt: Receipt) -> Result<u64> {
        let mut st = self.state.lock();

        if let Some(reason) = &st.halt {
            return Err(FishoilError::LedgerHalted(reason.clone()));
        }

        let expected = st
            .tail
            .as_ref()
            .map_or_else(|| hash::genesis_hash().to_string(), |r| r.payload_hash.clone());
        if receipt.previous_hash != expected {
            return Err(FishoilError::ChainLinkMismatch {
                expected,
                found: receipt.previous_hash,
            });
        }
        if !receipt.is_self_consistent() {
            return Err(FishoilError::InvalidReceipt(format!(
                "payload_hash does not match content for lot {}",
                receipt.lot_id
            )));
        }

        let seq = st.last_seq + 1;
        receipt.sequence_number = seq;
        if let Some(last) = st.last_ts {
            if receipt.timestamp < last {
                receipt.timestamp = last;
            }
        }

        let line = receipt.to_json_line()?;
        let committed = st.committed_len;
        let written = match st.file.write_all(line.as_bytes()) {
            Ok(()) => st.file.sync_data(),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!(seq, error = %e, "append failed, rolling back");
            st.file
                .set_len(committed)
                .ctx_ledger("roll back partial append")?;
            return Err(FishoilError::Ledger(format!("write receipt {seq}: {e}")));
        }

        st.committed_len = committed + line.len() as u64;
        self.committed.store(st.committed_len, Ordering::Release);
        debug!(seq, stage = %receipt.stage, lot = %receipt.lot_id, "receipt appended");
        st.last_seq = seq;
        st.last_ts = Some(receipt.timestamp);
        st.tail = Some(receipt);
        Ok(seq)
    }

    /// The authoritative chain head (genesis sentinel when empty).
    pub fn tail_hash(&self) -> String {
        self.state
            .lock()
            .tail
            .as_ref()
            .map_or_else(|| hash::genesis_hash().to_string(), |r| r.payload_hash.clone())
    }

    pub fn tail_receipt(&self) -> Option<Receipt> {
        self.state.lock().tail.clone()
    }

    /// Number of committed receipts.
    pub fn len(&self) -> u64 {
        self.state.lock().last_seq
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the committed prefix in sequence order. Each call starts a
    /// fresh pass over the file.
    pub fn read_all(&self) -> Result<ReceiptIter> {
        let limit = self.committed.load(Ordering::Acquire);
        let file = File::open(&self.path)
            .ctx_ledger(&format!("open ledger for read {}", self.path.display()))?;
        Ok(ReceiptIter {
            reader: BufReader::new(file.take(limit)),
            line_no: 0,
            buf: String::new(),
            done: false,
        })
    }

    /// Every committed receipt, in order.
    pub fn snapshot(&self) -> Result<Vec<Receipt>> {
        self.read_all()?.collect()
    }

    /// Stop all further appends. The first halt wins; later reasons are
    /// logged and dropped.
    pub fn halt(&self, reason: HaltReason) -> Result<()> {
        let mut st = self.state.lock();
        if let Some(existing) = &st.halt {
            warn!(existing = %existing, ignored = %reason, "ledger already halted");
            return Ok(());
        }
        write_halt(&self.halt_path, &reason)?;
        error!(path = %self.path.display(), reason = %reason, "ledger halted");
        st.halt = Some(reason);
        Ok(())
    }

    /// Manual intervention: lift a halt and allow appends again.
    pub fn clear_halt(&self) -> Result<Option<HaltReason>> {
        let mut st = self.state.lock();
        if self.halt_path.exists() {
            std::fs::remove_file(&self.halt_path)
                .ctx_ledger(&format!("remove {}", self.halt_path.display()))?;
        }
        let cleared = st.halt.take();
        if let Some(reason) = &cleared {
            warn!(path = %self.path.display(), reason = %reason, "ledger halt cleared");
        }
        Ok(cleared)
    }

    pub fn halt_status(&self) -> Option<HaltReason> {
        self.state.lock().halt.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halt.is_some()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Lazy, finite iterator over committed receipts.
pub struct ReceiptIter {
    reader: BufReader<Take<File>>,
    line_no: u64,
    buf: String,
    done: bool,
}

impl Iterator for ReceiptIter {
    type Item = Result<Receipt>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.buf.clear();
        match self.reader.read_line(&mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.line_no += 1;
                let line = self.buf.trim_end_matches(['\n', '\r']);
                Some(serde_json::from_str(line).map_err(|e| {
                    FishoilError::InvalidReceipt(format!("line {}: {e}", self.line_no))
                }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(FishoilError::Ledger(format!(
                    "read line {}: {e}",
                    self.line_no + 1
                ))))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Halt sidecar
// ---------------------------------------------------------------------------

fn halt_sidecar(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".halt");
    PathBuf::from(s)
}

fn read_halt(path: &Path) -> Result<Option<HaltReason>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).ctx_ledger(&format!("read {}", path.display()))?;
    let reason = serde_json::from_str(&text).ctx_ledger(&format!("parse {}", path.display()))?;
    Ok(Some(reason))
}

fn write_halt(path: &Path, reason: &HaltReason) -> Result<()> {
    let json = serde_json::to_vec_pretty(reason).ctx_encoding("serialize halt reason")?;
    let tmp = path.with_extension("halt.tmp");
    std::fs::write(&tmp, json).ctx_ledger(&format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).ctx_ledger(&format!("rename to {}", path.display()))?;
    Ok(())
}
