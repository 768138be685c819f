//! Append-only receipt store.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use famos_types::PolicyVersion;

use crate::ActionError;

/// Terminal status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    /// Effect happened, outputs captured.
    Ok,
    /// Failed; `reason` says why.
    Error,
    /// Skipped (cached receipt satisfied the call).
    Skipped,
    /// Blocked by safety class; held for review.
    Quarantined,
}

/// Immutable record of a tool execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Receipt id.
    pub receipt_id: Uuid,
    /// Executed tool.
    pub tool_id: String,
    /// Outcome.
    pub status: ReceiptStatus,
    /// Start instant.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Normalized cost estimate in `[0, 1]`.
    pub cost: f64,
    /// Hash of the input params (raw params are never stored).
    pub inputs_hash: String,
    /// Tool output for successful runs (hashed upstream when sensitive).
    pub outputs: Option<serde_json::Value>,
    /// Policy snapshot the gate evaluated under.
    pub policy_version: PolicyVersion,
    /// Idempotency key the execution was deduped by.
    pub idempotency_key: String,
    /// Trace id for correlation queries.
    pub trace_id: Option<String>,
    /// Failure or quarantine reason.
    pub reason: Option<String>,
    /// Reward score, when computed.
    pub reward: Option<f64>,
}

/// Append-only receipts log (`receipts/receipts.log`) with in-memory
/// indexes by idempotency key and trace id.
pub struct ReceiptStore {
    file: Mutex<File>,
    by_key: Mutex<HashMap<String, Receipt>>,
    by_trace: Mutex<HashMap<String, Vec<Uuid>>>,
    receipts: Mutex<Vec<Receipt>>,
    _path: PathBuf,
}

impl ReceiptStore {
    /// Open the log, replaying existing receipts into the indexes.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ActionError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ActionError::Receipts(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ActionError::Receipts(e.to_string()))?;

        let mut receipts = Vec::new();
        let mut reader = BufReader::new(
            File::open(&path).map_err(|e| ActionError::Receipts(e.to_string()))?,
        );
        let mut good_end = 0u64;
        while let Some(body) = read_frame(&mut reader).map_err(|e| ActionError::Receipts(e.to_string()))? {
            if let Ok(receipt) = rmp_serde::from_slice::<Receipt>(&body) {
                receipts.push(receipt);
            }
            good_end += 8 + body.len() as u64;
        }
        let actual = file
            .metadata()
            .map_err(|e| ActionError::Receipts(e.to_string()))?
            .len();
        if actual > good_end {
            file.set_len(good_end)
                .map_err(|e| ActionError::Receipts(e.to_string()))?;
        }
        file.seek(SeekFrom::End(0))
            .map_err(|e| ActionError::Receipts(e.to_string()))?;

        let mut by_key = HashMap::new();
        let mut by_trace: HashMap<String, Vec<Uuid>> = HashMap::new();
        for receipt in &receipts {
            if receipt.status == ReceiptStatus::Ok {
                by_key.insert(receipt.idempotency_key.clone(), receipt.clone());
            }
            if let Some(trace) = &receipt.trace_id {
                by_trace.entry(trace.clone()).or_default().push(receipt.receipt_id);
            }
        }

        Ok(Self {
            file: Mutex::new(file),
            by_key: Mutex::new(by_key),
            by_trace: Mutex::new(by_trace),
            receipts: Mutex::new(receipts),
            _path: path,
        })
    }

    /// Append a receipt durably and index it.
    pub fn append(&self, receipt: &Receipt) -> Result<(), ActionError> {
        let body =
            rmp_serde::to_vec_named(receipt).map_err(|e| ActionError::Receipts(e.to_string()))?;
        {
            let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
            let len = body.len() as u32;
            let crc = crc32fast::hash(&body);
            file.write_all(&len.to_le_bytes())
                .and_then(|_| file.write_all(&crc.to_le_bytes()))
                .and_then(|_| file.write_all(&body))
                .and_then(|_| file.flush())
                .and_then(|_| file.sync_data())
                .map_err(|e| ActionError::Receipts(e.to_string()))?;
        }
        if receipt.status == ReceiptStatus::Ok {
            self.by_key
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(receipt.idempotency_key.clone(), receipt.clone());
        }
        if let Some(trace) = &receipt.trace_id {
            self.by_trace
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry(trace.clone())
                .or_default()
                .push(receipt.receipt_id);
        }
        self.receipts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(receipt.clone());
        Ok(())
    }

    /// Prior successful receipt for an idempotency key.
    pub fn cached(&self, idempotency_key: &str) -> Option<Receipt> {
        self.by_key
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(idempotency_key)
            .cloned()
    }

    /// All receipts carrying a trace id, in append order.
    pub fn by_trace(&self, trace_id: &str) -> Vec<Receipt> {
        let ids: Vec<Uuid> = self
            .by_trace
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(trace_id)
            .cloned()
            .unwrap_or_default();
        let receipts = self.receipts.lock().unwrap_or_else(|p| p.into_inner());
        receipts
            .iter()
            .filter(|r| ids.contains(&r.receipt_id))
            .cloned()
            .collect()
    }

    /// Total receipt count.
    pub fn len(&self) -> usize {
        self.receipts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Whether no receipts exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match r.read(&mut header[filled..])? {
            0 => return Ok(None),
            n => filled += n,
        }
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > 4 * 1024 * 1024 {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match r.read(&mut body[filled..])? {
            0 => return Ok(None),
            n => filled += n,
        }
    }
    if crc32fast::hash(&body) != crc {
        return Ok(None);
    }
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(key: &str, status: ReceiptStatus, trace: Option<&str>) -> Receipt {
        Receipt {
            receipt_id: Uuid::new_v4(),
            tool_id: "file_note".into(),
            status,
            started_at: Utc::now(),
            duration_ms: 12,
            cost: 0.01,
            inputs_hash: "abc".into(),
            outputs: Some(serde_json::json!({ "ok": true })),
            policy_version: PolicyVersion(1),
            idempotency_key: key.into(),
            trace_id: trace.map(|t| t.to_string()),
            reason: None,
            reward: Some(0.9),
        }
    }

    #[test]
    fn receipts_survive_reopen_and_index_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipts.log");
        {
            let store = ReceiptStore::open(&path).unwrap();
            store.append(&receipt("k1", ReceiptStatus::Ok, Some("tr-1"))).unwrap();
            store.append(&receipt("k2", ReceiptStatus::Error, Some("tr-1"))).unwrap();
        }
        let store = ReceiptStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.cached("k1").is_some());
        // Failed attempts never satisfy the cache.
        assert!(store.cached("k2").is_none());
        assert_eq!(store.by_trace("tr-1").len(), 2);
    }
}
