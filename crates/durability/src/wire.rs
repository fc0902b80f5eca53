//! The JSON log-set layout written to sealed log files, and the hash chains
//! that make it tamper-evident.

use std::sync::LazyLock;

use common::sha256::Sha256;
use serde::{
    Deserialize,
    Serialize,
};

/// Seed of every logger's epoch hash chain, fixed at build time. The first
/// epoch a logger writes chains off the SHA-256 of this passphrase.
pub const PASSPHRASE: &str = "At that moment, the sealed log began to speak.";

pub static PASSPHRASE_HASH: LazyLock<String> =
    LazyLock::new(|| Sha256::hash(PASSPHRASE.as_bytes()).as_hex());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "WRITE")]
    Write,
    #[serde(rename = "DELETE")]
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Write => "WRITE",
            OpType::Delete => "DELETE",
        }
    }
}

/// One operation of a committed transaction, as buffered by a worker before
/// hashing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub op: OpType,
    pub key: String,
    pub val: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub tid: u64,
    pub op_type: OpType,
    pub key: String,
    pub val: String,
    /// Hash of the previous record in the set; the first record carries the
    /// hash of the last, closing the set into a ring.
    #[serde(default)]
    pub prev_hash: String,
}

impl LogRecord {
    /// SHA-256 over the canonical string `tid || op_type || key || val`.
    pub fn hash(&self) -> String {
        record_hash(self.tid, self.op_type, &self.key, &self.val)
    }

    pub fn epoch(&self) -> u64 {
        common::TidWord::from_raw(self.tid).epoch()
    }
}

pub fn record_hash(tid: u64, op_type: OpType, key: &str, val: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tid.to_string());
    hasher.update(op_type.as_str());
    hasher.update(key);
    hasher.update(val);
    hasher.finalize().as_hex()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSetHeader {
    /// SHA-256 over the concatenated record hashes of this logger's
    /// previous epoch; the passphrase hash for the first epoch ever.
    pub prev_epoch_hash: String,
    pub log_record_num: u64,
}

/// A batch of log records belonging to a single epoch, produced by one
/// worker's buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSet {
    pub log_header: LogSetHeader,
    pub log_set: Vec<LogRecord>,
}

impl LogSet {
    /// Assemble a set from raw records, closing the intra-set hash ring.
    pub fn assemble(prev_epoch_hash: String, mut records: Vec<LogRecord>) -> Self {
        let n = records.len();
        debug_assert!(n > 0);
        let hashes: Vec<String> = records.iter().map(LogRecord::hash).collect();
        for (i, record) in records.iter_mut().enumerate() {
            record.prev_hash = hashes[(i + n - 1) % n].clone();
        }
        Self {
            log_header: LogSetHeader {
                prev_epoch_hash,
                log_record_num: n as u64,
            },
            log_set: records,
        }
    }

    pub fn epoch(&self) -> u64 {
        debug_assert!(!self.log_set.is_empty());
        self.log_set[0].epoch()
    }

    /// The concatenated per-record hashes, feeding the epoch-level chain.
    pub fn concatenated_record_hashes(&self) -> String {
        let mut acc = String::with_capacity(self.log_set.len() * 64);
        for record in &self.log_set {
            acc.push_str(&record.hash());
        }
        acc
    }

    /// The set's own hash: SHA-256 over the concatenated record hashes.
    /// This is what the pepoch file pins for each logger's last set.
    pub fn own_hash(&self) -> String {
        Sha256::hash(self.concatenated_record_hashes().as_bytes()).as_hex()
    }

    /// Verify the intra-set ring: each record's `prev_hash` must equal the
    /// recomputed hash of its predecessor (the last record for the first).
    pub fn verify_ring(&self) -> bool {
        let n = self.log_set.len();
        if n == 0 {
            return false;
        }
        if n == 1 {
            return self.log_set[0].prev_hash == self.log_set[0].hash();
        }
        let mut prev_hash = self.log_set[n - 1].hash();
        for record in &self.log_set {
            if record.prev_hash != prev_hash {
                return false;
            }
            prev_hash = record.hash();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{
        LogRecord,
        LogSet,
        OpType,
        PASSPHRASE_HASH,
    };
    use common::TidWord;

    fn record(tid: u64, key: &str, val: &str) -> LogRecord {
        LogRecord {
            tid,
            op_type: OpType::Write,
            key: key.to_owned(),
            val: val.to_owned(),
            prev_hash: String::new(),
        }
    }

    fn tid_at_epoch(epoch: u64, serial: u64) -> u64 {
        TidWord::new().with_epoch(epoch).with_tid(serial).raw()
    }

    #[test]
    fn test_ring_closes_and_verifies() {
        let set = LogSet::assemble(
            PASSPHRASE_HASH.clone(),
            vec![
                record(tid_at_epoch(1, 0), "a", "1"),
                record(tid_at_epoch(1, 1), "b", "2"),
                record(tid_at_epoch(1, 2), "c", "3"),
            ],
        );
        assert!(set.verify_ring());
        assert_eq!(set.log_header.log_record_num, 3);
        assert_eq!(set.epoch(), 1);
        // First record chains off the last.
        assert_eq!(set.log_set[0].prev_hash, set.log_set[2].hash());
    }

    #[test]
    fn test_single_record_ring_is_self_hash() {
        let set = LogSet::assemble(String::new(), vec![record(tid_at_epoch(2, 0), "k", "v")]);
        assert!(set.verify_ring());
        assert_eq!(set.log_set[0].prev_hash, set.log_set[0].hash());
    }

    #[test]
    fn test_tampered_value_breaks_ring() {
        let mut set = LogSet::assemble(
            String::new(),
            vec![
                record(tid_at_epoch(1, 0), "a", "1"),
                record(tid_at_epoch(1, 1), "b", "2"),
            ],
        );
        set.log_set[1].val = "evil".to_owned();
        assert!(!set.verify_ring());
    }

    #[test]
    fn test_json_field_names() {
        let set = LogSet::assemble(
            PASSPHRASE_HASH.clone(),
            vec![record(tid_at_epoch(1, 0), "k", "v")],
        );
        let json = serde_json::to_value(&set).unwrap();
        assert!(json.get("log_header").is_some());
        assert_eq!(
            json["log_header"]["log_record_num"],
            serde_json::json!(1u64)
        );
        assert_eq!(json["log_set"][0]["op_type"], serde_json::json!("WRITE"));
        assert!(json["log_set"][0].get("val").is_some());
        assert!(json["log_set"][0].get("prev_hash").is_some());
    }
}
