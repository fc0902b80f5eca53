//! The length-prefixed JSON wire protocol between clients and the server.

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::json;

/// A client-submitted transaction batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMessage {
    pub timestamp_sec: i64,
    pub timestamp_nsec: i64,
    #[serde(rename = "client_sessionID")]
    pub client_session_id: String,
    pub transaction: Vec<OperationMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "READ")]
    Read,
    #[serde(rename = "WRITE")]
    Write,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "SCAN")]
    Scan,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationMessage {
    pub operation: OperationKind,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub left_key: Option<String>,
    #[serde(default)]
    pub right_key: Option<String>,
    #[serde(default)]
    pub l_exclusive: Option<bool>,
    #[serde(default)]
    pub r_exclusive: Option<bool>,
}

/// A validated operation ready for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Procedure {
    Insert {
        key: String,
        value: String,
    },
    Read {
        key: String,
    },
    Write {
        key: String,
        value: String,
    },
    Delete {
        key: String,
    },
    Scan {
        left_key: String,
        l_exclusive: bool,
        right_key: String,
        r_exclusive: bool,
    },
}

impl RequestMessage {
    pub fn timestamp(&self) -> (i64, i64) {
        (self.timestamp_sec, self.timestamp_nsec)
    }

    /// Check field presence per operation and produce executor procedures.
    pub fn procedures(&self) -> Result<Vec<Procedure>, String> {
        let mut procedures = Vec::with_capacity(self.transaction.len());
        for op in &self.transaction {
            let procedure = match op.operation {
                OperationKind::Insert => Procedure::Insert {
                    key: required_key(op)?,
                    value: op.value.clone().unwrap_or_default(),
                },
                OperationKind::Read => Procedure::Read {
                    key: required_key(op)?,
                },
                OperationKind::Write => Procedure::Write {
                    key: required_key(op)?,
                    value: op.value.clone().unwrap_or_default(),
                },
                OperationKind::Delete => Procedure::Delete {
                    key: required_key(op)?,
                },
                OperationKind::Scan => {
                    let left_key = op
                        .left_key
                        .clone()
                        .filter(|key| !key.is_empty())
                        .ok_or_else(|| "Error: SCAN is missing left_key.".to_owned())?;
                    let right_key = op
                        .right_key
                        .clone()
                        .filter(|key| !key.is_empty())
                        .ok_or_else(|| "Error: SCAN is missing right_key.".to_owned())?;
                    Procedure::Scan {
                        left_key,
                        l_exclusive: op.l_exclusive.unwrap_or(false),
                        right_key,
                        r_exclusive: op.r_exclusive.unwrap_or(false),
                    }
                },
            };
            procedures.push(procedure);
        }
        Ok(procedures)
    }
}

fn required_key(op: &OperationMessage) -> Result<String, String> {
    op.key
        .clone()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| "Error: Operation is missing a key.".to_owned())
}

/// The server's reply: an error code (0 ok, -1 client error, -2 aborted),
/// a human-readable content string, and any values read.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub error_code: i32,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_values: Option<Vec<serde_json::Value>>,
}

impl ResponseMessage {
    pub fn new(error_code: i32, content: impl Into<String>) -> Self {
        Self {
            error_code,
            content: content.into(),
            read_values: None,
        }
    }

    /// Attach read results as a list of single-entry `{key: value}`
    /// objects.
    pub fn with_read_values(mut self, pairs: &[(String, String)]) -> Self {
        if !pairs.is_empty() {
            self.read_values = Some(
                pairs
                    .iter()
                    .map(|(key, value)| json!({ key.clone(): value.clone() }))
                    .collect(),
            );
        }
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("response serialization cannot fail")
    }
}

/// Replay defense: a request is admissible only with a timestamp strictly
/// above the session's latest.
pub fn timestamp_is_newer(incoming: (i64, i64), latest: (i64, i64)) -> bool {
    incoming > latest
}

#[cfg(test)]
mod tests {
    use super::{
        timestamp_is_newer,
        Procedure,
        RequestMessage,
        ResponseMessage,
    };

    fn parse(json: &str) -> RequestMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_full_transaction() {
        let msg = parse(
            r#"{
                "timestamp_sec": 10,
                "timestamp_nsec": 20,
                "client_sessionID": "AB12CD",
                "transaction": [
                    {"operation": "INSERT", "key": "k", "value": "v"},
                    {"operation": "READ", "key": "k"},
                    {"operation": "SCAN", "left_key": "a", "right_key": "z",
                     "l_exclusive": true}
                ]
            }"#,
        );
        assert_eq!(msg.client_session_id, "AB12CD");
        let procedures = msg.procedures().unwrap();
        assert_eq!(procedures.len(), 3);
        assert_eq!(
            procedures[0],
            Procedure::Insert {
                key: "k".to_owned(),
                value: "v".to_owned()
            }
        );
        assert_eq!(
            procedures[2],
            Procedure::Scan {
                left_key: "a".to_owned(),
                l_exclusive: true,
                right_key: "z".to_owned(),
                r_exclusive: false,
            }
        );
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let parsed: Result<RequestMessage, _> = serde_json::from_str(
            r#"{
                "timestamp_sec": 1, "timestamp_nsec": 1,
                "client_sessionID": "AB12CD",
                "transaction": [{"operation": "UPSERT", "key": "k"}]
            }"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let msg = parse(
            r#"{
                "timestamp_sec": 1, "timestamp_nsec": 1,
                "client_sessionID": "AB12CD",
                "transaction": [{"operation": "READ"}]
            }"#,
        );
        assert!(msg.procedures().unwrap_err().contains("missing a key"));
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(timestamp_is_newer((2, 0), (1, 999)));
        assert!(timestamp_is_newer((1, 10), (1, 9)));
        assert!(!timestamp_is_newer((1, 9), (1, 9)));
        assert!(!timestamp_is_newer((0, 5), (1, 0)));
    }

    #[test]
    fn test_response_shape() {
        let response = ResponseMessage::new(0, "OK")
            .with_read_values(&[("k".to_owned(), "v".to_owned())]);
        let json: serde_json::Value = serde_json::from_slice(&response.to_bytes()).unwrap();
        assert_eq!(json["error_code"], 0);
        assert_eq!(json["read_values"][0]["k"], "v");
    }

    #[test]
    fn test_empty_read_values_omitted() {
        let response = ResponseMessage::new(-1, "nope").with_read_values(&[]);
        let json: serde_json::Value =
            serde_json::from_slice(&response.to_bytes()).unwrap();
        assert!(json.get("read_values").is_none());
    }
}
