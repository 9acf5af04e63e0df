//! Work Queue
//!
//! Work is delivered as JSON messages, at least once:
//!
//! ```json
//! {"kind": "rebuild", "partition": "TX", "chain": true}
//! {"kind": "sync", "partition": "CA"}
//! {"kind": "national_rollup"}
//! ```
//!
//! A scheduler fans out one message per partition plus one rollup sentinel;
//! engines publish continuation and chain messages back onto the same queue.
//!
//! ## Malformed payloads
//!
//! Hand-edited or truncated payloads are common enough that [`parse_message`]
//! attempts recovery: if the text names exactly one known partition, a sync
//! message for it is rebuilt (a rebuild when the text mentions "rebuild").
//! Anything else is a bad message.

use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use regsync_core::PartitionId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkMessage {
    Rebuild {
        partition: PartitionId,
        /// Hand off to the next partition in the declared order when done
        #[serde(default)]
        chain: bool,
    },
    Sync {
        partition: PartitionId,
    },
    NationalRollup,
}

impl WorkMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkMessage::Rebuild { .. } => "rebuild",
            WorkMessage::Sync { .. } => "sync",
            WorkMessage::NationalRollup => "national_rollup",
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode a payload, recovering what can be recovered from a malformed one.
pub fn parse_message(payload: &str, known: &[PartitionId]) -> Result<WorkMessage> {
    let decode_error = match serde_json::from_str::<WorkMessage>(payload) {
        Ok(message) => return Ok(message),
        Err(e) => e,
    };

    let mentioned: BTreeSet<&PartitionId> = payload
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .filter_map(|token| known.iter().find(|p| p.as_str() == token))
        .collect();

    if mentioned.len() != 1 {
        return Err(EngineError::BadMessage(format!(
            "{decode_error}; {} known partitions mentioned",
            mentioned.len()
        )));
    }
    let partition = mentioned.into_iter().next().cloned().ok_or_else(|| {
        EngineError::BadMessage(decode_error.to_string())
    })?;

    let recovered = if payload.to_ascii_lowercase().contains("rebuild") {
        WorkMessage::Rebuild {
            partition,
            chain: false,
        }
    } else {
        WorkMessage::Sync { partition }
    };
    warn!(payload = %payload, recovered = ?recovered, "recovered malformed work message");
    Ok(recovered)
}

/// At-least-once message transport.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: &WorkMessage) -> Result<()> {
        self.publish_raw(message.to_payload()?).await
    }

    async fn publish_raw(&self, payload: String) -> Result<()>;

    /// Next payload, or `None` when the queue is currently empty.
    async fn receive(&self) -> Result<Option<String>>;
}

/// FIFO queue held in memory, for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryWorkQueue {
    messages: Mutex<VecDeque<String>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }

    /// Pending payloads, oldest first, without consuming them.
    pub async fn pending(&self) -> Vec<String> {
        self.messages.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn publish_raw(&self, payload: String) -> Result<()> {
        self.messages.lock().await.push_back(payload);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        Ok(self.messages.lock().await.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<PartitionId> {
        ["CA", "NY", "TX", "OR", "IN"].iter().map(PartitionId::new).collect()
    }

    #[test]
    fn test_message_wire_format() {
        let message = WorkMessage::Rebuild {
            partition: PartitionId::new("TX"),
            chain: true,
        };
        assert_eq!(
            message.to_payload().unwrap(),
            r#"{"kind":"rebuild","partition":"TX","chain":true}"#
        );
        assert_eq!(
            parse_message(r#"{"kind":"national_rollup"}"#, &known()).unwrap(),
            WorkMessage::NationalRollup
        );
        assert_eq!(
            parse_message(r#"{"kind":"rebuild","partition":"CA"}"#, &known()).unwrap(),
            WorkMessage::Rebuild {
                partition: PartitionId::new("CA"),
                chain: false
            }
        );
    }

    #[test]
    fn test_recovers_single_partition() {
        let recovered = parse_message(r#"{"kind":"sync","partition":"TX""#, &known()).unwrap();
        assert_eq!(recovered, WorkMessage::Sync { partition: PartitionId::new("TX") });

        let recovered = parse_message("please rebuild NY", &known()).unwrap();
        assert_eq!(
            recovered,
            WorkMessage::Rebuild {
                partition: PartitionId::new("NY"),
                chain: false
            }
        );
    }

    #[test]
    fn test_lowercase_words_are_not_partitions() {
        // "in" and "or" must not match IN and OR
        let recovered = parse_message("sync in TX or later", &known()).unwrap();
        assert_eq!(recovered, WorkMessage::Sync { partition: PartitionId::new("TX") });
    }

    #[test]
    fn test_ambiguous_or_empty_payload_is_bad() {
        assert!(matches!(
            parse_message("sync TX and CA", &known()),
            Err(EngineError::BadMessage(_))
        ));
        assert!(matches!(
            parse_message("garbage", &known()),
            Err(EngineError::BadMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_queue_is_fifo() {
        let queue = InMemoryWorkQueue::new();
        queue.publish(&WorkMessage::NationalRollup).await.unwrap();
        queue.publish_raw("second".to_string()).await.unwrap();
        assert_eq!(queue.len().await, 2);
        assert_eq!(
            queue.receive().await.unwrap().as_deref(),
            Some(r#"{"kind":"national_rollup"}"#)
        );
        assert_eq!(queue.receive().await.unwrap().as_deref(), Some("second"));
        assert!(queue.receive().await.unwrap().is_none());
    }
}
