//! Controller/test host protocol
//!
//! Every message is a type tag plus a JSON payload. The payload shape is
//! determined by the tag; see [`payloads`].

pub mod payloads;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::{OrchestratorError, Result};

pub use payloads::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Discovery
    StartDiscovery,
    TestCasesFound,
    DiscoveryComplete,

    // Execution
    StartTestExecutionWithSources,
    StartTestExecutionWithTests,
    TestRunStatsChange,
    ExecutionComplete,
    CancelTestRun,
    AbortTestRun,

    // Common
    TestMessage,
    SessionEnd,

    // Data collection
    BeforeTestRunStart,
    BeforeTestRunStartResult,
    TestHostLaunched,
    AfterTestRunEnd,
    AfterTestRunEndResult,
    DataCollectionMessage,

    // Test case events
    TestCaseStart,
    TestCaseEnd,
    TestCaseEndResult,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{name}")
    }
}

/// A protocol message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: JsonValue,
    pub version: u32,
}

impl Message {
    /// Message with no payload
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            payload: JsonValue::Null,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn with_payload<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self {
            message_type,
            payload: serde_json::to_value(payload)?,
            version: PROTOCOL_VERSION,
        })
    }

    /// Decode the payload; a malformed payload is a protocol error
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            OrchestratorError::Protocol(format!(
                "Malformed payload for {}: {e}",
                self.message_type
            ))
        })
    }

    /// Encode as a single line of JSON (without the trailing newline)
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(line.trim_end())
            .map_err(|e| OrchestratorError::Protocol(format!("Malformed message: {e}")))?;

        if message.version != PROTOCOL_VERSION {
            return Err(OrchestratorError::Protocol(format!(
                "Protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, message.version
            )));
        }

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (v{})", self.message_type, self.version)
    }
}
