//! Messages exchanged between the pool and its workers.
//!
//! One JSON object per line in each direction, tagged by `type`:
//!
//! ```text
//! pool  -> worker: {"type":"init","config":{...}}
//! worker -> pool:  {"type":"ready","model":"all-minilm-l6-v2","dimension":384}
//! pool  -> worker: {"type":"embed","correlation_id":7,"texts":["..."],"role":"passage"}
//! worker -> pool:  {"type":"vectors","correlation_id":7,"vectors":[[0.1, ...]]}
//! pool  -> worker: {"type":"ping","correlation_id":8}
//! worker -> pool:  {"type":"pong","correlation_id":8,"memory_bytes":123456}
//! pool  -> worker: {"type":"shutdown"}
//! worker -> pool:  {"type":"shutting_down"}
//! ```
//!
//! Any request may instead be answered with `{"type":"error",...}`.
use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::model::EmbedRole;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init {
        config: EmbedConfig,
    },
    Embed {
        correlation_id: u64,
        texts: Vec<String>,
        role: EmbedRole,
    },
    Ping {
        correlation_id: u64,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready {
        model: String,
        dimension: usize,
    },
    Vectors {
        correlation_id: u64,
        vectors: Vec<Vec<f32>>,
    },
    Pong {
        correlation_id: u64,
        memory_bytes: Option<u64>,
    },
    Error {
        correlation_id: Option<u64>,
        message: String,
    },
    ShuttingDown,
}

impl WorkerResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerResponse::Ready { .. } => "ready",
            WorkerResponse::Vectors { .. } => "vectors",
            WorkerResponse::Pong { .. } => "pong",
            WorkerResponse::Error { .. } => "error",
            WorkerResponse::ShuttingDown => "shutting_down",
        }
    }
}

/// Serialize a message as a single newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| EmbedError::protocol(format!("failed to encode message: {e}")))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| EmbedError::protocol(format!("failed to decode message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let line = encode_line(&WorkerRequest::Embed {
            correlation_id: 7,
            texts: vec!["hello".to_string()],
            role: EmbedRole::Query,
        })
        .unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "embed");
        assert_eq!(value["role"], "query");
        assert_eq!(value["correlation_id"], 7);
    }

    #[test]
    fn test_decode_shutdown_and_error() {
        let request: WorkerRequest = decode_line("{\"type\":\"shutdown\"}\n").unwrap();
        assert_eq!(request, WorkerRequest::Shutdown);

        let response: WorkerResponse =
            decode_line(r#"{"type":"error","correlation_id":null,"message":"boom"}"#).unwrap();
        assert_eq!(response.kind(), "error");
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        let err = decode_line::<WorkerRequest>(r#"{"type":"reticulate"}"#).unwrap_err();
        assert!(matches!(err, EmbedError::Protocol { .. }));
    }
}
