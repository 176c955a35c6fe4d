// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The remote log service, seen through the handful of calls the shipper
//! needs. Every stream has an append cursor: an append must present the
//! latest one or it is rejected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::MemoryTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescription {
    pub log_stream_name: String,
    #[serde(default)]
    pub upload_sequence_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub group: String,
    pub stream: String,
    pub message: String,
    /// Delivery timestamp, epoch milliseconds.
    pub timestamp: i64,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendResponse {
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryRequest {
    pub group: String,
    pub stream: String,
    /// Inclusive lower bound, epoch milliseconds.
    pub start_time: Option<i64>,
    /// Exclusive upper bound, epoch milliseconds.
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
    pub next_token: Option<String>,
}

/// A stored event as returned by a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub timestamp: i64,
    pub message: String,
    #[serde(default)]
    pub ingestion_time: Option<i64>,
}

impl OutputRecord {
    #[must_use]
    pub fn new(timestamp: i64, message: impl Into<String>) -> Self {
        OutputRecord {
            timestamp,
            message: message.into(),
            ingestion_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryPage {
    pub events: Vec<OutputRecord>,
    /// Token for the following page. `None` or a repeat of the request token
    /// means there is nothing more to read.
    pub next_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid sequence token (expected {expected:?}): {message}")]
    InvalidSequenceToken {
        expected: Option<String>,
        message: String,
    },
    #[error("data already accepted (next token {expected:?}): {message}")]
    DataAlreadyAccepted {
        expected: Option<String>,
        message: String,
    },
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("{status}: {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// The cursor the backend expected, when the error says so.
    #[must_use]
    pub fn expected_cursor(&self) -> Option<Option<&str>> {
        match self {
            TransportError::InvalidSequenceToken { expected, .. }
            | TransportError::DataAlreadyAccepted { expected, .. } => Some(expected.as_deref()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the log group exists.
    async fn describe_group(&self, group: &str) -> Result<bool, TransportError>;

    /// The stream named exactly `stream` among those matching it as a prefix.
    async fn describe_stream(
        &self,
        group: &str,
        stream: &str,
    ) -> Result<Option<StreamDescription>, TransportError>;

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), TransportError>;

    /// Appends one event. Returns the cursor the next append must present.
    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, TransportError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, TransportError>;

    /// Releases the client. Calls made afterwards fail with
    /// [`TransportError::Closed`].
    async fn close(&self);
}
