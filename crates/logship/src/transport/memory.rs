// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process log service with the same cursor rules as the real one.
//!
//! Used to run the pipeline without a network, and to script failures.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    AppendRequest, AppendResponse, OutputRecord, QueryPage, QueryRequest, StreamDescription,
    Transport, TransportError,
};
use crate::clock::MonotonicClock;

#[derive(Debug, Default)]
struct Stream {
    appends: u64,
    events: Vec<OutputRecord>,
}

impl Stream {
    fn cursor(&self) -> Option<String> {
        (self.appends > 0).then(|| self.appends.to_string())
    }
}

#[derive(Debug, Default)]
struct State {
    groups: HashMap<String, HashMap<String, Stream>>,
    injected_failures: VecDeque<TransportError>,
    refuse_stream_creation: bool,
    append_attempts: usize,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Transport with an empty group named `group`.
    #[must_use]
    pub fn with_group(group: &str) -> Self {
        let transport = MemoryTransport::new();
        transport.add_group(group);
        transport
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_group(&self, group: &str) {
        self.lock().groups.entry(group.to_string()).or_default();
    }

    /// Stores events directly, bypassing cursors.
    pub fn seed(&self, group: &str, stream: &str, events: impl IntoIterator<Item = OutputRecord>) {
        self.lock()
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(stream.to_string())
            .or_default()
            .events
            .extend(events);
    }

    /// The next append fails with `error` instead of being stored.
    pub fn inject_append_failure(&self, error: TransportError) {
        self.lock().injected_failures.push_back(error);
    }

    pub fn refuse_stream_creation(&self, refuse: bool) {
        self.lock().refuse_stream_creation = refuse;
    }

    /// Every event stored in `stream`, in arrival order.
    #[must_use]
    pub fn events(&self, group: &str, stream: &str) -> Vec<OutputRecord> {
        self.lock()
            .groups
            .get(group)
            .and_then(|streams| streams.get(stream))
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Number of append calls received, successful or not.
    #[must_use]
    pub fn append_attempts(&self) -> usize {
        self.lock().append_attempts
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn describe_group(&self, group: &str) -> Result<bool, TransportError> {
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state.groups.contains_key(group))
    }

    async fn describe_stream(
        &self,
        group: &str,
        stream: &str,
    ) -> Result<Option<StreamDescription>, TransportError> {
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let streams = state
            .groups
            .get(group)
            .ok_or_else(|| TransportError::ResourceNotFound(format!("log group {group}")))?;
        Ok(streams.get(stream).map(|s| StreamDescription {
            log_stream_name: stream.to_string(),
            upload_sequence_token: s.cursor(),
        }))
    }

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.refuse_stream_creation {
            return Err(TransportError::Status {
                status: 400,
                message: "stream creation refused".to_string(),
            });
        }
        let streams = state
            .groups
            .get_mut(group)
            .ok_or_else(|| TransportError::ResourceNotFound(format!("log group {group}")))?;
        if streams.contains_key(stream) {
            return Err(TransportError::AlreadyExists(format!("log stream {stream}")));
        }
        streams.insert(stream.to_string(), Stream::default());
        Ok(())
    }

    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.append_attempts += 1;
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }

        let stream = state
            .groups
            .get_mut(&request.group)
            .and_then(|streams| streams.get_mut(&request.stream))
            .ok_or_else(|| {
                TransportError::ResourceNotFound(format!("log stream {}", request.stream))
            })?;

        let expected = stream.cursor();
        if request.cursor != expected {
            return Err(TransportError::InvalidSequenceToken {
                expected,
                message: format!("sequence token {:?} is stale", request.cursor),
            });
        }

        stream.appends += 1;
        stream.events.push(OutputRecord {
            timestamp: request.timestamp,
            message: request.message,
            ingestion_time: Some(MonotonicClock::now()),
        });
        Ok(AppendResponse {
            next_cursor: stream.cursor(),
        })
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, TransportError> {
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let stream = state
            .groups
            .get(&request.group)
            .and_then(|streams| streams.get(&request.stream))
            .ok_or_else(|| {
                TransportError::ResourceNotFound(format!("log stream {}", request.stream))
            })?;

        let mut matching: Vec<&OutputRecord> = stream
            .events
            .iter()
            .filter(|e| request.start_time.map_or(true, |start| e.timestamp >= start))
            .filter(|e| request.end_time.map_or(true, |end| e.timestamp < end))
            .collect();
        matching.sort_by_key(|e| e.timestamp);

        let offset = request
            .next_token
            .as_deref()
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0)
            .min(matching.len());
        let limit = request.limit.unwrap_or(matching.len()).max(1);
        let end = (offset + limit).min(matching.len());

        Ok(QueryPage {
            events: matching[offset..end].iter().map(|e| (*e).clone()).collect(),
            next_token: Some(end.to_string()),
        })
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(cursor: Option<&str>, message: &str, timestamp: i64) -> AppendRequest {
        AppendRequest {
            group: "g".to_string(),
            stream: "s".to_string(),
            message: message.to_string(),
            timestamp,
            cursor: cursor.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_cursor_advances_and_stale_cursor_is_rejected() {
        let transport = MemoryTransport::with_group("g");
        transport.create_stream("g", "s").await.unwrap();

        let first = transport.append(append(None, "a", 1)).await.unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let stale = transport.append(append(None, "b", 2)).await.unwrap_err();
        assert_eq!(stale.expected_cursor(), Some(Some("1")));

        let second = transport.append(append(Some("1"), "b", 2)).await.unwrap();
        assert_eq!(second.next_cursor.as_deref(), Some("2"));
        assert_eq!(transport.events("g", "s").len(), 2);
        assert_eq!(transport.append_attempts(), 3);
    }

    #[tokio::test]
    async fn test_query_pages_through_time_window() {
        let transport = MemoryTransport::with_group("g");
        transport.seed(
            "g",
            "s",
            (0..10).map(|i| OutputRecord::new(i, format!("m{i}"))),
        );

        let mut request = QueryRequest {
            group: "g".to_string(),
            stream: "s".to_string(),
            start_time: Some(2),
            end_time: Some(8),
            limit: Some(4),
            next_token: None,
        };
        let first = transport.query(&request).await.unwrap();
        assert_eq!(first.events.len(), 4);
        assert_eq!(first.events[0].timestamp, 2);

        request.next_token = first.next_token;
        let second = transport.query(&request).await.unwrap();
        assert_eq!(second.events.len(), 2);
        assert_eq!(second.events[1].timestamp, 7);

        request.next_token = second.next_token.clone();
        let last = transport.query(&request).await.unwrap();
        assert!(last.events.is_empty());
        assert_eq!(last.next_token, second.next_token);
    }

    #[tokio::test]
    async fn test_injected_failure_and_close() {
        let transport = MemoryTransport::with_group("g");
        transport.create_stream("g", "s").await.unwrap();
        transport.inject_append_failure(TransportError::Throttled("slow".to_string()));

        assert!(matches!(
            transport.append(append(None, "a", 1)).await,
            Err(TransportError::Throttled(_))
        ));
        assert!(transport.append(append(None, "a", 1)).await.is_ok());

        transport.close().await;
        assert!(transport.is_closed());
        assert!(matches!(
            transport.append(append(Some("1"), "b", 2)).await,
            Err(TransportError::Closed)
        ));
    }
}
