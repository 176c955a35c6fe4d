// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stage 2 of the pipeline: the serial appender of one destination stream.
//!
//! The service owns the stream's [`CursorTracker`] and processes commands
//! one at a time, so the read-cursor / append / advance-cursor sequence of
//! two units can never interleave.
//!
//! ```text
//!    ┌──────────────┐
//!    │   Handles    │ (stage-1 tasks, Clone)
//!    └──────┬───────┘
//!           │ AppendCommand via channel
//!           v
//!    ┌──────────────┐
//!    │   Service    │ (single consumer)
//!    └──────┬───────┘
//!           │ owns the cursor
//!           v
//!       Transport
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::codec::WireUnit;
use crate::cursor::{CursorTracker, Resolved};
use crate::transport::{AppendRequest, Transport};

/// A wire unit together with the delivery timestamp stage 1 chose for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUnit {
    pub unit: WireUnit,
    pub timestamp: i64,
}

#[derive(Debug)]
pub enum AppendCommand {
    Append(QueuedUnit),
    /// Answered once everything queued before it has been attempted.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Delivery counters of one destination.
#[derive(Debug, Default)]
pub struct ShipperStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ShipperStats {
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct AppendHandle {
    tx: mpsc::UnboundedSender<AppendCommand>,
}

impl AppendHandle {
    pub fn append(&self, unit: QueuedUnit) -> Result<(), mpsc::error::SendError<AppendCommand>> {
        self.tx.send(AppendCommand::Append(unit))
    }

    pub async fn flush(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AppendCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<AppendCommand>> {
        self.tx.send(AppendCommand::Shutdown)
    }
}

pub struct AppendService {
    tracker: CursorTracker,
    transport: Arc<dyn Transport>,
    stats: Arc<ShipperStats>,
    rx: mpsc::UnboundedReceiver<AppendCommand>,
}

impl AppendService {
    #[must_use]
    pub fn new(tracker: CursorTracker, transport: Arc<dyn Transport>) -> (Self, AppendHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = AppendService {
            tracker,
            transport,
            stats: Arc::new(ShipperStats::default()),
            rx,
        };
        (service, AppendHandle { tx })
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ShipperStats> {
        Arc::clone(&self.stats)
    }

    /// Processes commands until `Shutdown` or until every handle is gone.
    pub async fn run(mut self) {
        debug!(
            "LOGSHIP | Append service for {} started",
            self.tracker.destination()
        );

        while let Some(command) = self.rx.recv().await {
            match command {
                AppendCommand::Append(queued) => self.append(queued).await,
                AppendCommand::Flush(response_tx) => {
                    if response_tx.send(()).is_err() {
                        error!("LOGSHIP | Failed to send flush response - receiver dropped");
                    }
                }
                AppendCommand::Shutdown => {
                    debug!("LOGSHIP | Append service shutting down");
                    break;
                }
            }
        }

        debug!(
            "LOGSHIP | Append service for {} stopped, {} delivered, {} dropped",
            self.tracker.destination(),
            self.stats.delivered(),
            self.stats.dropped()
        );
    }

    async fn append(&mut self, queued: QueuedUnit) {
        let destination = self.tracker.destination().clone();
        let marker = queued.unit.marker;
        let request = AppendRequest {
            group: destination.group.clone(),
            stream: destination.stream.clone(),
            message: queued.unit.message,
            timestamp: queued.timestamp,
            cursor: self.tracker.current().map(str::to_string),
        };

        match self.transport.append(request).await {
            Ok(response) => {
                trace!(
                    "LOGSHIP | Appended event at {} to {destination}, next cursor {:?}",
                    queued.timestamp,
                    response.next_cursor
                );
                self.tracker.advance(response.next_cursor);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                let part = marker.map(|m| format!(" part {m}")).unwrap_or_default();
                error!(
                    "LOGSHIP | Failed to append event{part} at {} to {destination}, event dropped: {e}",
                    queued.timestamp
                );
                match e.expected_cursor() {
                    Some(Some(expected)) => self.tracker.advance(Some(expected.to_string())),
                    Some(None) => self.refresh_cursor().await,
                    None => {}
                }
            }
        }
    }

    async fn refresh_cursor(&mut self) {
        match self.tracker.refresh().await {
            Ok(Resolved::Found(cursor)) => {
                debug!("LOGSHIP | Refreshed cursor to {cursor:?}");
            }
            Ok(Resolved::NotFound) => {
                warn!(
                    "LOGSHIP | Log stream {} disappeared",
                    self.tracker.destination()
                );
            }
            Err(e) => error!("LOGSHIP | Failed to refresh cursor: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FragmentMarker;
    use crate::cursor::Destination;
    use crate::transport::{MemoryTransport, TransportError};
    use tracing_test::traced_test;

    async fn spawn_service(transport: Arc<MemoryTransport>) -> (AppendHandle, Arc<ShipperStats>) {
        let tracker = CursorTracker::provision(
            transport.clone(),
            Destination {
                group: "g".to_string(),
                stream: "s".to_string(),
            },
        )
        .await
        .expect("provisioning failed");
        let (service, handle) = AppendService::new(tracker, transport);
        let stats = service.stats();
        tokio::spawn(service.run());
        (handle, stats)
    }

    fn unit(message: &str, timestamp: i64) -> QueuedUnit {
        QueuedUnit {
            unit: WireUnit {
                message: message.to_string(),
                marker: None,
            },
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_appends_in_order_and_advances_cursor() {
        let transport = Arc::new(MemoryTransport::with_group("g"));
        let (handle, stats) = spawn_service(transport.clone()).await;

        for i in 0..5 {
            handle.append(unit(&format!("m{i}"), i)).unwrap();
        }
        handle.flush().await.unwrap();

        let events = transport.events("g", "s");
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(stats.delivered(), 5);
        assert_eq!(stats.dropped(), 0);

        handle.shutdown().unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_append_is_dropped_and_pipeline_continues() {
        let transport = Arc::new(MemoryTransport::with_group("g"));
        let tracker = CursorTracker::provision(
            transport.clone(),
            Destination {
                group: "g".to_string(),
                stream: "s".to_string(),
            },
        )
        .await
        .unwrap();
        let (service, handle) = AppendService::new(tracker, transport.clone());
        let stats = service.stats();

        transport.inject_append_failure(TransportError::Throttled("Rate exceeded".to_string()));
        handle
            .append(QueuedUnit {
                unit: WireUnit {
                    message: "lost".to_string(),
                    marker: FragmentMarker::new(1, 2),
                },
                timestamp: 1,
            })
            .unwrap();
        handle.append(unit("kept", 2)).unwrap();
        handle.shutdown().unwrap();
        // run inline so its logs land in this test's span
        service.run().await;

        let events = transport.events("g", "s");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "kept");
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.delivered(), 1);
        assert!(logs_contain("part [1/2]"));
        assert!(logs_contain("Rate exceeded"));
    }

    #[tokio::test]
    async fn test_stale_cursor_is_recovered_for_next_append() {
        let transport = Arc::new(MemoryTransport::with_group("g"));
        let (handle, stats) = spawn_service(transport.clone()).await;

        // another writer appends behind our back
        transport
            .append(AppendRequest {
                group: "g".to_string(),
                stream: "s".to_string(),
                message: "foreign".to_string(),
                timestamp: 0,
                cursor: None,
            })
            .await
            .unwrap();

        handle.append(unit("rejected", 1)).unwrap();
        handle.append(unit("accepted", 2)).unwrap();
        handle.flush().await.unwrap();

        let messages: Vec<_> = transport
            .events("g", "s")
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["foreign", "accepted"]);
        assert_eq!(stats.dropped(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_units() {
        let transport = Arc::new(MemoryTransport::with_group("g"));
        let tracker = CursorTracker::provision(
            transport.clone(),
            Destination {
                group: "g".to_string(),
                stream: "s".to_string(),
            },
        )
        .await
        .unwrap();
        let (service, handle) = AppendService::new(tracker, transport.clone());

        for i in 0..3 {
            handle.append(unit("queued", i)).unwrap();
        }
        handle.shutdown().unwrap();
        // commands queued before the service even started are all processed
        service.run().await;

        assert_eq!(transport.events("g", "s").len(), 3);
        assert!(handle.append(unit("late", 9)).is_err());
    }
}
