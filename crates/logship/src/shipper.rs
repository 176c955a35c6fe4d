// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The write side: a [`LogShipper`] accepts records without blocking,
//! encodes them on the runtime (stage 1) and feeds the resulting wire units
//! to the destination's [`AppendService`] (stage 2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::append_service::{AppendHandle, AppendService, QueuedUnit, ShipperStats};
use crate::clock::MonotonicClock;
use crate::codec::Codec;
use crate::config::Config;
use crate::cursor::{CursorTracker, Destination};
use crate::errors::{CreationError, QueryError};
use crate::reader::{self, QueryFilter};
use crate::record::Record;
use crate::transport::{OutputRecord, Transport};

pub struct LogShipper {
    destination: Destination,
    tag: Option<String>,
    codec: Arc<Codec>,
    clock: Arc<MonotonicClock>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    appender: AppendHandle,
    append_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ShipperStats>,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
    // flush and shutdown both close the task tracker, one at a time
    drain_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogShipper")
            .field("destination", &self.destination)
            .field("tag", &self.tag)
            .field("codec", &self.codec)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl LogShipper {
    /// Provisions the destination stream and starts the append service on
    /// the current tokio runtime.
    pub async fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        clock: Arc<MonotonicClock>,
    ) -> Result<Self, CreationError> {
        let runtime = Handle::try_current().map_err(|_| CreationError::NoRuntime)?;
        let destination = config.destination();

        let tracker = CursorTracker::provision(Arc::clone(&transport), destination.clone()).await?;
        let (service, appender) = AppendService::new(tracker, Arc::clone(&transport));
        let stats = service.stats();
        let append_task = runtime.spawn(service.run());

        debug!(
            "LOGSHIP | Shipper for {destination} started (split: {}, max size: {})",
            config.split, config.max_message_size
        );
        Ok(LogShipper {
            destination,
            tag: config.tag.clone(),
            codec: Arc::new(config.build_codec()),
            clock,
            runtime,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            tasks: TaskTracker::new(),
            appender,
            append_task: Mutex::new(Some(append_task)),
            stats,
            transport,
            closed: AtomicBool::new(false),
            drain_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// An untagged shipper takes every record, a tagged one only records
    /// carrying its tag.
    #[must_use]
    pub fn accepts(&self, record: &Record) -> bool {
        match &self.tag {
            None => true,
            Some(tag) => record.tag.as_deref() == Some(tag.as_str()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ShipperStats {
        &self.stats
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues `record` for delivery and returns immediately. Delivery
    /// failures are logged, never reported back.
    pub fn submit(&self, record: Record) {
        if self.is_closed() {
            warn!(
                "LOGSHIP | Shipper for {} is shut down, record dropped",
                self.destination
            );
            return;
        }

        let codec = Arc::clone(&self.codec);
        let clock = Arc::clone(&self.clock);
        let permits = Arc::clone(&self.permits);
        let appender = self.appender.clone();
        self.tasks.spawn_on(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                encode_and_queue(&codec, &clock, &appender, &record);
            },
            &self.runtime,
        );
    }

    /// Waits until every record submitted before the call has been
    /// attempted against the backend.
    pub async fn flush(&self) {
        let _guard = self.drain_lock.lock().await;
        self.tasks.close();
        self.tasks.wait().await;
        if !self.is_closed() {
            self.tasks.reopen();
        }

        if let Err(e) = self.appender.flush().await {
            error!("LOGSHIP | Failed to flush {}: {e}", self.destination);
        }
    }

    /// Reads back what this shipper's stream holds, split records merged.
    pub async fn read(&self, filter: &QueryFilter) -> Result<Vec<OutputRecord>, QueryError> {
        reader::read_events(self.transport.as_ref(), &self.destination, filter).await
    }

    /// Refuses new records, drains both stages and closes the transport.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.drain_lock.lock().await;

        self.tasks.close();
        self.tasks.wait().await;

        if let Err(e) = self.appender.shutdown() {
            error!("LOGSHIP | Failed to stop append service: {e}");
        }
        let append_task = self
            .append_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = append_task {
            if let Err(e) = task.await {
                error!("LOGSHIP | Append service for {} failed: {e}", self.destination);
            }
        }

        self.transport.close().await;
        debug!(
            "LOGSHIP | Shipper for {} shut down, {} delivered, {} dropped",
            self.destination,
            self.stats.delivered(),
            self.stats.dropped()
        );
    }
}

/// Stage 1 for one record. All units of a split record share one unique
/// timestamp so the reassembler can group them back together.
fn encode_and_queue(
    codec: &Codec,
    clock: &MonotonicClock,
    appender: &AppendHandle,
    record: &Record,
) {
    let encoded = codec.encode(record);
    let timestamp = if encoded.is_split() {
        clock.next()
    } else {
        MonotonicClock::now()
    };

    for unit in encoded {
        if let Err(e) = appender.append(QueuedUnit { unit, timestamp }) {
            error!("LOGSHIP | Failed to queue event at {timestamp}: {e}");
            return;
        }
    }
}
