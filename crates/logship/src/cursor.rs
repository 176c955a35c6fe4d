// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append cursor bookkeeping for one destination stream.
//!
//! The backend rejects an append that does not carry the latest cursor, so
//! the tracker is owned by the single stage-2 worker of its stream and is
//! never shared.

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::CreationError;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub group: String,
    pub stream: String,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.stream)
    }
}

pub struct CursorTracker {
    transport: Arc<dyn Transport>,
    destination: Destination,
    cursor: Option<String>,
}

impl std::fmt::Debug for CursorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorTracker")
            .field("destination", &self.destination)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

/// Outcome of looking a stream up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The stream exists. A fresh stream has no cursor yet.
    Found(Option<String>),
    NotFound,
}

impl CursorTracker {
    /// Checks the group exists, creates the stream when missing, and loads
    /// its current cursor. Any failure here is fatal for the shipper.
    pub async fn provision(
        transport: Arc<dyn Transport>,
        destination: Destination,
    ) -> Result<Self, CreationError> {
        let group_exists = transport
            .describe_group(&destination.group)
            .await
            .map_err(CreationError::Describe)?;
        if !group_exists {
            return Err(CreationError::GroupNotFound(destination.group));
        }

        let cursor = match resolve(transport.as_ref(), &destination)
            .await
            .map_err(CreationError::Describe)?
        {
            Resolved::Found(cursor) => cursor,
            Resolved::NotFound => {
                info!("LOGSHIP | Creating log stream {destination}");
                match transport
                    .create_stream(&destination.group, &destination.stream)
                    .await
                {
                    // lost a race with another writer, the stream is there now
                    Ok(()) | Err(TransportError::AlreadyExists(_)) => {}
                    Err(source) => {
                        return Err(CreationError::StreamCreation {
                            group: destination.group,
                            stream: destination.stream,
                            source,
                        })
                    }
                }
                match resolve(transport.as_ref(), &destination)
                    .await
                    .map_err(CreationError::Describe)?
                {
                    Resolved::Found(cursor) => cursor,
                    Resolved::NotFound => {
                        return Err(CreationError::StreamNotFound {
                            group: destination.group,
                            stream: destination.stream,
                        })
                    }
                }
            }
        };

        debug!("LOGSHIP | Provisioned {destination} with cursor {cursor:?}");
        Ok(CursorTracker {
            transport,
            destination,
            cursor,
        })
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub fn current(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Replaces the cursor with the one returned by a successful append.
    pub fn advance(&mut self, next: Option<String>) {
        self.cursor = next;
    }

    /// Reloads the cursor from the backend.
    pub async fn refresh(&mut self) -> Result<Resolved, TransportError> {
        let resolved = resolve(self.transport.as_ref(), &self.destination).await?;
        if let Resolved::Found(cursor) = &resolved {
            self.cursor.clone_from(cursor);
        }
        Ok(resolved)
    }
}

/// Current cursor of `destination`.
pub async fn resolve(
    transport: &dyn Transport,
    destination: &Destination,
) -> Result<Resolved, TransportError> {
    Ok(
        match transport
            .describe_stream(&destination.group, &destination.stream)
            .await?
        {
            Some(description) => Resolved::Found(description.upload_sequence_token),
            None => Resolved::NotFound,
        },
    )
}
