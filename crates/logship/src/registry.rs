// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named shippers and tag based routing.
//!
//! A record carrying a tag goes to every shipper configured with that tag.
//! Untagged shippers receive every record.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::errors::{CreationError, QueryError};
use crate::reader::QueryFilter;
use crate::record::Record;
use crate::shipper::LogShipper;
use crate::transport::{OutputRecord, Transport, TransportError};

#[derive(Debug, Default)]
pub struct ShipperRegistry {
    shippers: Vec<(String, LogShipper)>,
}

impl ShipperRegistry {
    #[must_use]
    pub fn new() -> Self {
        ShipperRegistry::default()
    }

    /// Starts one shipper per `(name, config)`, each with the transport
    /// `transport_for` builds for it. If any of them fails, the ones already
    /// started are shut down again.
    pub async fn start<F>(
        writers: impl IntoIterator<Item = (String, Config)>,
        clock: Arc<MonotonicClock>,
        mut transport_for: F,
    ) -> Result<Self, CreationError>
    where
        F: FnMut(&Config) -> Result<Arc<dyn Transport>, TransportError>,
    {
        let mut registry = ShipperRegistry::new();
        for (name, config) in writers {
            let started = match transport_for(&config) {
                Ok(transport) => LogShipper::start(&config, transport, Arc::clone(&clock)).await,
                Err(e) => Err(CreationError::Transport(e)),
            };
            match started {
                Ok(shipper) => {
                    registry.register(name, shipper);
                }
                Err(e) => {
                    error!("LOGSHIP | Failed to start writer '{name}': {e}");
                    registry.shutdown().await;
                    return Err(e);
                }
            }
        }
        Ok(registry)
    }

    /// Adds `shipper` under `name`, returning the shipper it replaces.
    pub fn register(&mut self, name: impl Into<String>, shipper: LogShipper) -> Option<LogShipper> {
        let name = name.into();
        debug!(
            "LOGSHIP | Registering writer '{name}' for {}",
            shipper.destination()
        );
        match self.shippers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => {
                warn!("LOGSHIP | Writer '{name}' registered twice, replacing it");
                Some(std::mem::replace(slot, shipper))
            }
            None => {
                self.shippers.push((name, shipper));
                None
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LogShipper> {
        self.shippers
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, shipper)| shipper)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shippers.iter().map(|(name, _)| name.as_str())
    }

    /// Shippers configured with `tag`.
    pub fn tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a LogShipper> + 'a {
        self.shippers
            .iter()
            .map(|(_, shipper)| shipper)
            .filter(move |shipper| shipper.tag() == Some(tag))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shippers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shippers.is_empty()
    }

    /// Hands `record` to every shipper that accepts it and returns how many
    /// did.
    pub fn submit(&self, record: Record) -> usize {
        let targets: Vec<&LogShipper> = self
            .shippers
            .iter()
            .map(|(_, shipper)| shipper)
            .filter(|shipper| shipper.accepts(&record))
            .collect();

        let Some((last, rest)) = targets.split_last() else {
            debug!("LOGSHIP | No writer accepts records tagged {:?}", record.tag);
            return 0;
        };
        for shipper in rest {
            shipper.submit(record.clone());
        }
        last.submit(record);
        targets.len()
    }

    pub async fn flush(&self) {
        for (_, shipper) in &self.shippers {
            shipper.flush().await;
        }
    }

    pub async fn read(
        &self,
        name: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<OutputRecord>, QueryError> {
        self.get(name)
            .ok_or_else(|| QueryError::UnknownWriter(name.to_string()))?
            .read(filter)
            .await
    }

    pub async fn shutdown(&self) {
        for (_, shipper) in &self.shippers {
            shipper.shutdown().await;
        }
    }
}
