// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships structured log records to a size- and rate-limited log ingestion
//! service and reconstructs records that had to be split across several
//! transport units.
//!
//! The write path is a two-stage pipeline:
//!
//! ```text
//!   submit(record)
//!        │
//!        v
//!   ┌──────────────┐
//!   │   Stage 1    │  (concurrent: render, split / truncate)
//!   └──────┬───────┘
//!          │ wire units
//!          v
//!   ┌──────────────┐
//!   │   Stage 2    │  (serial per stream: append with cursor)
//!   └──────┬───────┘
//!          v
//!      Transport
//! ```
//!
//! The read path pages stored events out of the transport and hands them to
//! the [`reassembler`], which stitches split records back together.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod append_service;
pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod cursor;
pub mod errors;
pub mod pattern;
pub mod reader;
pub mod reassembler;
pub mod record;
pub mod registry;
pub mod renderer;
pub mod shipper;
pub mod transport;
