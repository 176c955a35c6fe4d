// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size limits and reserved names shared by the write and read paths.

/// Largest wire unit shipped by default, in bytes. Stays below the ingestion
/// service's 262144 byte event ceiling, which also counts 26 bytes of
/// per-event overhead.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 250 * 1024;

/// Smallest usable message size. Anything lower is raised to this value so
/// the truncation suffix always fits and splitting always terminates.
pub const MIN_MESSAGE_SIZE: usize = 64;

/// Context key holding the `[part/total]` fragment marker.
pub const CONTEXT_KEY_PART: &str = "part";

/// JSON attribute carrying the record payload.
pub const JSON_MESSAGE_ATTRIBUTE: &str = "message";

/// JSON attribute carrying the rendered context, including the fragment marker.
pub const JSON_CONTEXT_ATTRIBUTE: &str = "context";

/// Number of stage-1 encodings allowed to run at the same time.
pub const DEFAULT_STAGE1_CONCURRENCY: usize = 8;

/// Page size used when reading events back.
pub const DEFAULT_QUERY_LIMIT: usize = 10_000;
