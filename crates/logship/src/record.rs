// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The structured log event handed to the shipper.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// Case-insensitive level name, `WARNING` accepted for `WARN`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Level> {
        match name.to_ascii_uppercase().as_str() {
            "TRACE" => Some(Level::Trace),
            "DEBUG" => Some(Level::Debug),
            "INFO" => Some(Level::Info),
            "WARN" | "WARNING" => Some(Level::Warn),
            "ERROR" => Some(Level::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record was emitted from. Carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub class: Option<String>,
    pub method: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A log event. Never mutated after construction: splitting builds new
/// records through [`Record::fragment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub level: Level,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub thread: Option<String>,
    pub location: SourceLocation,
    pub tag: Option<String>,
}

impl Record {
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Record {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            message: message.into(),
            context: BTreeMap::new(),
            thread: std::thread::current().name().map(str::to_string),
            location: SourceLocation::default(),
            tag: None,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    /// Copy of this record carrying `payload` as its message and an extra
    /// context entry.
    #[must_use]
    pub fn fragment(&self, payload: &str, key: &str, value: String) -> Record {
        let mut context = self.context.clone();
        context.insert(key.to_string(), value);
        Record {
            timestamp: self.timestamp,
            level: self.level,
            message: payload.to_string(),
            context,
            thread: self.thread.clone(),
            location: self.location.clone(),
            tag: self.tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_keeps_metadata_and_adds_context() {
        let original = Record::new(Level::Warn, "hello world")
            .with_timestamp(42)
            .with_context("user", "alice")
            .with_tag("audit");

        let fragment = original.fragment("hello", "part", "[1/2]".to_string());

        assert_eq!(fragment.message, "hello");
        assert_eq!(fragment.timestamp, 42);
        assert_eq!(fragment.level, Level::Warn);
        assert_eq!(fragment.tag.as_deref(), Some("audit"));
        assert_eq!(fragment.context.get("user").map(String::as_str), Some("alice"));
        assert_eq!(fragment.context.get("part").map(String::as_str), Some("[1/2]"));
        // the original is untouched
        assert!(!original.context.contains_key("part"));
        assert_eq!(original.message, "hello world");
    }

    #[test]
    fn test_level_display() {
        assert_eq!(Level::Info.to_string(), "INFO");
        assert_eq!(Level::Error.as_str(), "ERROR");
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("Debug"), Some(Level::Debug));
        assert_eq!(Level::parse("fatal"), None);
    }
}
