// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The read side: page stored events out of a stream, reassemble split
//! records and filter the result.

use std::borrow::Cow;

use chrono::{Local, TimeZone};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::constants::DEFAULT_QUERY_LIMIT;
use crate::cursor::Destination;
use crate::errors::QueryError;
use crate::reassembler;
use crate::transport::{OutputRecord, QueryRequest, Transport};

const VIEW_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Inclusive lower bound, epoch milliseconds.
    pub start: Option<i64>,
    /// Exclusive upper bound, epoch milliseconds.
    pub end: Option<i64>,
    /// Maximum number of records returned, most recent first.
    pub limit: Option<usize>,
    /// Matched against the reassembled message.
    pub search: Option<String>,
    /// Treat `search` as a regular expression instead of a substring.
    pub regex: bool,
}

enum Search {
    Literal(String),
    Pattern(Regex),
}

impl Search {
    fn compile(filter: &QueryFilter) -> Result<Option<Search>, QueryError> {
        let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(if filter.regex {
            Search::Pattern(Regex::new(search)?)
        } else {
            Search::Literal(search.to_string())
        }))
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            Search::Literal(needle) => text.contains(needle.as_str()),
            Search::Pattern(regex) => regex.is_match(text),
        }
    }
}

#[derive(Deserialize)]
struct MessageAttribute<'a> {
    #[serde(borrow)]
    message: Cow<'a, str>,
}

/// The `message` attribute of a JSON envelope, or the whole text.
#[must_use]
pub fn message_text(record: &OutputRecord) -> Cow<'_, str> {
    match serde_json::from_str::<MessageAttribute>(&record.message) {
        Ok(attribute) => attribute.message,
        Err(_) => Cow::Borrowed(&record.message),
    }
}

/// Reads every event of `destination` in the filter's time window, merges
/// split records and applies the search and limit.
pub async fn read_events(
    transport: &dyn Transport,
    destination: &Destination,
    filter: &QueryFilter,
) -> Result<Vec<OutputRecord>, QueryError> {
    let search = Search::compile(filter)?;

    let mut request = QueryRequest {
        group: destination.group.clone(),
        stream: destination.stream.clone(),
        start_time: filter.start,
        end_time: filter.end,
        limit: Some(DEFAULT_QUERY_LIMIT),
        next_token: None,
    };
    let mut raw = Vec::new();
    let mut pages = 0;
    loop {
        let page = transport.query(&request).await?;
        pages += 1;
        let exhausted = page.events.is_empty();
        raw.extend(page.events);
        match page.next_token {
            Some(token) if !exhausted && request.next_token.as_ref() != Some(&token) => {
                request.next_token = Some(token);
            }
            _ => break,
        }
    }
    debug!(
        "LOGSHIP | Read {} events from {destination} in {pages} pages",
        raw.len()
    );

    let mut events = reassembler::combine(raw);
    if let Some(search) = &search {
        events.retain(|event| search.matches(&message_text(event)));
    }
    if let Some(limit) = filter.limit {
        events.truncate(limit);
    }
    Ok(events)
}

/// `<local time> <message>`, one line per stored event.
#[must_use]
pub fn format_event_line(record: &OutputRecord) -> String {
    let date = Local
        .timestamp_millis_opt(record.timestamp)
        .single()
        .map(|date| date.format(VIEW_DATE_FORMAT).to_string())
        .unwrap_or_else(|| record.timestamp.to_string());
    format!("{date} {}", record.message.trim())
}
