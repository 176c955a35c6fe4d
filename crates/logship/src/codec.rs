// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-bounded encoding of records into wire units.
//!
//! A record whose rendering fits in `max_size` bytes becomes exactly one
//! unit. An oversized record is either truncated (one unit whose tail reports
//! the original size) or split: the payload is cut into `total` contiguous
//! pieces, each piece becomes a copy of the record tagged with a
//! `[part/total]` context marker, and every copy is rendered on its own so it
//! carries a complete envelope.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::warn;

use crate::constants::{CONTEXT_KEY_PART, MIN_MESSAGE_SIZE};
use crate::record::Record;
use crate::renderer::MessageRenderer;

/// Marker left on the first fragment once a group has been recombined.
pub const COMBINED_MARKER: &str = "[1]";

#[allow(clippy::expect_used)]
fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\[(\d+)/(\d+)\]").expect("marker regex is valid"))
}

/// `part=[i/n]` starting at an entry boundary.
#[allow(clippy::expect_used)]
fn part_entry_regex() -> &'static Regex {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    ENTRY.get_or_init(|| {
        Regex::new(&format!(
            r"(?:^|\W){}=(\[(\d+)/(\d+)\])",
            regex::escape(CONTEXT_KEY_PART)
        ))
        .expect("part entry regex is valid")
    })
}

/// `[part/total]` tag identifying one piece of a split record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentMarker {
    part: usize,
    total: usize,
}

impl FragmentMarker {
    /// Returns `None` unless `1 <= part <= total`.
    #[must_use]
    pub fn new(part: usize, total: usize) -> Option<Self> {
        (part >= 1 && part <= total).then_some(FragmentMarker { part, total })
    }

    #[must_use]
    pub fn part(&self) -> usize {
        self.part
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// First well-formed marker in `text`, with the byte range it occupies.
    #[must_use]
    pub fn find(text: &str) -> Option<(FragmentMarker, Range<usize>)> {
        marker_regex().captures_iter(text).find_map(|captures| {
            let whole = captures.get(0)?;
            let part = captures.get(1)?.as_str().parse().ok()?;
            let total = captures.get(2)?.as_str().parse().ok()?;
            FragmentMarker::new(part, total).map(|marker| (marker, whole.range()))
        })
    }

    /// The marker held by the `part` entry of a rendered context, with the
    /// byte range it occupies. `context` is either the marker alone, as
    /// rendered by `{context: part}`, or a list of `key=value` entries, as
    /// rendered by `{context}`. Marker-like values of other entries are
    /// ignored.
    #[must_use]
    pub fn find_in_context(context: &str) -> Option<(FragmentMarker, Range<usize>)> {
        let trimmed = context.trim();
        if let Some((marker, range)) = FragmentMarker::find(trimmed) {
            if range == (0..trimmed.len()) {
                let offset = context.len() - context.trim_start().len();
                return Some((marker, offset..offset + trimmed.len()));
            }
        }

        part_entry_regex().captures_iter(context).find_map(|captures| {
            let whole = captures.get(1)?;
            let part = captures.get(2)?.as_str().parse().ok()?;
            let total = captures.get(3)?.as_str().parse().ok()?;
            FragmentMarker::new(part, total).map(|marker| (marker, whole.range()))
        })
    }
}

impl fmt::Display for FragmentMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.part, self.total)
    }
}

/// One transmittable rendering of a record or of one of its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireUnit {
    pub message: String,
    pub marker: Option<FragmentMarker>,
}

#[derive(Clone)]
pub struct Codec {
    renderer: Arc<dyn MessageRenderer>,
    max_size: usize,
    split: bool,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("max_size", &self.max_size)
            .field("split", &self.split)
            .finish_non_exhaustive()
    }
}

impl Codec {
    /// `max_size` below [`MIN_MESSAGE_SIZE`] is raised to it.
    #[must_use]
    pub fn new(renderer: Arc<dyn MessageRenderer>, max_size: usize, split: bool) -> Self {
        let max_size = if max_size < MIN_MESSAGE_SIZE {
            warn!(
                "LOGSHIP | Maximum message size {max_size} is below the minimum, using {MIN_MESSAGE_SIZE}"
            );
            MIN_MESSAGE_SIZE
        } else {
            max_size
        };
        Codec {
            renderer,
            max_size,
            split,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn splits(&self) -> bool {
        self.split
    }

    /// Encodes `record`. The record is rendered once up front; fragments
    /// are rendered lazily as the returned sequence is consumed.
    #[must_use]
    pub fn encode<'a>(&'a self, record: &'a Record) -> Encoded<'a> {
        let rendered = self.renderer.render(record);
        if rendered.len() <= self.max_size {
            return Encoded::Single(Some(WireUnit {
                message: rendered,
                marker: None,
            }));
        }

        if self.split {
            Encoded::Split(Fragments {
                record,
                renderer: self.renderer.as_ref(),
                ranges: self.fragment_ranges(record),
                next: 0,
            })
        } else {
            Encoded::Single(Some(WireUnit {
                message: truncate(rendered, self.max_size),
                marker: None,
            }))
        }
    }

    /// Payload ranges of the fragments of `record`, sized so that each
    /// rendered fragment, envelope and marker included, fits in `max_size`.
    fn fragment_ranges(&self, record: &Record) -> Vec<Range<usize>> {
        // widest marker the current guess of `total` can produce
        let mut widest: usize = 9;
        loop {
            let empty = record.fragment("", CONTEXT_KEY_PART, format!("[{widest}/{widest}]"));
            let envelope = self.renderer.render(&empty).len();
            let budget = if envelope < self.max_size {
                self.max_size - envelope
            } else {
                warn!(
                    "LOGSHIP | Envelope of {envelope} bytes leaves no room for the payload, fragments will exceed {}",
                    self.max_size
                );
                self.max_size
            };

            let ranges = chunk_ranges(&record.message, budget, |c| {
                self.renderer.payload_width(c)
            });
            if ranges.len() <= widest {
                return ranges;
            }
            widest = widest.saturating_mul(10).saturating_add(9);
        }
    }
}

/// Result of [`Codec::encode`]: a finite sequence of wire units in part
/// order. Cloning before consumption gives an independent replay.
#[derive(Clone)]
pub enum Encoded<'a> {
    Single(Option<WireUnit>),
    Split(Fragments<'a>),
}

impl Encoded<'_> {
    #[must_use]
    pub fn is_split(&self) -> bool {
        matches!(self, Encoded::Split(_))
    }
}

impl Iterator for Encoded<'_> {
    type Item = WireUnit;

    fn next(&mut self) -> Option<WireUnit> {
        match self {
            Encoded::Single(unit) => unit.take(),
            Encoded::Split(fragments) => fragments.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Encoded::Single(unit) => {
                let n = usize::from(unit.is_some());
                (n, Some(n))
            }
            Encoded::Split(fragments) => fragments.size_hint(),
        }
    }
}

impl ExactSizeIterator for Encoded<'_> {}

/// The pieces of an oversized record.
#[derive(Clone)]
pub struct Fragments<'a> {
    record: &'a Record,
    renderer: &'a dyn MessageRenderer,
    ranges: Vec<Range<usize>>,
    next: usize,
}

impl Fragments<'_> {
    #[must_use]
    pub fn total(&self) -> usize {
        self.ranges.len()
    }
}

impl Iterator for Fragments<'_> {
    type Item = WireUnit;

    fn next(&mut self) -> Option<WireUnit> {
        let range = self.ranges.get(self.next)?.clone();
        self.next += 1;

        let total = self.ranges.len();
        let marker = FragmentMarker {
            part: self.next,
            total,
        };
        let piece = self
            .record
            .fragment(&self.record.message[range], CONTEXT_KEY_PART, marker.to_string());
        Some(WireUnit {
            message: self.renderer.render(&piece),
            marker: Some(marker),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ranges.len() - self.next;
        (remaining, Some(remaining))
    }
}

/// Contiguous byte ranges of `text` whose characters weigh at most `budget`
/// in total, cut on character boundaries. A character heavier than `budget`
/// gets a range of its own. Always returns at least one range.
fn chunk_ranges(text: &str, budget: usize, width: impl Fn(char) -> usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (offset, c) in text.char_indices() {
        let w = width(c);
        if offset > start && used + w > budget {
            ranges.push(start..offset);
            start = offset;
            used = 0;
        }
        used += w;
    }
    if start < text.len() || ranges.is_empty() {
        ranges.push(start..text.len());
    }
    ranges
}

/// Cuts `rendered` so that it, plus a suffix reporting its original size,
/// fits in `max_size` bytes.
fn truncate(mut rendered: String, max_size: usize) -> String {
    let suffix = format!("... (total message size was {})", rendered.len());
    let mut keep = max_size.saturating_sub(suffix.len());
    while !rendered.is_char_boundary(keep) {
        keep -= 1;
    }
    rendered.truncate(keep);
    rendered.push_str(&suffix);
    rendered
}
