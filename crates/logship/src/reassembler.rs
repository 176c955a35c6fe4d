// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stitches split records back together.
//!
//! Fragments of one record share their delivery timestamp and carry a
//! `[part/total]` marker as the `part` entry of the envelope's `context`
//! attribute. For every
//! timestamp whose parts `1..=total` are all present, the `message` values
//! are concatenated in part order and written into part 1's envelope, whose
//! marker becomes `[1]`. Everything else is passed through untouched.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use serde_json::value::RawValue;
use tracing::{debug, trace, warn};

use crate::codec::{FragmentMarker, COMBINED_MARKER};
use crate::constants::{JSON_CONTEXT_ATTRIBUTE, JSON_MESSAGE_ATTRIBUTE};
use crate::transport::OutputRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombineStats {
    /// Groups merged into a single record.
    pub combined: usize,
    /// Groups passed through because a part was missing or unreadable.
    pub incomplete: usize,
    /// Fragments whose part index was already seen in their group.
    pub duplicate_parts: usize,
}

/// Location of the rewritable attributes inside a stored JSON envelope.
#[derive(Debug)]
struct Envelope {
    message_span: Range<usize>,
    message: String,
    context_span: Range<usize>,
    context: String,
    marker: FragmentMarker,
    marker_span: Range<usize>,
}

impl Envelope {
    fn parse(text: &str) -> Option<Envelope> {
        let attributes: HashMap<String, &RawValue> = serde_json::from_str(text).ok()?;
        let message_raw = attributes.get(JSON_MESSAGE_ATTRIBUTE)?;
        let context_raw = attributes.get(JSON_CONTEXT_ATTRIBUTE)?;

        let message: String = serde_json::from_str(message_raw.get()).ok()?;
        let context: String = serde_json::from_str(context_raw.get()).ok()?;
        let (marker, marker_span) = FragmentMarker::find_in_context(&context)?;

        Some(Envelope {
            message_span: span_of(text, message_raw.get())?,
            message,
            context_span: span_of(text, context_raw.get())?,
            context,
            marker,
            marker_span,
        })
    }

    /// `text` with the message value replaced by `message` and the marker
    /// replaced by [`COMBINED_MARKER`].
    fn rewrite(&self, text: &str, message: &str) -> Option<String> {
        let mut context = self.context.clone();
        context.replace_range(self.marker_span.clone(), COMBINED_MARKER);

        let mut edits = [
            (self.message_span.clone(), serde_json::to_string(message).ok()?),
            (self.context_span.clone(), serde_json::to_string(&context).ok()?),
        ];
        edits.sort_by_key(|(span, _)| Reverse(span.start));

        let mut out = text.to_string();
        for (span, replacement) in edits {
            out.replace_range(span, &replacement);
        }
        Some(out)
    }
}

/// Byte range of `part`, a slice borrowed from `whole`.
fn span_of(whole: &str, part: &str) -> Option<Range<usize>> {
    let start = (part.as_ptr() as usize).checked_sub(whole.as_ptr() as usize)?;
    let end = start + part.len();
    (end <= whole.len()).then_some(start..end)
}

#[derive(Debug)]
struct Fragment {
    record: OutputRecord,
    marker: FragmentMarker,
    envelope: Option<Envelope>,
}

impl Fragment {
    /// Hands `record` back when it is not part of a split group.
    fn classify(record: OutputRecord) -> Result<Fragment, OutputRecord> {
        match Envelope::parse(&record.message) {
            Some(envelope) => Ok(Fragment {
                record,
                marker: envelope.marker,
                envelope: Some(envelope),
            }),
            None if is_json_object(&record.message) => Err(record),
            // not an envelope we can read: fall back to the raw text
            None => match FragmentMarker::find_in_context(&record.message) {
                Some((marker, _)) => Ok(Fragment {
                    record,
                    marker,
                    envelope: None,
                }),
                None => Err(record),
            },
        }
    }
}

fn is_json_object(text: &str) -> bool {
    serde_json::from_str::<HashMap<String, &RawValue>>(text).is_ok()
}

/// Merges complete fragment groups in `records` and returns the result
/// ordered by timestamp, most recent first.
#[must_use]
pub fn combine(records: Vec<OutputRecord>) -> Vec<OutputRecord> {
    combine_with_stats(records).0
}

pub fn combine_with_stats(records: Vec<OutputRecord>) -> (Vec<OutputRecord>, CombineStats) {
    let mut stats = CombineStats::default();
    let mut output = Vec::with_capacity(records.len());
    let mut groups: BTreeMap<i64, Vec<Fragment>> = BTreeMap::new();

    for record in records {
        match Fragment::classify(record) {
            Ok(fragment) => groups
                .entry(fragment.record.timestamp)
                .or_default()
                .push(fragment),
            Err(record) => output.push(record),
        }
    }
    trace!(
        "LOGSHIP | {} unmarked records, {} fragment groups",
        output.len(),
        groups.len()
    );

    for (timestamp, fragments) in groups {
        output.extend(combine_group(timestamp, fragments, &mut stats));
    }

    output.sort_by_key(|record| Reverse(record.timestamp));
    debug!(
        "LOGSHIP | Combined {} groups, {} incomplete, {} duplicate parts",
        stats.combined, stats.incomplete, stats.duplicate_parts
    );
    (output, stats)
}

fn combine_group(
    timestamp: i64,
    fragments: Vec<Fragment>,
    stats: &mut CombineStats,
) -> Vec<OutputRecord> {
    // part -> index into `fragments`, last one wins
    let mut parts: BTreeMap<usize, usize> = BTreeMap::new();
    for (index, fragment) in fragments.iter().enumerate() {
        if parts.insert(fragment.marker.part(), index).is_some() {
            stats.duplicate_parts += 1;
            warn!(
                "LOGSHIP | Duplicate part {} in fragment group {timestamp}",
                fragment.marker
            );
        }
    }

    match merge(&fragments, &parts) {
        Some(record) => {
            stats.combined += 1;
            vec![record]
        }
        None => {
            stats.incomplete += 1;
            debug!(
                "LOGSHIP | Fragment group {timestamp} is incomplete ({} fragments), passing through",
                fragments.len()
            );
            fragments.into_iter().map(|f| f.record).collect()
        }
    }
}

/// Part 1 rewritten to hold the whole message, if every part `1..=total`
/// is present and readable.
fn merge(fragments: &[Fragment], parts: &BTreeMap<usize, usize>) -> Option<OutputRecord> {
    let first = fragments.get(*parts.get(&1)?)?;
    let total = first.marker.total();
    if parts.len() != total || !parts.keys().copied().eq(1..=total) {
        return None;
    }

    let mut message = String::new();
    for &index in parts.values() {
        message.push_str(&fragments.get(index)?.envelope.as_ref()?.message);
    }
    Some(OutputRecord {
        timestamp: first.record.timestamp,
        message: first
            .envelope
            .as_ref()?
            .rewrite(&first.record.message, &message)?,
        ingestion_time: first.record.ingestion_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::pattern::Pattern;
    use crate::record::{Level, Record};
    use crate::renderer::{JsonLayout, JsonRenderer};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn envelope(message: &str, context: &str) -> String {
        format!(
            "{{\"level\": \"INFO\", \"message\": {}, \"context\": {}}}\n",
            serde_json::to_string(message).unwrap(),
            serde_json::to_string(context).unwrap()
        )
    }

    fn fragment(timestamp: i64, message: &str, part: usize, total: usize) -> OutputRecord {
        OutputRecord::new(
            timestamp,
            envelope(message, &format!("user=alice, part=[{part}/{total}]")),
        )
    }

    fn attribute(record: &OutputRecord, name: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(&record.message).unwrap();
        value[name].as_str().unwrap().to_string()
    }

    #[test]
    fn test_complete_group_is_combined() {
        let records = vec![
            fragment(10, "world", 2, 2),
            OutputRecord::new(5, envelope("unrelated", "")),
            fragment(10, "hello ", 1, 2),
        ];
        let (combined, stats) = combine_with_stats(records);

        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].timestamp, 10);
        assert_eq!(attribute(&combined[0], "message"), "hello world");
        assert_eq!(attribute(&combined[0], "context"), "user=alice, part=[1]");
        assert_eq!(attribute(&combined[0], "level"), "INFO");
        assert_eq!(combined[1].timestamp, 5);
        assert_eq!(
            stats,
            CombineStats {
                combined: 1,
                incomplete: 0,
                duplicate_parts: 0
            }
        );
    }

    #[test]
    fn test_incomplete_group_passes_through() {
        let records = vec![fragment(10, "a", 1, 3), fragment(10, "c", 3, 3)];
        let (combined, stats) = combine_with_stats(records.clone());

        assert_eq!(combined.len(), 2);
        for record in &records {
            assert!(combined.contains(record));
        }
        assert_eq!(stats.incomplete, 1);
    }

    #[test]
    fn test_group_without_first_part_passes_through() {
        let records = vec![fragment(10, "b", 2, 2), fragment(10, "c", 2, 2)];
        let (combined, stats) = combine_with_stats(records);
        assert_eq!(combined.len(), 2);
        assert_eq!(stats.duplicate_parts, 1);
        assert_eq!(stats.incomplete, 1);
    }

    #[test]
    fn test_duplicate_part_last_one_wins() {
        let records = vec![
            fragment(10, "first ", 1, 2),
            fragment(10, "stale", 2, 2),
            fragment(10, "tail", 2, 2),
        ];
        let (combined, stats) = combine_with_stats(records);
        assert_eq!(combined.len(), 1);
        assert_eq!(attribute(&combined[0], "message"), "first tail");
        assert_eq!(stats.duplicate_parts, 1);
    }

    #[test]
    fn test_mismatched_totals_pass_through() {
        // as many parts as part 1 announces, but not parts 1 and 2
        let records = vec![fragment(10, "a", 1, 2), fragment(10, "b", 3, 3)];
        let (combined, stats) = combine_with_stats(records);
        assert_eq!(combined.len(), 2);
        assert_eq!(stats.incomplete, 1);
    }

    #[test]
    fn test_unparseable_fragments_pass_through_unchanged() {
        let records = vec![
            OutputRecord::new(10, "plain text part=[1/2] hello"),
            OutputRecord::new(10, "plain text part=[2/2] world"),
        ];
        let (combined, stats) = combine_with_stats(records.clone());
        assert_eq!(combined.len(), 2);
        assert!(combined.contains(&records[0]));
        assert!(combined.contains(&records[1]));
        assert_eq!(stats.incomplete, 1);
    }

    #[test]
    fn test_marker_inside_message_text_is_not_a_fragment() {
        let record = OutputRecord::new(10, envelope("see [1/2]", "user=alice"));
        let (combined, stats) = combine_with_stats(vec![record.clone()]);
        assert_eq!(combined, vec![record]);
        assert_eq!(stats, CombineStats::default());
    }

    #[test]
    fn test_marker_like_context_entry_is_not_a_fragment() {
        let record = OutputRecord::new(10, envelope("short", "ref=[1/1]"));
        let (combined, stats) = combine_with_stats(vec![record.clone()]);
        assert_eq!(combined, vec![record]);
        assert_eq!(stats, CombineStats::default());
    }

    #[test]
    fn test_marker_like_entry_next_to_part_is_ignored() {
        let fields = vec![
            ("message".to_string(), Pattern::parse("{message}")),
            ("context".to_string(), Pattern::parse("{context}")),
        ];
        let codec = Codec::new(
            Arc::new(JsonRenderer::new(fields, JsonLayout::Compact)),
            100,
            true,
        );
        let message = format!("{}{}{}", "a".repeat(100), "b".repeat(100), "c".repeat(50));
        let record = Record::new(Level::Info, message.clone()).with_context("batch", "[1/1]");

        let stored = split_and_store(&codec, &record, 42);
        assert!(stored.len() > 1);
        let (combined, stats) = combine_with_stats(stored);

        assert_eq!(combined.len(), 1);
        assert_eq!(attribute(&combined[0], "message"), message);
        assert_eq!(attribute(&combined[0], "context"), "batch=[1/1], part=[1]");
        assert_eq!(
            stats,
            CombineStats {
                combined: 1,
                incomplete: 0,
                duplicate_parts: 0
            }
        );
        assert_eq!(combine(combined.clone()), combined);
    }

    #[test]
    fn test_context_holding_only_the_marker() {
        let records = vec![
            OutputRecord::new(10, envelope("left ", "[1/2]")),
            OutputRecord::new(10, envelope("right", "[2/2]")),
        ];
        let combined = combine(records);
        assert_eq!(combined.len(), 1);
        assert_eq!(attribute(&combined[0], "message"), "left right");
        assert_eq!(attribute(&combined[0], "context"), "[1]");
    }

    #[test]
    fn test_output_is_most_recent_first() {
        let records = vec![
            OutputRecord::new(1, "a"),
            OutputRecord::new(3, "c"),
            OutputRecord::new(2, "b"),
        ];
        let timestamps: Vec<_> = combine(records).iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![3, 2, 1]);
    }

    #[test]
    fn test_combine_is_idempotent() {
        let records = vec![
            fragment(10, "x", 1, 2),
            fragment(10, "y", 2, 2),
            fragment(20, "z", 1, 3),
            OutputRecord::new(15, "plain"),
        ];
        let once = combine(records);
        let twice = combine(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_pretty_envelope_is_rewritten_in_place() {
        let text = |message: &str, part: &str| {
            format!("\n\t{{\n\t\t\"message\": \"{message}\",\n\t\t\"context\": \"part={part}\"\n\t}}")
        };
        let records = vec![
            OutputRecord::new(7, text("ab", "[1/2]")),
            OutputRecord::new(7, text("cd", "[2/2]")),
        ];
        let combined = combine(records);
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].message, text("abcd", "[1]"));
    }

    fn split_and_store(codec: &Codec, record: &Record, timestamp: i64) -> Vec<OutputRecord> {
        codec
            .encode(record)
            .map(|unit| OutputRecord::new(timestamp, unit.message))
            .collect()
    }

    proptest! {
        #[test]
        fn split_then_combine_restores_message(
            message in "[a-zA-Z0-9 \\\\\"\t\n\u{1}é€😀]{0,600}",
            pretty in any::<bool>(),
        ) {
            let layout = if pretty { JsonLayout::Pretty } else { JsonLayout::Compact };
            let fields = vec![
                ("message".to_string(), Pattern::parse("{message}")),
                ("context".to_string(), Pattern::parse("{context}")),
            ];
            let codec = Codec::new(Arc::new(JsonRenderer::new(fields, layout)), 64, true);
            let record = Record::new(Level::Info, message.clone()).with_context("k", "v");

            let mut stored = split_and_store(&codec, &record, 42);
            stored.reverse();
            let combined = combine(stored);

            prop_assert_eq!(combined.len(), 1);
            prop_assert_eq!(attribute(&combined[0], "message"), message);
        }
    }
}
