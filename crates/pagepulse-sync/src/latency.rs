//! Response-latency derivation.
//!
//! One ascending-time pass per conversation. An inbound message sets the
//! reply anchor; an outbound message with an anchor records the elapsed
//! seconds when strictly positive and leaves the anchor in place. The
//! anchor is never cleared by an outbound message, so consecutive page
//! replies all measure against the same inbound message. That is the
//! engine's policy, not an accident.
//!
//! The pass is deterministic and idempotent: re-running over the same
//! stored messages always yields the same latencies.

use chrono::{DateTime, Utc};
use tracing::debug;

use pagepulse_store::MessageTiming;

use crate::time::parse_graph_time;

/// A parsed, chronologically ordered message used by the deriver.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message_id: String,
    pub at: DateTime<Utc>,
    pub from_page: bool,
}

/// Parse stored timings into timeline entries, dropping messages whose
/// timestamp is missing or unparseable, and re-sorting on the parsed
/// instant. The store orders rows by the raw timestamp string, which
/// diverges from chronological order once offsets are mixed.
pub fn timeline_from_rows(rows: &[MessageTiming]) -> Vec<TimelineEntry> {
    let mut timeline: Vec<TimelineEntry> = rows
        .iter()
        .filter_map(|row| {
            let raw = row.message_time.as_deref()?;
            match parse_graph_time(raw) {
                Some(at) => Some(TimelineEntry {
                    message_id: row.message_id.clone(),
                    at,
                    from_page: row.from_page,
                }),
                None => {
                    debug!(
                        "skipping message {} with unparseable time '{}'",
                        row.message_id, raw
                    );
                    None
                }
            }
        })
        .collect();
    timeline.sort_by_key(|entry| entry.at);
    timeline
}

/// Compute `(message_id, seconds)` latency updates for every outbound
/// message that has a strictly earlier inbound anchor.
pub fn derive_latencies(timeline: &[TimelineEntry]) -> Vec<(String, f64)> {
    if timeline.len() < 2 {
        return Vec::new();
    }

    let mut last_inbound: Option<DateTime<Utc>> = None;
    let mut updates = Vec::new();

    for entry in timeline {
        if !entry.from_page {
            last_inbound = Some(entry.at);
        } else if let Some(inbound_at) = last_inbound {
            let seconds = (entry.at - inbound_at).num_milliseconds() as f64 / 1000.0;
            if seconds > 0.0 {
                updates.push((entry.message_id.clone(), seconds));
            }
        }
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, offset_secs: i64, from_page: bool) -> TimelineEntry {
        TimelineEntry {
            message_id: id.to_string(),
            at: Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap(),
            from_page,
        }
    }

    #[test]
    fn test_latency_vector() {
        // [in@0, out@5, out@9, in@20, out@25] -> [none, 5, 9, none, 5]
        let timeline = vec![
            entry("m1", 0, false),
            entry("m2", 5, true),
            entry("m3", 9, true),
            entry("m4", 20, false),
            entry("m5", 25, true),
        ];

        let updates = derive_latencies(&timeline);
        assert_eq!(
            updates,
            vec![
                ("m2".to_string(), 5.0),
                ("m3".to_string(), 9.0),
                ("m5".to_string(), 5.0),
            ]
        );
    }

    #[test]
    fn test_consecutive_replies_share_one_anchor() {
        let timeline = vec![
            entry("in", 0, false),
            entry("r1", 10, true),
            entry("r2", 30, true),
            entry("r3", 60, true),
        ];

        let updates = derive_latencies(&timeline);
        assert_eq!(
            updates,
            vec![
                ("r1".to_string(), 10.0),
                ("r2".to_string(), 30.0),
                ("r3".to_string(), 60.0),
            ]
        );
    }

    #[test]
    fn test_out_of_order_pair_records_nothing() {
        // in@10 followed by out@8: delta is negative, nothing is recorded.
        let timeline = vec![entry("in", 10, false), entry("out", 8, true)];
        assert!(derive_latencies(&timeline).is_empty());
    }

    #[test]
    fn test_outbound_without_anchor_records_nothing() {
        let timeline = vec![entry("out", 0, true), entry("in", 5, false)];
        assert!(derive_latencies(&timeline).is_empty());
    }

    #[test]
    fn test_short_timeline_is_a_noop() {
        assert!(derive_latencies(&[]).is_empty());
        assert!(derive_latencies(&[entry("m1", 0, false)]).is_empty());
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let timeline = vec![entry("in", 0, false), entry("out", 7, true)];
        let first = derive_latencies(&timeline);
        let second = derive_latencies(&timeline);
        assert_eq!(first, second);
    }

    #[test]
    fn test_mixed_offset_rows_order_chronologically() {
        // Raw-string order puts the 11:00+0000 reply before the
        // 18:30+0800 inbound (10:30 UTC); the parsed timeline must not.
        let rows = vec![
            MessageTiming {
                message_id: "out".to_string(),
                message_time: Some("2024-01-15T11:00:00+0000".to_string()),
                from_page: true,
            },
            MessageTiming {
                message_id: "in".to_string(),
                message_time: Some("2024-01-15T18:30:00+0800".to_string()),
                from_page: false,
            },
        ];

        let timeline = timeline_from_rows(&rows);
        let ids: Vec<_> = timeline.iter().map(|t| t.message_id.as_str()).collect();
        assert_eq!(ids, vec!["in", "out"]);

        let updates = derive_latencies(&timeline);
        assert_eq!(updates, vec![("out".to_string(), 1800.0)]);
    }

    #[test]
    fn test_timeline_from_rows_drops_unparseable() {
        let rows = vec![
            MessageTiming {
                message_id: "m1".to_string(),
                message_time: Some("2024-01-15T10:00:00+0000".to_string()),
                from_page: false,
            },
            MessageTiming {
                message_id: "m2".to_string(),
                message_time: Some("garbage".to_string()),
                from_page: true,
            },
            MessageTiming {
                message_id: "m3".to_string(),
                message_time: None,
                from_page: true,
            },
        ];

        let timeline = timeline_from_rows(&rows);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message_id, "m1");
    }
}
