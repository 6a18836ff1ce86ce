//! Change detection: decide per conversation whether messages need
//! re-fetching this pass.
//!
//! The decision gates only the message fetch. Conversation metadata is
//! upserted unconditionally regardless of the outcome here.

use crate::time::parse_graph_time;

/// Classification of a freshly fetched conversation against its stored
/// watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationChange {
    /// Never seen before; fetch messages.
    New,
    /// Watermark moved forward, or could not be compared; fetch messages.
    Changed,
    /// Watermark did not move; skip the message fetch.
    Unchanged,
}

impl ConversationChange {
    pub fn needs_fetch(self) -> bool {
        !matches!(self, ConversationChange::Unchanged)
    }
}

/// Compare a fetched `updated_time` against the stored one.
///
/// Fail-open: any missing or unparseable timestamp classifies as `Changed`,
/// so a conversation that might hold new messages is never silently
/// dropped. `Unchanged` requires both sides to parse and the fetched value
/// to not be strictly newer.
pub fn classify(fetched: Option<&str>, stored: Option<&str>) -> ConversationChange {
    let Some(stored_raw) = stored else {
        return ConversationChange::New;
    };
    let Some(fetched_raw) = fetched else {
        return ConversationChange::Changed;
    };
    match (parse_graph_time(fetched_raw), parse_graph_time(stored_raw)) {
        (Some(fetched_at), Some(stored_at)) if fetched_at > stored_at => {
            ConversationChange::Changed
        }
        (Some(_), Some(_)) => ConversationChange::Unchanged,
        _ => ConversationChange::Changed,
    }
}
