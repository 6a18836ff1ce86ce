//! Incremental synchronization engine for paged conversational data.
//!
//! One bounded pipeline per page: fetch conversations, filter by watermark,
//! conditionally fetch messages, upsert, derive response latency. Failures
//! are isolated per page and surface only in the run summary.

pub mod config;
pub mod filter;
pub mod graph;
pub mod latency;
pub mod limiter;
pub mod sync;
pub mod time;
pub mod tokens;

pub use config::SyncConfig;
pub use filter::{classify, ConversationChange};
pub use graph::{ApiConversation, ApiMessage, GraphClient, PageApi};
pub use latency::{derive_latencies, timeline_from_rows, TimelineEntry};
pub use limiter::{LimiterStats, RateLimiter};
pub use sync::{recalculate_all_latencies, PageOutcome, RunSummary, SyncEngine};
pub use tokens::TokenMap;

/// Failure taxonomy for one page pipeline.
///
/// `Credential` is a pre-flight skip, never a run failure. `Transport` and
/// `Api` surface at the conversation level only; message-level fetch
/// failures are swallowed into a partial list by design. `Persistence`
/// means a batch was rolled back as a unit.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no credential resolved for page '{0}'")]
    Credential(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}
