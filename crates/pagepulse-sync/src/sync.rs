//! Sync orchestration: one bounded pipeline per page, fan-in of results.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use pagepulse_store::{PageRecord, PageSyncState, Store};

use crate::config::SyncConfig;
use crate::filter::classify;
use crate::graph::PageApi;
use crate::latency::{derive_latencies, timeline_from_rows};
use crate::limiter::{LimiterStats, RateLimiter};
use crate::tokens::TokenMap;
use crate::SyncError;

/// Result of one page pipeline. A populated `error` means the page's
/// cursor was not advanced and the next run retries the window.
#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub page_id: String,
    pub page_name: String,
    pub conversations_upserted: usize,
    pub conversations_skipped: usize,
    pub messages_upserted: usize,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl PageOutcome {
    fn new(page: &PageRecord) -> Self {
        Self {
            page_id: page.page_id.clone(),
            page_name: page.page_name.clone(),
            conversations_upserted: 0,
            conversations_skipped: 0,
            messages_upserted: 0,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of one run across all pages.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcomes: Vec<PageOutcome>,
    pub pages_without_token: usize,
    pub limiter: LimiterStats,
}

impl RunSummary {
    pub fn total_conversations(&self) -> usize {
        self.outcomes.iter().map(|o| o.conversations_upserted).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.outcomes.iter().map(|o| o.conversations_skipped).sum()
    }

    pub fn total_messages(&self) -> usize {
        self.outcomes.iter().map(|o| o.messages_upserted).sum()
    }

    pub fn failures(&self) -> Vec<&PageOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok()).collect()
    }
}

struct PagePlan {
    page: PageRecord,
    token: String,
    since: DateTime<Utc>,
}

/// Drives incremental sync across every configured page.
pub struct SyncEngine {
    store: Store,
    api: Arc<dyn PageApi>,
    tokens: TokenMap,
    limiter: Arc<RateLimiter>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        api: Arc<dyn PageApi>,
        tokens: TokenMap,
        limiter: Arc<RateLimiter>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            api,
            tokens,
            limiter,
            config,
        }
    }

    /// Run one incremental sync pass over all pages.
    ///
    /// Pages without a resolvable token are skipped pre-flight. Pipelines
    /// run concurrently up to `max_workers`; each failure is isolated to
    /// its page. Cursors advance only for pages that completed cleanly.
    pub async fn run(&self) -> Result<RunSummary> {
        let pages = self.store.list_pages().await?;
        info!("starting sync for {} pages ({} tokens loaded)", pages.len(), self.tokens.len());

        let mut plans = Vec::new();
        let mut pages_without_token = 0usize;

        for page in pages {
            let Some(token) = self.tokens.resolve(&page.page_name) else {
                // Pre-flight skip, never a pipeline failure.
                info!("{}, skipping", SyncError::Credential(page.page_name.clone()));
                pages_without_token += 1;
                continue;
            };
            let has_cursor = self.store.get_sync_state(&page.page_id).await?.is_some();
            let days = self.config.lookback_days(has_cursor);
            info!(
                "page '{}': {} sync, fetching {} days",
                page.page_name,
                if has_cursor { "incremental" } else { "first" },
                days
            );
            plans.push(PagePlan {
                page,
                token: token.to_string(),
                since: Utc::now() - Duration::days(days),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut tasks = JoinSet::new();

        for plan in plans {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let api = self.api.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                sync_page(&store, api.as_ref(), &plan).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("page task panicked: {}", e);
                    continue;
                }
            };

            match &outcome.error {
                None => {
                    info!(
                        "[ok] {}: {} convos ({} skipped), {} msgs",
                        outcome.page_name,
                        outcome.conversations_upserted,
                        outcome.conversations_skipped,
                        outcome.messages_upserted
                    );
                    self.store
                        .set_sync_state(&PageSyncState {
                            page_id: outcome.page_id.clone(),
                            last_sync_time: outcome.completed_at,
                            conversations_last_run: outcome.conversations_upserted as i64,
                            messages_last_run: outcome.messages_upserted as i64,
                        })
                        .await?;
                }
                Some(error) => {
                    warn!("[err] {}: {}", outcome.page_name, error);
                }
            }
            outcomes.push(outcome);
        }

        let summary = RunSummary {
            outcomes,
            pages_without_token,
            limiter: self.limiter.stats(),
        };
        info!(
            "sync complete: {} conversations, {} messages, {} skipped, {} api calls ({:.1}/min)",
            summary.total_conversations(),
            summary.total_skipped(),
            summary.total_messages(),
            summary.limiter.calls,
            summary.limiter.calls_per_minute
        );
        for failed in summary.failures() {
            warn!("failed page '{}': {:?}", failed.page_name, failed.error);
        }

        Ok(summary)
    }
}

/// Maintenance mode: recompute response latency for every stored
/// conversation. Storage-only; the sync pipeline and the platform API are
/// not involved.
pub async fn recalculate_all_latencies(store: &Store) -> Result<usize> {
    let conversation_ids = store.all_conversation_ids().await?;
    info!("recalculating latency for {} conversations", conversation_ids.len());

    let mut processed = 0usize;
    for conversation_id in &conversation_ids {
        refresh_latency(store, conversation_id).await?;
        processed += 1;
        if processed % 1000 == 0 {
            info!("  processed {}/{} conversations", processed, conversation_ids.len());
        }
    }

    info!("latency recalculation done: {} conversations", processed);
    Ok(processed)
}

/// One page's pipeline: fetch conversations, classify, upsert metadata,
/// conditionally fetch and upsert messages, derive latency.
async fn sync_page(store: &Store, api: &dyn PageApi, plan: &PagePlan) -> PageOutcome {
    let mut outcome = PageOutcome::new(&plan.page);
    let page_id = plan.page.page_id.as_str();

    let conversations = match api
        .fetch_conversations(page_id, &plan.token, plan.since)
        .await
    {
        Ok(conversations) => conversations,
        Err(e) => {
            outcome.error = Some(e.to_string());
            outcome.completed_at = Utc::now();
            return outcome;
        }
    };

    if conversations.is_empty() {
        outcome.completed_at = Utc::now();
        return outcome;
    }

    let watermarks = match store.conversation_watermarks(page_id).await {
        Ok(watermarks) => watermarks,
        Err(e) => {
            outcome.error = Some(SyncError::Persistence(format!("{:#}", e)).to_string());
            outcome.completed_at = Utc::now();
            return outcome;
        }
    };

    let mut to_fetch = Vec::new();
    for conv in &conversations {
        let stored = watermarks.get(&conv.id).map(|s| s.as_str());
        if classify(conv.updated_time.as_deref(), stored).needs_fetch() {
            to_fetch.push(conv.id.clone());
        } else {
            outcome.conversations_skipped += 1;
        }
    }

    // Metadata is upserted for every fetched conversation, independent of
    // the message-fetch skip decision.
    let records: Vec<_> = conversations.iter().map(|c| c.to_record(page_id)).collect();
    match store.upsert_conversations(&records).await {
        Ok(count) => outcome.conversations_upserted = count,
        Err(e) => {
            // Batch rolled back as a unit; zero rows written, keep going.
            warn!(
                "conversation batch failed for page '{}': {}",
                plan.page.page_name,
                SyncError::Persistence(format!("{:#}", e))
            );
        }
    }

    for conversation_id in &to_fetch {
        let messages = api
            .fetch_messages(conversation_id, &plan.token, plan.since)
            .await;
        if messages.is_empty() {
            continue;
        }

        let records: Vec<_> = messages
            .iter()
            .map(|m| m.to_record(page_id, conversation_id))
            .collect();
        match store.upsert_messages(&records).await {
            Ok(count) => {
                outcome.messages_upserted += count;
                if let Err(e) = refresh_latency(store, conversation_id).await {
                    warn!(
                        "latency derivation failed for conversation {}: {:#}",
                        conversation_id, e
                    );
                }
            }
            Err(e) => {
                warn!(
                    "message batch failed for conversation {}: {}",
                    conversation_id,
                    SyncError::Persistence(format!("{:#}", e))
                );
            }
        }
    }

    outcome.completed_at = Utc::now();
    outcome
}

/// Re-derive and persist response latencies for one conversation.
async fn refresh_latency(store: &Store, conversation_id: &str) -> Result<()> {
    let rows = store.message_timeline(conversation_id).await?;
    let timeline = timeline_from_rows(&rows);
    let updates = derive_latencies(&timeline);
    store.apply_latencies(&updates).await
}
