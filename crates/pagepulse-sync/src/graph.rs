//! Paginated Graph API client.
//!
//! Both endpoints return `{data: [...], paging: {next}}` envelopes and
//! report API errors as `{error: {message}}` inside an otherwise-successful
//! response. The fetchers follow `paging.next` to exhaustion, paying one
//! rate-limiter permit per page turn.
//!
//! The two fetchers deliberately fail differently: a conversation-list
//! failure is the page pipeline's failure and surfaces as an error, while a
//! message-list failure is swallowed into whatever was collected so one bad
//! conversation cannot sink the rest of the page.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use pagepulse_store::{ConversationRecord, MessageRecord};

use crate::limiter::RateLimiter;
use crate::SyncError;

/// Seam between the orchestrator and the platform.
#[async_trait]
pub trait PageApi: Send + Sync {
    /// Fetch a page's conversation list back to `since`. Transport and
    /// API-reported failures abort the page and surface here.
    async fn fetch_conversations(
        &self,
        page_id: &str,
        token: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiConversation>, SyncError>;

    /// Fetch one conversation's messages back to `since`. Failures yield a
    /// partial or empty list with no error signal.
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        token: &str,
        since: DateTime<Utc>,
    ) -> Vec<ApiMessage>;
}

/// HTTP implementation of [`PageApi`].
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    page_size: usize,
    limiter: Arc<RateLimiter>,
}

impl GraphClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        page_size: usize,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            page_size,
            limiter,
        }
    }

    fn first_page_params(&self, token: &str, fields: &str, since: DateTime<Utc>) -> Vec<(&'static str, String)> {
        vec![
            ("access_token", token.to_string()),
            ("fields", fields.to_string()),
            ("limit", self.page_size.to_string()),
            ("since", since.timestamp().to_string()),
        ]
    }

    async fn get_page<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        params: Option<&[(&'static str, String)]>,
    ) -> Result<Envelope<T>, SyncError> {
        self.limiter.acquire().await;

        let mut request = self.http.get(url);
        if let Some(params) = params {
            request = request.query(params);
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PageApi for GraphClient {
    async fn fetch_conversations(
        &self,
        page_id: &str,
        token: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiConversation>, SyncError> {
        let mut conversations = Vec::new();
        let first_url = format!("{}/{}/conversations", self.base_url, page_id);
        let params = self.first_page_params(token, "id,participants,updated_time,message_count", since);
        let mut next: Option<String> = None;

        loop {
            let envelope: Envelope<ApiConversation> = match &next {
                Some(url) => self.get_page(url, None).await?,
                None => self.get_page(&first_url, Some(&params)).await?,
            };

            if let Some(error) = envelope.error {
                return Err(SyncError::Api(error.describe()));
            }

            conversations.extend(envelope.data);
            next = envelope.paging.and_then(|p| p.next);
            if next.is_none() {
                break;
            }
        }

        Ok(conversations)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        token: &str,
        since: DateTime<Utc>,
    ) -> Vec<ApiMessage> {
        let mut messages = Vec::new();
        let first_url = format!("{}/{}/messages", self.base_url, conversation_id);
        let params = self.first_page_params(token, "id,message,from,created_time", since);
        let mut next: Option<String> = None;

        loop {
            let envelope: Envelope<ApiMessage> = match &next {
                Some(url) => self.get_page(url, None).await,
                None => self.get_page(&first_url, Some(&params)).await,
            }
            .unwrap_or_else(|e| {
                warn!(
                    "message fetch failed for conversation {}, keeping {} collected: {}",
                    conversation_id,
                    messages.len(),
                    e
                );
                Envelope::empty()
            });

            if envelope.error.is_some() {
                // API error mid-pagination: keep what we have.
                break;
            }

            messages.extend(envelope.data);
            next = envelope.paging.and_then(|p| p.next);
            if next.is_none() {
                break;
            }
        }

        messages
    }
}

// --- Graph API response types ---

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    paging: Option<Paging>,
    error: Option<ApiErrorBody>,
}

impl<T> Envelope<T> {
    fn empty() -> Self {
        Self {
            data: Vec::new(),
            paging: None,
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

impl ApiErrorBody {
    fn describe(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConversation {
    pub id: String,
    pub participants: Option<Participants>,
    pub updated_time: Option<String>,
    pub message_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Participants {
    #[serde(default)]
    pub data: Vec<Participant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiMessage {
    pub id: String,
    pub message: Option<String>,
    pub from: Option<Participant>,
    pub created_time: Option<String>,
}

impl ApiConversation {
    /// The non-page participant in the thread, if present.
    fn counterpart(&self, page_id: &str) -> Option<&Participant> {
        self.participants
            .as_ref()?
            .data
            .iter()
            .find(|p| p.id.as_deref() != Some(page_id))
    }

    pub fn to_record(&self, page_id: &str) -> ConversationRecord {
        let counterpart = self.counterpart(page_id);
        ConversationRecord {
            conversation_id: self.id.clone(),
            page_id: page_id.to_string(),
            participant_id: counterpart.and_then(|p| p.id.clone()),
            participant_name: counterpart.and_then(|p| p.name.clone()),
            updated_time: self.updated_time.clone(),
            message_count: self.message_count.unwrap_or(0),
        }
    }
}

impl ApiMessage {
    pub fn to_record(&self, page_id: &str, conversation_id: &str) -> MessageRecord {
        let sender = self.from.as_ref();
        let from_page = sender.and_then(|p| p.id.as_deref()) == Some(page_id);
        MessageRecord {
            message_id: self.id.clone(),
            conversation_id: conversation_id.to_string(),
            page_id: page_id.to_string(),
            sender_id: sender.and_then(|p| p.id.clone()),
            sender_name: sender.and_then(|p| p.name.clone()),
            message_text: self.message.clone().unwrap_or_default(),
            message_time: self.created_time.clone(),
            from_page,
        }
    }
}
