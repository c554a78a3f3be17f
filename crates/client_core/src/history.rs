use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use shared::{
    domain::ChatId,
    error::ApiFailure,
    protocol::{codes, ChatMessage, HistoryPage},
};
use tokio::sync::Mutex;
use tracing::info;

use crate::http::{ApiClient, RequestOptions};

/// Display order for a room timeline: created_at ascending, ties broken by
/// message_id ascending. Optimistic entries stamp "now", so they naturally
/// sort after loaded history.
pub fn timeline_order(a: &ChatMessage, b: &ChatMessage) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then(a.message_id.cmp(&b.message_id))
}

/// Cursor-paginated history fetch. Pages come back in ascending order no
/// matter how the server sorts them, and at most one load per room is in
/// flight at a time.
pub struct HistoryLoader {
    api: Arc<ApiClient>,
    page_size: u32,
    inflight: Mutex<HashSet<ChatId>>,
}

impl HistoryLoader {
    pub fn new(api: Arc<ApiClient>, page_size: u32) -> Self {
        Self {
            api,
            page_size,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Fetch the page of messages older than `cursor` (latest page when
    /// `None`). Returns `Ok(None)` without touching the network when a load
    /// for the same room is already outstanding.
    pub async fn load_page(
        &self,
        chat_id: ChatId,
        cursor: Option<i64>,
    ) -> Result<Option<HistoryPage>, ApiFailure> {
        {
            let mut inflight = self.inflight.lock().await;
            if !inflight.insert(chat_id) {
                info!(
                    chat_id = chat_id.0,
                    "history load already in flight; skipping duplicate request"
                );
                return Ok(None);
            }
        }

        let result = self.fetch_page(chat_id, cursor).await;

        self.inflight.lock().await.remove(&chat_id);

        result.map(Some)
    }

    async fn fetch_page(
        &self,
        chat_id: ChatId,
        cursor: Option<i64>,
    ) -> Result<HistoryPage, ApiFailure> {
        let mut path = format!("/chats/{}/messages?size={}", chat_id.0, self.page_size);
        if let Some(cursor) = cursor {
            path.push_str(&format!("&cursor={cursor}"));
        }

        let mut page: HistoryPage = self
            .api
            .get(&path, RequestOptions::with_success_codes(&[codes::OK]))
            .await?;

        // Server ordering is not part of the contract; display order is
        // decided here.
        page.messages.sort_by(timeline_order);
        Ok(page)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
