use std::{sync::Arc, time::Duration};

use shared::domain::UserId;

pub mod auth;
pub mod config;
pub mod history;
pub mod http;
pub mod session;
pub mod timeline;
pub mod transport;

pub use auth::{CredentialStore, MemoryCredentialStore, TokenCoordinator};
pub use config::{load_settings, Settings};
pub use history::HistoryLoader;
pub use http::{ApiClient, RequestOptions};
pub use session::{RoomDescriptor, RoomEvent, RoomSession, SessionError, SessionStatus};
pub use timeline::{Merge, Phase, Provenance, Timeline, TimelineEntry};
pub use transport::{LinkStatus, Transport};

use crate::session::RoomDeps;

/// Composition root: one per client process. Owns the process-wide
/// singletons (shared broker transport, token coordinator); every mounted
/// room borrows them while owning its own timeline state.
pub struct ChatClient {
    settings: Settings,
    local_user_id: UserId,
    tokens: Arc<TokenCoordinator>,
    api: Arc<ApiClient>,
    history: Arc<HistoryLoader>,
    transport: Arc<Transport>,
}

impl ChatClient {
    pub fn new(
        settings: Settings,
        local_user_id: UserId,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let tokens = Arc::new(TokenCoordinator::new(
            &settings.api_base_url,
            Arc::clone(&store),
        ));
        let api = Arc::new(ApiClient::new(
            &settings.api_base_url,
            Arc::clone(&store),
            Arc::clone(&tokens),
        ));
        let history = Arc::new(HistoryLoader::new(
            Arc::clone(&api),
            settings.history_page_size,
        ));
        let transport = Transport::new(settings.broker_url_or_derived(), store);
        Self {
            settings,
            local_user_id,
            tokens,
            api,
            history,
            transport,
        }
    }

    pub async fn open_room(&self, descriptor: RoomDescriptor) -> Arc<RoomSession> {
        RoomSession::mount(
            RoomDeps {
                api: Arc::clone(&self.api),
                history: Arc::clone(&self.history),
                transport: Arc::clone(&self.transport),
                tokens: Arc::clone(&self.tokens),
                reconnect_initial: Duration::from_millis(self.settings.reconnect_initial_delay_ms),
                reconnect_max: Duration::from_millis(self.settings.reconnect_max_delay_ms),
            },
            descriptor,
            self.local_user_id,
        )
        .await
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn tokens(&self) -> &Arc<TokenCoordinator> {
        &self.tokens
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub async fn shutdown(&self) {
        self.transport.disconnect().await;
    }
}
