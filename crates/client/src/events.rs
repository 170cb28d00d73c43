//! Events stream client.
//!
//! An [`EventsClient`] subscribes to graph change notifications. Filters
//! are registered on every (re)connect from the client's own filter table,
//! so a reconnect restores the exact subscription state. A background task
//! pushes a fresh token over the socket shortly before the current one
//! expires, keeping long-lived streams alive without a reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use gw_auth::TokenProvider;
use gw_protocol::{epoch_ms, EventMessage, EventsControl, EventsFilter};

use crate::error::SessionError;
use crate::session::{SessionConfig, SessionHandle, SessionHandler, WsSession};

/// Floor for the keep-alive sleep so a stale refresh time cannot spin.
const MIN_REFRESH_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

/// Receives graph change notifications.
#[async_trait::async_trait]
pub trait EventsHandler: Send + Sync + 'static {
    async fn on_create(&self, event: &EventMessage);
    async fn on_update(&self, event: &EventMessage);
    async fn on_delete(&self, event: &EventMessage);
}

struct EventsInner {
    provider: Arc<dyn TokenProvider>,
    handler: Arc<dyn EventsHandler>,
    filters: parking_lot::Mutex<HashMap<String, EventsFilter>>,
    refresher: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Client for the events WebSocket API.
pub struct EventsClient {
    session: WsSession,
    inner: Arc<EventsInner>,
}

impl EventsClient {
    /// Build an events client. No connection is made until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error when the provider knows no endpoint for the API.
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        config: SessionConfig,
        handler: Arc<dyn EventsHandler>,
    ) -> Result<Self, SessionError> {
        let inner = Arc::new(EventsInner {
            provider: Arc::clone(&provider),
            handler,
            filters: parking_lot::Mutex::new(HashMap::new()),
            refresher: parking_lot::Mutex::new(None),
        });
        let session = WsSession::new(provider, config, Arc::clone(&inner) as _)?;
        Ok(Self { session, inner })
    }

    /// Connect and start receiving events.
    ///
    /// # Errors
    ///
    /// Returns an error when the first connection attempt fails.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.session.start().await
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Re-raises any error the session stored while running.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.session.stop().await
    }

    /// Stop, then reconnect; filters re-register on open.
    ///
    /// # Errors
    ///
    /// Propagates errors from either phase.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.session.restart().await
    }

    /// Wait for the session to end.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session, when there is one.
    pub async fn join(&self) -> Result<(), SessionError> {
        self.session.join().await
    }

    /// A sending handle onto the underlying session.
    pub fn handle(&self) -> SessionHandle {
        self.session.handle()
    }

    /// Register a filter now and on every future reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not running or the send fails.
    pub async fn add_events_filter(&self, filter: EventsFilter) -> Result<(), SessionError> {
        let wire = EventsControl::register(filter.clone()).to_wire()?;
        self.session.handle().send(&wire).await?;
        self.inner.filters.lock().insert(filter.id.clone(), filter);
        Ok(())
    }

    /// Unregister a filter and forget it.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not running or the send fails.
    pub async fn remove_events_filter(&self, filter_id: &str) -> Result<(), SessionError> {
        let wire = EventsControl::unregister(filter_id).to_wire()?;
        self.session.handle().send(&wire).await?;
        self.inner.filters.lock().remove(filter_id);
        Ok(())
    }

    /// Drop all filters, local table included.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not running or the send fails.
    pub async fn clear_events_filters(&self) -> Result<(), SessionError> {
        let wire = EventsControl::clear().to_wire()?;
        self.session.handle().send(&wire).await?;
        self.inner.filters.lock().clear();
        Ok(())
    }

    /// Send a custom outbound event and return its generated id.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not running or the send fails.
    pub async fn send_events_message(
        &self,
        event_type: &str,
        headers: serde_json::Value,
        body: serde_json::Value,
    ) -> Result<String, SessionError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let wire = serde_json::json!({
            "id": id,
            "type": event_type,
            "headers": headers,
            "body": body,
        })
        .to_string();
        self.session.handle().send(&wire).await?;
        Ok(id)
    }

    /// Filters that will be registered on the next (re)connect.
    pub fn filter_count(&self) -> usize {
        self.inner.filters.lock().len()
    }
}

#[async_trait::async_trait]
impl SessionHandler for EventsInner {
    async fn on_open(&self, session: &SessionHandle) -> Result<(), SessionError> {
        let filters: Vec<EventsFilter> = self.filters.lock().values().cloned().collect();
        for filter in filters {
            tracing::debug!(filter_id = %filter.id, "registering events filter");
            session.reply(&EventsControl::register(filter).to_wire()?).await?;
        }

        if self.provider.refresh_time().is_some() {
            let provider = Arc::clone(&self.provider);
            let session = session.clone();
            let handle = tokio::spawn(run_token_refresher(provider, session));
            if let Some(old) = self.refresher.lock().replace(handle) {
                old.abort();
            }
        }
        Ok(())
    }

    async fn on_message(&self, _session: &SessionHandle, text: &str) -> Result<(), SessionError> {
        // A malformed or unknown event must not take the stream down.
        let event = match EventMessage::parse(text) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, "ignoring malformed event");
                return Ok(());
            }
        };

        match event.event_type.as_str() {
            "CREATE" => self.handler.on_create(&event).await,
            "UPDATE" => self.handler.on_update(&event).await,
            "DELETE" => self.handler.on_delete(&event).await,
            other => {
                tracing::warn!(event_type = other, id = %event.id, "ignoring unknown event type");
            }
        }
        Ok(())
    }

    async fn on_close(&self, _session: &SessionHandle) {
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
    }
}

/// Push a fresh token over the socket each time the current one nears
/// expiry. Runs per connection; aborted on close.
async fn run_token_refresher(provider: Arc<dyn TokenProvider>, session: SessionHandle) {
    loop {
        let Some(refresh_at) = provider.refresh_time() else {
            return;
        };
        let wait_ms = refresh_at - epoch_ms();
        let wait = if wait_ms > 0 {
            std::time::Duration::from_millis(wait_ms as u64).max(MIN_REFRESH_WAIT)
        } else {
            MIN_REFRESH_WAIT
        };
        tokio::time::sleep(wait).await;

        if let Err(error) = provider.refresh().await {
            tracing::error!(%error, "token refresh for events stream failed");
            return;
        }
        let token = match provider.token().await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(%error, "no token after refresh");
                return;
            }
        };
        let wire = match EventsControl::token(token).to_wire() {
            Ok(wire) => wire,
            Err(error) => {
                tracing::error!(%error, "failed to encode token message");
                return;
            }
        };
        if let Err(error) = session.send(&wire).await {
            tracing::warn!(%error, "failed to push refreshed token");
            return;
        }
        tracing::debug!("pushed refreshed token over events stream");
    }
}
