//! Action execution client.
//!
//! An [`ActionClient`] sits on a [`WsSession`] and runs the submit/ack/
//! nack/result exchange with the gateway:
//!
//! ```text
//!   gateway ── submitAction ──▶ client      ack first, then execute
//!   client ── acknowledged ───▶ gateway
//!   client ── sendActionResult ▶ gateway    result kept until acked
//!   gateway ── acknowledged ──▶ client      result entry dropped
//!   gateway ── negativeAck ───▶ client      one re-send after a pause
//! ```
//!
//! Two expiring stores make the exchange idempotent under redelivery: the
//! submit store deduplicates in-flight actions, and the result store
//! answers redelivered submits without running the handler again.
//!
//! A handler may also return [`ActionOutcome::Deferred`] and complete the
//! action later, from any task, through
//! [`ActionClient::send_action_result`].

use std::sync::Arc;

use serde_json::json;

use gw_auth::TokenProvider;
use gw_protocol::{ActionMessage, ActionResult, SubmitAction};

use crate::error::{ActionError, SessionError, StoreError};
use crate::session::{SessionConfig, SessionHandle, SessionHandler, WsSession};
use crate::store::ActionStore;

/// Pause before honoring a negative acknowledgement with a re-send.
const NACK_PAUSE: std::time::Duration = std::time::Duration::from_secs(1);

/// What a handler produced for one action.
#[derive(Debug)]
pub enum ActionOutcome {
    /// Completed with data: reported as a code-200 result.
    Data(serde_json::Value),
    /// Completed without data: reported as a code-204 result.
    Empty,
    /// Completion happens later, from any task, through
    /// [`ActionClient::send_action_result`]. The submit stays pending
    /// until then (or until it expires).
    Deferred,
}

/// Executes actions submitted by the gateway.
///
/// Implementations must be cheap to call concurrently: each submit runs on
/// its own task.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    /// Execute one action. `Err` becomes a code-500 result reported to the
    /// gateway, never raised locally; see [`ActionOutcome`] for the success
    /// shapes.
    async fn handle_action(&self, action: &SubmitAction) -> Result<ActionOutcome, ActionError>;

    /// The gateway announced a configuration change.
    async fn on_config_changed(&self) {}
}

/// Protocol state shared between the session-facing dispatcher, spawned
/// execution tasks, and the client handle.
struct ActionShared {
    submit_store: ActionStore<SubmitAction>,
    result_store: ActionStore<ActionResult>,
    handler: Arc<dyn ActionHandler>,
}

/// The [`SessionHandler`] face of the action protocol.
struct ActionInner {
    shared: Arc<ActionShared>,
}

/// Client for the action WebSocket API.
pub struct ActionClient {
    session: WsSession,
    shared: Arc<ActionShared>,
}

impl ActionClient {
    /// Build an action client. No connection is made until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error when the provider knows no endpoint for the API.
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        config: SessionConfig,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Self, SessionError> {
        let shared = Arc::new(ActionShared {
            submit_store: ActionStore::new("submitAction"),
            result_store: ActionStore::new("sendActionResult"),
            handler,
        });
        let inner = ActionInner {
            shared: Arc::clone(&shared),
        };
        let session = WsSession::new(provider, config, Arc::new(inner) as _)?;
        Ok(Self { session, shared })
    }

    /// Connect and start executing actions.
    ///
    /// # Errors
    ///
    /// Returns an error when the first connection attempt fails.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.session.start().await
    }

    /// Close the connection and drop all pending store entries.
    ///
    /// # Errors
    ///
    /// Re-raises any error the session stored while running.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let result = self.session.stop().await;
        self.shared.submit_store.clear();
        self.shared.result_store.clear();
        result
    }

    /// Stop, then reconnect.
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

    /// Deliver the result for a pending action. Safe to call from any
    /// task; this is the completion path for handlers that returned
    /// [`ActionOutcome::Deferred`]. A result for an id with no pending
    /// submit is dropped with a log line, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the result cannot be sent over the session.
    pub async fn send_action_result(
        &self,
        id: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<(), SessionError> {
        let Some(submit) = self.shared.submit_store.get(id) else {
            tracing::warn!(id, "no pending submit for this result, dropping");
            return Ok(());
        };
        let envelope = result_envelope(Ok(result));
        self.shared
            .finish_submit(&self.session.handle(), id, submit.expires_at, &envelope)
            .await
    }

    /// Actions currently executing or awaiting a result ack.
    pub fn pending_actions(&self) -> usize {
        self.shared.submit_store.len()
    }
}

#[async_trait::async_trait]
impl SessionHandler for ActionInner {
    async fn on_message(&self, session: &SessionHandle, text: &str) -> Result<(), SessionError> {
        let message = match ActionMessage::parse(text) {
            Ok(message) => message,
            Err(error) => {
                // A message we cannot use but can address gets a Nack so the
                // gateway stops redelivering it; anything else is only logged.
                if let Some(id) = error.id() {
                    tracing::warn!(%error, id, "rejecting unusable message");
                    let nack = ActionMessage::nack(id, 400, format!("{error}"));
                    self.reply_or_log(session, &nack).await;
                } else {
                    tracing::error!(%error, "ignoring unusable message");
                }
                return Ok(());
            }
        };

        match message {
            ActionMessage::Submit(submit) => self.handle_submit(session, submit).await,
            ActionMessage::Result(result) => {
                // This client only executes actions; results flowing inbound
                // are a routing error on the remote side.
                tracing::warn!(id = %result.id, "received sendActionResult, rejecting");
                let nack = ActionMessage::nack(&result.id, 400, "sendActionResult rejected");
                self.reply_or_log(session, &nack).await;
            }
            ActionMessage::Ack(receipt) => {
                tracing::debug!(id = %receipt.id, code = receipt.code, "result acknowledged");
                self.shared.result_store.remove(&receipt.id);
            }
            ActionMessage::Nack(receipt) => {
                self.handle_nack(session, &receipt.id);
            }
            ActionMessage::Error { code, message } => {
                tracing::warn!(code, %message, "error from gateway");
            }
            ActionMessage::ConfigChanged => {
                tracing::info!("action configuration changed");
                self.shared.handler.on_config_changed().await;
            }
        }
        Ok(())
    }

    async fn on_close(&self, _session: &SessionHandle) {
        tracing::debug!(
            pending = self.shared.submit_store.len(),
            unacked = self.shared.result_store.len(),
            "action connection closed"
        );
    }
}

impl ActionInner {
    /// Ack, dedup, then execute on a fresh task.
    async fn handle_submit(&self, session: &SessionHandle, submit: SubmitAction) {
        let id = submit.id.clone();
        tracing::info!(%id, capability = %submit.capability, "action submitted");

        // Ack before anything else so the gateway stops its redelivery clock.
        let ack = ActionMessage::ack(&id, 200, "submitAction acknowledged");
        self.reply_or_log(session, &ack).await;

        match self
            .shared
            .submit_store
            .add(&id, submit.expires_at, submit.clone())
        {
            Ok(()) => {}
            Err(StoreError::Exists { .. }) => {
                // Already executing; the ack above is all the gateway needs.
                tracing::debug!(%id, "duplicate submit, already in progress");
                return;
            }
            Err(StoreError::Expired { .. }) => {
                tracing::warn!(%id, "submit already expired on arrival");
                return;
            }
        }

        // A finished action being redelivered: the submit entry was gone but
        // the result is still awaiting its ack. Answer from the store
        // without running the handler again.
        if let Some(result) = self.shared.result_store.get(&id) {
            tracing::debug!(%id, "re-sending stored result");
            self.reply_or_log(session, &ActionMessage::Result(result)).await;
            self.shared.submit_store.remove(&id);
            return;
        }

        let shared = Arc::clone(&self.shared);
        let session = session.clone();
        tokio::spawn(async move {
            shared.execute(&session, submit).await;
        });
    }

    /// A Nack asks for one re-send, charged against the result's retry
    /// budget, after a pause.
    fn handle_nack(&self, session: &SessionHandle, id: &str) {
        let id = id.to_owned();
        match self.shared.result_store.retry_get(&id) {
            Some(result) => {
                tracing::debug!(%id, "result rejected, re-sending after pause");
                let session = session.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(NACK_PAUSE).await;
                    match ActionMessage::Result(result).to_wire() {
                        Ok(wire) => {
                            if let Err(error) = session.send(&wire).await {
                                tracing::error!(%id, %error, "failed to re-send result");
                            }
                        }
                        Err(error) => {
                            tracing::error!(%id, %error, "failed to encode stored result");
                        }
                    }
                });
            }
            None => {
                tracing::warn!(%id, "result rejected and retries exhausted, dropping");
            }
        }
    }

    /// Single-attempt send for replies issued on the reader path. A
    /// failure here means the socket is going away; the gateway will
    /// redeliver, so the failure is logged and dropped rather than
    /// blocking the reader on a reconnect it would itself have to drive.
    async fn reply_or_log(&self, session: &SessionHandle, message: &ActionMessage) {
        match message.to_wire() {
            Ok(wire) => {
                if let Err(error) = session.reply(&wire).await {
                    tracing::warn!(id = ?message.id(), %error, "reply failed, socket going away");
                }
            }
            Err(error) => {
                tracing::error!(id = ?message.id(), %error, "failed to encode reply");
            }
        }
    }
}

impl ActionShared {
    /// Run the handler and report its outcome; failures become code-500
    /// results, and a deferred outcome leaves the submit pending for a
    /// later `send_action_result`.
    async fn execute(&self, session: &SessionHandle, submit: SubmitAction) {
        let outcome = self.handler.handle_action(&submit).await;
        let envelope = match &outcome {
            Ok(ActionOutcome::Deferred) => {
                tracing::debug!(id = %submit.id, "completion deferred by the handler");
                return;
            }
            Ok(ActionOutcome::Data(data)) => result_envelope(Ok(Some(data))),
            Ok(ActionOutcome::Empty) => result_envelope(Ok(None)),
            Err(error) => {
                tracing::error!(id = %submit.id, %error, "action handler failed");
                result_envelope(Err(error))
            }
        };

        if let Err(error) = self
            .finish_submit(session, &submit.id, submit.expires_at, &envelope)
            .await
        {
            tracing::error!(id = %submit.id, %error, "failed to deliver action result");
        }
    }

    /// Store and send the result, then drop the submit entry. The submit is
    /// removed even when sending fails: execution is over either way, and a
    /// redelivered submit must be answered from the result store.
    async fn finish_submit(
        &self,
        session: &SessionHandle,
        id: &str,
        expires_at: i64,
        envelope: &serde_json::Value,
    ) -> Result<(), SessionError> {
        let result = ActionResult::new(id, envelope);
        let to_send = match self.result_store.add(id, expires_at, result.clone()) {
            Ok(()) => Some(result),
            // A result is already stored for this id: that one wins.
            Err(StoreError::Exists { .. }) => self.result_store.get(id),
            Err(StoreError::Expired { .. }) => {
                tracing::warn!(id, "result expired before it could be stored");
                None
            }
        };

        let sent = match to_send {
            Some(result) => match ActionMessage::Result(result).to_wire() {
                Ok(wire) => session.send(&wire).await,
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        };
        self.submit_store.remove(id);
        sent
    }
}

/// Build the result envelope for a handler outcome without a client.
/// Used by callers that deliver results over their own transport.
pub fn result_envelope(outcome: Result<Option<&serde_json::Value>, &ActionError>) -> serde_json::Value {
    match outcome {
        Ok(Some(data)) => json!({
            "message": "Action successful",
            "code": 200,
            "data": data.to_string(),
        }),
        Ok(None) => json!({
            "message": "Action successful (no data)",
            "code": 204,
        }),
        Err(error) => json!({ "message": error.to_string(), "code": 500 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_double_encodes_data() {
        let data = json!({"answer": 42});
        let envelope = result_envelope(Ok(Some(&data)));
        assert_eq!(envelope["code"], 200);
        assert_eq!(envelope["message"], "Action successful");
        // data rides as a JSON string, not an object
        let inner: serde_json::Value =
            serde_json::from_str(envelope["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner, data);
    }

    #[test]
    fn empty_envelope_is_204_without_data() {
        let envelope = result_envelope(Ok(None));
        assert_eq!(envelope["code"], 204);
        assert_eq!(envelope["message"], "Action successful (no data)");
        assert!(envelope.get("data").is_none());
    }

    #[test]
    fn handler_failure_becomes_500() {
        let error = ActionError::Failed("device unreachable".to_owned());
        let envelope = result_envelope(Err(&error));
        assert_eq!(envelope["code"], 500);
        assert_eq!(envelope["message"], "device unreachable");
    }
}
