//! Relay core: per-connection state machine, session attach, message relay and fan-out.
//!
//! Transport-agnostic: a connection is a socket id plus an outbound event queue. The
//! WebSocket server feeds parsed events in, in arrival order per socket, and drives the
//! identify deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::protocol::{ClientEvent, ClientRole, ImagePayload, ServerEvent};
use super::registry::ConnectionRegistry;
use crate::config::RelayConfig;
use crate::dispatch::{normalize_provider_key, ResponseDispatcher, DEFAULT_PROVIDER_KEY};
use crate::llm::{HistoryTurn, ImageInput};
use crate::session::{Message, Sender, Session, SessionStore, StoreError, StoredImage};
use crate::transcription::{decode_audio, Transcriber, TranscriptionError};

const DEFAULT_HELP_MESSAGE: &str = "User requested help";
const ATTACH_FAILED_REPLY: &str = "Error loading your session. Please identify again.";
const SAVE_FAILED_REPLY: &str = "Error saving your message. Please try again.";
const CLEAR_FAILED_REPLY: &str = "Error clearing history. Please try again.";

/// Relay tuning taken from config.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub identify_timeout: Duration,
    pub history_window: usize,
    pub session_list_limit: usize,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(c: &RelayConfig) -> Self {
        Self {
            identify_timeout: Duration::from_millis(c.identify_timeout_ms),
            history_window: c.history_window.max(1),
            session_list_limit: c.session_list_limit,
        }
    }
}

/// Outcome of a help request raised through HTTP.
#[derive(Debug, Clone)]
pub struct HelpOutcome {
    pub message: Message,
    pub portal_notified: bool,
}

/// One relay instance. All connection and session state hangs off this value.
pub struct Relay {
    registry: ConnectionRegistry,
    store: Arc<SessionStore>,
    dispatcher: Arc<ResponseDispatcher>,
    transcriber: Option<Arc<dyn Transcriber>>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        store: Arc<SessionStore>,
        dispatcher: Arc<ResponseDispatcher>,
        transcriber: Option<Arc<dyn Transcriber>>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            store,
            dispatcher,
            transcriber,
            settings,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &ResponseDispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register a new connection in the identifying state. The caller drains the receiver
    /// into the transport and must call [`Relay::auto_identify`] once the identify deadline
    /// passes.
    pub fn connect(&self, requested_id: Option<&str>) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket_id = self.registry.register(requested_id, tx);
        log::debug!("relay: {} connected", socket_id);
        (socket_id, rx)
    }

    /// Handle one inbound event for `socket_id`.
    pub async fn handle_event(&self, socket_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Identify { role } => self.identify(socket_id, role).await,
            ClientEvent::SendMessage {
                prompt,
                images,
                provider,
            } => self.send_message(socket_id, prompt, images, provider).await,
            ClientEvent::ClearHistory {} => self.clear_history(socket_id).await,
            ClientEvent::RequestHelp { message } => self.help_from_socket(socket_id, message).await,
            ClientEvent::TranscribeAudio { audio, mime_type } => {
                self.transcribe(socket_id, &audio, &mime_type).await
            }
        }
    }

    /// Explicit identify. Only the first identify of a connection is honored.
    pub async fn identify(&self, socket_id: &str, role: ClientRole) {
        if !self.registry.claim_role(socket_id, role) {
            log::debug!("relay: ignoring repeated identify from {}", socket_id);
            return;
        }
        log::info!("relay: {} identified as {:?}", socket_id, role);
        match role {
            ClientRole::Portal => {
                self.registry.broadcast_role(
                    ClientRole::Chatbot,
                    &ServerEvent::PortalStatus { connected: true },
                );
            }
            ClientRole::Chatbot => {
                self.attach(socket_id).await;
            }
        }
    }

    /// Identify deadline passed: a still-unidentified connection becomes a chatbot.
    pub async fn auto_identify(&self, socket_id: &str) {
        if !self.registry.claim_role(socket_id, ClientRole::Chatbot) {
            return;
        }
        log::info!("relay: {} did not identify, treating as chatbot", socket_id);
        self.attach(socket_id).await;
    }

    /// Find or create the socket's session, load its history window and announce it.
    /// On a store failure the role is released so the client can identify again.
    async fn attach(&self, socket_id: &str) -> bool {
        let attached = match self.store.attach(socket_id, DEFAULT_PROVIDER_KEY).await {
            Ok(a) => a,
            Err(e) => {
                log::warn!("relay: session attach for {} failed: {}", socket_id, e);
                self.registry.release_role(socket_id);
                self.error_reply(socket_id, ATTACH_FAILED_REPLY, DEFAULT_PROVIDER_KEY.to_string());
                return false;
            }
        };
        let session = attached.session;
        let history = history_turns(&session);
        if !self.registry.attach_session(
            socket_id,
            session.id.clone(),
            history,
            self.settings.history_window,
        ) {
            log::debug!("relay: {} left before its session was attached", socket_id);
            return false;
        }
        log::info!(
            "relay: {} session {} ({}, {} message(s))",
            socket_id,
            session.id,
            if attached.created { "new" } else { "restored" },
            session.history.len()
        );
        self.registry.send_to(
            socket_id,
            ServerEvent::SessionInitialized {
                session_id: session.id.clone(),
                socket_id: socket_id.to_string(),
                history_length: session.history.len(),
            },
        );
        self.registry.send_to(
            socket_id,
            ServerEvent::PortalStatus {
                connected: self.registry.portal_count() > 0,
            },
        );
        true
    }

    fn error_reply(&self, socket_id: &str, reply: &str, provider: String) {
        self.registry.send_to(
            socket_id,
            ServerEvent::BotReply {
                reply: reply.to_string(),
                provider,
                error: Some(true),
            },
        );
    }

    async fn send_message(
        &self,
        socket_id: &str,
        prompt: String,
        images: Vec<ImagePayload>,
        provider: Option<String>,
    ) {
        let Some(mut snapshot) = self.registry.session(socket_id) else {
            log::debug!("relay: dropping send_message from {}: no session attached", socket_id);
            return;
        };
        if prompt.trim().is_empty() && images.is_empty() {
            log::debug!("relay: dropping empty send_message from {}", socket_id);
            return;
        }
        let provider = normalize_provider_key(provider.as_deref());
        let stored: Vec<StoredImage> = images
            .iter()
            .enumerate()
            .map(|(i, img)| StoredImage {
                data: img.data.clone(),
                name: img
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("image-{}", i + 1)),
                mime_type: img.mime_type.clone(),
            })
            .collect();
        let user_turn = HistoryTurn::user(user_turn_text(&prompt, !images.is_empty()));

        let user_message = Message::user(prompt.clone(), stored, provider.clone());
        let mut saved = self.store.append(&snapshot.db_id, user_message.clone()).await;
        if matches!(saved, Err(StoreError::NotFound(_))) {
            log::info!(
                "relay: session {} is gone, attaching {} to a new one",
                snapshot.db_id,
                socket_id
            );
            if !self.attach(socket_id).await {
                return;
            }
            let Some(fresh) = self.registry.session(socket_id) else {
                return;
            };
            snapshot = fresh;
            saved = self.store.append(&snapshot.db_id, user_message).await;
        }
        if let Err(e) = saved {
            log::warn!("relay: saving message for {} failed: {}", snapshot.db_id, e);
            self.error_reply(socket_id, SAVE_FAILED_REPLY, provider);
            return;
        }

        let inputs: Vec<ImageInput> = images
            .into_iter()
            .map(|img| ImageInput {
                data: img.data,
                mime_type: img.mime_type,
            })
            .collect();
        let reply = match self
            .dispatcher
            .respond(&prompt, &inputs, &snapshot.history, &provider)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("relay: response for {} failed: {}", snapshot.db_id, e);
                let reply = format!(
                    "Error generating response from {}. Please check your API key.",
                    provider
                );
                self.error_reply(socket_id, &reply, provider);
                return;
            }
        };

        if let Err(e) = self
            .store
            .append(&snapshot.db_id, Message::bot(reply.clone(), provider.clone()))
            .await
        {
            log::warn!("relay: saving reply for {} failed: {}", snapshot.db_id, e);
        }
        self.registry.push_turns(
            socket_id,
            user_turn,
            HistoryTurn::model(reply.clone()),
            self.settings.history_window,
        );
        if !self.registry.send_to(
            socket_id,
            ServerEvent::BotReply {
                reply: reply.clone(),
                provider: provider.clone(),
                error: None,
            },
        ) {
            log::debug!("relay: {} disconnected before its reply was ready", socket_id);
        }
        self.registry.broadcast_role(
            ClientRole::Portal,
            &ServerEvent::SessionUpdated {
                session_id: snapshot.db_id,
                last_message: reply,
                provider,
            },
        );
    }

    async fn clear_history(&self, socket_id: &str) {
        let Some(snapshot) = self.registry.session(socket_id) else {
            log::debug!("relay: dropping clear_history from {}: no session attached", socket_id);
            return;
        };
        if let Err(e) = self.store.clear_history(&snapshot.db_id).await {
            log::warn!("relay: clearing {} failed: {}", snapshot.db_id, e);
            self.error_reply(socket_id, CLEAR_FAILED_REPLY, DEFAULT_PROVIDER_KEY.to_string());
            return;
        }
        self.registry.clear_history(socket_id);
        self.registry.send_to(socket_id, ServerEvent::HistoryCleared {});
    }

    async fn help_from_socket(&self, socket_id: &str, message: String) {
        let Some(snapshot) = self.registry.session(socket_id) else {
            log::debug!("relay: dropping request_help from {}: no session attached", socket_id);
            return;
        };
        if let Err(e) = self.raise_help(&snapshot.db_id, socket_id, message).await {
            log::warn!("relay: help request for {} failed: {}", snapshot.db_id, e);
        }
    }

    /// Append a flagged help message and alert every portal. Returns the message and how
    /// many portals were alerted.
    async fn raise_help(
        &self,
        session_id: &str,
        chatbot_socket_id: &str,
        message: String,
    ) -> Result<(Message, usize), StoreError> {
        let text = if message.trim().is_empty() {
            DEFAULT_HELP_MESSAGE.to_string()
        } else {
            message
        };
        let saved = self.store.append(session_id, Message::help(text)).await?;
        let notified = self.registry.broadcast_role(
            ClientRole::Portal,
            &ServerEvent::HelpRequest {
                session_id: session_id.to_string(),
                message: saved.message.clone(),
                timestamp: saved.timestamp,
                chatbot_socket_id: chatbot_socket_id.to_string(),
            },
        );
        log::info!("relay: help requested on {} ({} portal(s) alerted)", session_id, notified);
        Ok((saved, notified))
    }

    async fn transcribe(&self, socket_id: &str, audio: &str, mime_type: &str) {
        let Some(ref transcriber) = self.transcriber else {
            self.registry.send_to(
                socket_id,
                ServerEvent::TranscriptionError {
                    error: TranscriptionError::NotConfigured.to_string(),
                },
            );
            return;
        };
        let result = match decode_audio(audio) {
            Ok(bytes) => transcriber.transcribe(bytes, mime_type).await,
            Err(e) => Err(e),
        };
        let event = match result {
            Ok(transcript) => ServerEvent::TranscriptionResult { transcript },
            Err(e) => {
                log::warn!("relay: transcription for {} failed: {}", socket_id, e);
                ServerEvent::TranscriptionError {
                    error: e.to_string(),
                }
            }
        };
        self.registry.send_to(socket_id, event);
    }

    /// Transport closed. Portals leaving may flip chatbots' portal status.
    pub fn disconnect(&self, socket_id: &str) {
        let Some(departed) = self.registry.remove(socket_id) else {
            return;
        };
        log::info!("relay: {} disconnected ({:?})", socket_id, departed.role);
        if departed.last_portal {
            self.registry.broadcast_role(
                ClientRole::Chatbot,
                &ServerEvent::PortalStatus { connected: false },
            );
        }
    }

    /// Portal-authored message appended to a session; the attached chatbot (if any) is told.
    pub async fn post_portal_message(&self, session_id: &str, text: String) -> Result<Message, StoreError> {
        let saved = self.store.append(session_id, Message::portal(text)).await?;
        if let Some(socket_id) = self.registry.socket_for_session(session_id) {
            self.registry.send_to(
                &socket_id,
                ServerEvent::PortalNotification {
                    message: saved.message.clone(),
                    timestamp: saved.timestamp,
                },
            );
        }
        Ok(saved)
    }

    /// HTTP form of the help-request signal.
    pub async fn request_help(&self, session_id: &str, message: String) -> Result<HelpOutcome, StoreError> {
        let session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let (message, notified) = self.raise_help(session_id, &session.socket_id, message).await?;
        Ok(HelpOutcome {
            message,
            portal_notified: notified > 0,
        })
    }

    /// Clear a session's persisted history and the attached chatbot's in-memory window.
    pub async fn clear_session_history(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.clear_history(session_id).await?;
        if let Some(socket_id) = self.registry.clear_history_for_session(session_id) {
            self.registry.send_to(&socket_id, ServerEvent::HistoryCleared {});
        }
        Ok(())
    }

    /// Delete one session. A chatbot still attached to it gets a fresh session.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        if !self.store.delete(session_id).await? {
            return Ok(false);
        }
        if let Some(socket_id) = self.registry.detach_session(session_id) {
            self.attach(&socket_id).await;
        }
        Ok(true)
    }

    /// Delete every session; attached chatbots get fresh ones. Returns how many were removed.
    pub async fn delete_all_sessions(&self) -> Result<usize, StoreError> {
        let deleted = self.store.delete_all().await?;
        for socket_id in self.registry.detach_all() {
            self.attach(&socket_id).await;
        }
        Ok(deleted)
    }

    /// Tell every connection the server is going away.
    pub fn shutdown(&self) -> usize {
        self.registry.broadcast_all(&ServerEvent::Shutdown {})
    }
}

fn user_turn_text(prompt: &str, has_images: bool) -> String {
    if has_images {
        format!("{} [with images]", prompt)
    } else {
        prompt.to_string()
    }
}

/// Provider-facing history of a persisted session: user and bot turns only.
fn history_turns(session: &Session) -> Vec<HistoryTurn> {
    session
        .history
        .iter()
        .filter(|m| !m.help_requested)
        .filter_map(|m| match m.sender {
            Sender::User => Some(HistoryTurn::user(user_turn_text(&m.message, !m.images.is_empty()))),
            Sender::Bot => Some(HistoryTurn::model(m.message.clone())),
            Sender::Portal => None,
        })
        .collect()
}
