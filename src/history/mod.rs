//! Encrypted, size-bounded chat history with lazy and swept expiry.

mod model;

pub use model::{ChatMessage, ChatSession, MessageMetadata, RenderingState, Role, SessionMetadata};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, oneshot};
use uuid::Uuid;

use crate::encryption::HistoryCipher;
use crate::error::{ChatGuardError, Result};
use crate::handle::SweeperHandle;
use crate::monitor::{SecurityEventKind, Severity};
use crate::pipeline::{ContentGuard, ContentKind};
use crate::storage::{CLIENT_ID_KEY, CURRENT_SESSION_KEY, HISTORY_KEY, MemoryStorage, Storage};
use crate::sweeper;
use crate::validator::normalize;

/// Size and age bounds of a [`ChatHistoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    /// Messages kept per session; the oldest are dropped first.
    pub max_history_size: usize,
    /// Inactivity after which a session expires.
    pub max_session_age: Duration,
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_history_size: 100,
            max_session_age: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Snapshot of the stored history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStats {
    pub total_sessions: usize,
    pub total_messages: usize,
    pub current_session_messages: usize,
    pub oldest_activity: Option<DateTime<Utc>>,
    pub encryption_enabled: bool,
}

#[derive(Default)]
struct State {
    loaded: bool,
    sessions: Vec<ChatSession>,
    current: Option<String>,
    client_id: Option<String>,
}

/// Owns the chat sessions of one client.
///
/// Sessions live in `local` as a single encrypted blob (the whole list is
/// rewritten on every change). `session` holds the per-tab values: the id
/// of the current session and the rate-limit client id.
///
/// Storage failures never surface to callers. They are logged as
/// [`SecurityEventKind::StorageFailure`] and the manager carries on with its
/// in-memory state, starting empty if the history cannot be read.
pub struct ChatHistoryManager<L: Storage, T: Storage = MemoryStorage> {
    local: L,
    session: T,
    guard: Arc<ContentGuard>,
    cipher: HistoryCipher,
    limits: HistoryLimits,
    state: Mutex<State>,
}

impl<L: Storage, T: Storage> ChatHistoryManager<L, T> {
    pub fn new(local: L, session: T, guard: Arc<ContentGuard>, limits: HistoryLimits) -> Self {
        let cipher = HistoryCipher::new(guard.config(), guard.monitor().clone());
        Self {
            local,
            session,
            guard,
            cipher,
            limits: HistoryLimits {
                max_history_size: limits.max_history_size.max(1),
                ..limits
            },
            state: Mutex::new(State::default()),
        }
    }

    pub fn guard(&self) -> &Arc<ContentGuard> {
        &self.guard
    }

    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }

    /// Spawn the background task that prunes expired sessions and stale
    /// rate-limit windows every `sweep_interval`.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = tokio::spawn(sweeper::run(
            Arc::clone(self),
            shutdown_rx,
            self.limits.sweep_interval,
        ));
        SweeperHandle::new(shutdown_tx, worker)
    }

    /// The active session, creating a fresh one if there is none or the
    /// previous one expired.
    pub async fn current_session(&self) -> ChatSession {
        let now = self.now();
        let mut state = self.state().await;
        let pruned = self.compact(&mut state, now);
        let id = self.current_id(&mut state, now).await;
        if pruned > 0 {
            self.persist(&state).await;
        }
        state
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .unwrap_or_else(|| ChatSession::new(id, now, self.cipher.is_enabled()))
    }

    /// Add a markdown message to the current session.
    pub async fn add_message(&self, content: &str, role: Role) -> Result<ChatMessage> {
        self.add_message_as(content, role, ContentKind::Markdown).await
    }

    /// Add a message rendered as `kind` to the current session.
    ///
    /// User content goes through the full pipeline (rate limit, validation,
    /// sanitization) under this client's id. Assistant content is sanitized
    /// too, and any change it needed is logged as untrusted content.
    pub async fn add_message_as(
        &self,
        content: &str,
        role: Role,
        kind: ContentKind,
    ) -> Result<ChatMessage> {
        let (sanitized, changed) = match role {
            Role::User => {
                let client_id = self.client_id().await;
                let sanitized = self.guard.process_content(&client_id, content, kind)?;
                let changed = kind.changed(&normalize(content), &sanitized);
                (sanitized, changed)
            }
            Role::Assistant => {
                let sanitized = self.guard.sanitize_untrusted(content, kind)?;
                let changed = kind.changed(content, &sanitized);
                (sanitized, changed)
            }
        };

        let now = self.now();
        let mut metadata = MessageMetadata::detect(&sanitized);
        metadata.security_checked = true;
        metadata.sanitized = changed;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            content: sanitized,
            role,
            timestamp: now,
            is_markdown: kind == ContentKind::Markdown,
            rendering_state: RenderingState::Pending,
            metadata,
        };

        let mut state = self.state().await;
        self.compact(&mut state, now);
        let id = self.current_id(&mut state, now).await;
        let encryption_enabled = self.cipher.is_enabled();
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(ChatGuardError::SessionNotFound(id))?;

        session.messages.push(message.clone());
        let dropped = session.trim_to(self.limits.max_history_size);
        if dropped > 0 {
            tracing::debug!("Trimmed {dropped} old message(s) from session {}", session.id);
        }
        session.last_activity = now;
        session.metadata.total_messages += 1;
        session.metadata.encryption_enabled = encryption_enabled;
        if changed {
            session.metadata.security_events += 1;
        }

        self.persist(&state).await;
        Ok(message)
    }

    /// Move a message to `rendering_state`. A message that reached
    /// [`RenderingState::Complete`] can no longer change.
    pub async fn set_rendering_state(
        &self,
        message_id: &str,
        rendering_state: RenderingState,
    ) -> Result<()> {
        let now = self.now();
        let mut state = self.state().await;

        let current = state.current.clone();
        let holds = |s: &ChatSession| s.messages.iter().any(|m| m.id == message_id);
        let index = state
            .sessions
            .iter()
            .position(|s| Some(&s.id) == current.as_ref() && holds(s))
            .or_else(|| state.sessions.iter().position(holds))
            .ok_or_else(|| ChatGuardError::MessageNotFound(message_id.to_string()))?;

        let message = state.sessions[index]
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatGuardError::MessageNotFound(message_id.to_string()))?;

        if message.rendering_state == RenderingState::Complete {
            return Err(ChatGuardError::MessageFinalized(message_id.to_string()));
        }
        message.rendering_state = rendering_state;
        if rendering_state == RenderingState::Complete {
            let elapsed = now.signed_duration_since(message.timestamp).num_milliseconds();
            message.metadata.render_time = Some(elapsed.max(0) as u64);
        }

        self.persist(&state).await;
        Ok(())
    }

    /// Every live session, most recently active first.
    pub async fn all_sessions(&self) -> Vec<ChatSession> {
        let now = self.now();
        let mut state = self.state().await;
        if self.compact(&mut state, now) > 0 {
            self.persist(&state).await;
        }
        let mut sessions = state.sessions.clone();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.state().await;
        let index = state
            .sessions
            .iter()
            .position(|s| s.id == session_id)
            .ok_or_else(|| ChatGuardError::SessionNotFound(session_id.to_string()))?;
        state.sessions.remove(index);

        if state.current.as_deref() == Some(session_id) {
            state.current = None;
            self.delete(&self.session, CURRENT_SESSION_KEY).await;
        }
        self.persist(&state).await;
        Ok(())
    }

    /// Drop the current session. The next access starts a new one.
    pub async fn clear_current_session(&self) {
        let mut state = self.state().await;
        let Some(id) = state.current.take() else {
            return;
        };
        state.sessions.retain(|s| s.id != id);
        self.delete(&self.session, CURRENT_SESSION_KEY).await;
        self.persist(&state).await;
    }

    /// Forget every session, in memory and in storage.
    pub async fn clear_all_history(&self) {
        let mut state = self.state().await;
        state.sessions.clear();
        state.current = None;
        futures::join!(
            self.delete(&self.local, HISTORY_KEY),
            self.delete(&self.session, CURRENT_SESSION_KEY),
        );
        tracing::debug!("Chat history cleared");
    }

    /// Serialize one session into an (encrypted) blob for
    /// [`import_session`](Self::import_session).
    pub async fn export_session(&self, session_id: &str) -> Result<String> {
        let state = self.state().await;
        let session = state
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .ok_or_else(|| ChatGuardError::SessionNotFound(session_id.to_string()))?;
        self.cipher.encrypt(session)
    }

    /// Import a blob produced by [`export_session`](Self::export_session).
    ///
    /// The imported session gets a new id, has every message sanitized again
    /// and becomes the current session. A blob that cannot be decrypted or
    /// does not look like a session is rejected with `false` and leaves the
    /// existing history untouched.
    pub async fn import_session(&self, blob: &str) -> bool {
        let now = self.now();
        let session = match self.parse_import(blob, now) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Rejected session import: {e}");
                self.guard.monitor().log_event(
                    SecurityEventKind::ImportRejected,
                    Severity::Medium,
                    e.to_string(),
                );
                return false;
            }
        };

        let mut state = self.state().await;
        self.compact(&mut state, now);
        let id = session.id.clone();
        let count = session.messages.len();
        state.sessions.push(session);
        state.current = Some(id.clone());
        self.write(&self.session, CURRENT_SESSION_KEY, &id).await;
        self.persist(&state).await;

        self.guard.monitor().log_event(
            SecurityEventKind::SessionImported,
            Severity::Low,
            format!("Imported session {id} with {count} message(s)"),
        );
        true
    }

    fn parse_import(&self, blob: &str, now: DateTime<Utc>) -> Result<ChatSession> {
        let value: serde_json::Value = self
            .cipher
            .decrypt(blob)
            .ok_or_else(|| ChatGuardError::InvalidImport("payload cannot be decrypted".into()))?;

        if !value.get("messages").is_some_and(serde_json::Value::is_array) {
            return Err(ChatGuardError::InvalidImport(
                "`messages` is missing or not an array".into(),
            ));
        }
        let mut session: ChatSession = serde_json::from_value(value)
            .map_err(|e| ChatGuardError::InvalidImport(e.to_string()))?;

        for message in &mut session.messages {
            let kind = if message.is_markdown {
                ContentKind::Markdown
            } else {
                ContentKind::Html
            };
            let sanitized = self.guard.sanitize_untrusted(&message.content, kind)?;
            if kind.changed(&message.content, &sanitized) {
                message.metadata.sanitized = true;
                session.metadata.security_events += 1;
            }
            message.metadata.security_checked = true;
            message.content = sanitized;
        }

        session.id = Uuid::new_v4().to_string();
        session.last_activity = now;
        session.metadata.encryption_enabled = self.cipher.is_enabled();
        session.trim_to(self.limits.max_history_size);
        Ok(session)
    }

    pub async fn stats(&self) -> HistoryStats {
        let state = self.state().await;
        let current_session_messages = state
            .current
            .as_ref()
            .and_then(|id| state.sessions.iter().find(|s| &s.id == id))
            .map_or(0, |s| s.messages.len());

        HistoryStats {
            total_sessions: state.sessions.len(),
            total_messages: state.sessions.iter().map(|s| s.messages.len()).sum(),
            current_session_messages,
            oldest_activity: state.sessions.iter().map(|s| s.last_activity).min(),
            encryption_enabled: self.cipher.is_enabled(),
        }
    }

    /// Prune expired sessions and persist the result. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.now();
        let mut state = self.state().await;
        let pruned = self.compact(&mut state, now);
        if pruned > 0 {
            self.persist(&state).await;
        }
        pruned
    }

    /// Random identifier this client is rate-limited under, persisted in
    /// the per-tab store.
    pub async fn client_id(&self) -> String {
        let mut state = self.state().await;
        if let Some(id) = &state.client_id {
            return id.clone();
        }

        let id = match self.read(&self.session, CLIENT_ID_KEY).await {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                let id = format!("client_{}", Uuid::new_v4().simple());
                self.write(&self.session, CLIENT_ID_KEY, &id).await;
                id
            }
        };
        state.client_id = Some(id.clone());
        id
    }

    fn now(&self) -> DateTime<Utc> {
        self.guard.clock().now()
    }

    /// Lock the state, loading it from storage on first use.
    async fn state(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            state.sessions = match self.local.get(HISTORY_KEY).await {
                Ok(Some(blob)) => self.cipher.decrypt(&blob).unwrap_or_default(),
                Ok(None) => Vec::new(),
                Err(e) => {
                    self.storage_failure("load chat history", &e);
                    Vec::new()
                }
            };
            state.current = self.read(&self.session, CURRENT_SESSION_KEY).await;
            state.loaded = true;
            tracing::debug!("Loaded {} chat session(s)", state.sessions.len());
        }
        state
    }

    /// Id of the current session, creating one if the stored id is missing
    /// or no longer points at a live session.
    async fn current_id(&self, state: &mut State, now: DateTime<Utc>) -> String {
        if let Some(id) = &state.current {
            if state.sessions.iter().any(|s| &s.id == id) {
                return id.clone();
            }
        }

        let session = ChatSession::new(Uuid::new_v4().to_string(), now, self.cipher.is_enabled());
        let id = session.id.clone();
        tracing::debug!("Starting chat session {id}");
        state.sessions.push(session);
        state.current = Some(id.clone());
        self.write(&self.session, CURRENT_SESSION_KEY, &id).await;
        self.persist(state).await;
        id
    }

    /// Drop expired sessions from memory. The caller persists.
    fn compact(&self, state: &mut State, now: DateTime<Utc>) -> usize {
        let max_age = self.limits.max_session_age;
        let before = state.sessions.len();
        state.sessions.retain(|s| !s.is_expired(now, max_age));
        let pruned = before - state.sessions.len();

        if pruned > 0 {
            let current_gone = state
                .current
                .as_ref()
                .is_some_and(|id| !state.sessions.iter().any(|s| &s.id == id));
            if current_gone {
                state.current = None;
            }
            self.guard.monitor().log_event(
                SecurityEventKind::SessionExpired,
                Severity::Low,
                format!("Pruned {pruned} expired session(s)"),
            );
        }
        pruned
    }

    async fn persist(&self, state: &State) {
        match self.cipher.encrypt(&state.sessions) {
            Ok(blob) => self.write(&self.local, HISTORY_KEY, &blob).await,
            Err(e) => tracing::error!("Failed to encrypt chat history: {e}"),
        }
    }

    async fn read<S: Storage>(&self, store: &S, key: &str) -> Option<String> {
        store.get(key).await.unwrap_or_else(|e| {
            self.storage_failure(&format!("read {key}"), &e);
            None
        })
    }

    async fn write<S: Storage>(&self, store: &S, key: &str, value: &str) {
        if let Err(e) = store.put(key, value).await {
            self.storage_failure(&format!("write {key}"), &e);
        }
    }

    async fn delete<S: Storage>(&self, store: &S, key: &str) {
        if let Err(e) = store.remove(key).await {
            self.storage_failure(&format!("remove {key}"), &e);
        }
    }

    fn storage_failure(&self, action: &str, err: &ChatGuardError) {
        tracing::error!("Failed to {action}: {err}");
        self.guard.monitor().log_event(
            SecurityEventKind::StorageFailure,
            Severity::Medium,
            format!("Failed to {action}: {err}"),
        );
    }
}
