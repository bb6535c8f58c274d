//! One live editing session: the table, the editors and the fan-out.
//!
//! ```text
//!  editor A ──┐                      ┌── DtypeGuard ── TableStore
//!  editor B ──┼── handle_message ────┤
//!  editor C ──┘       (locked)       └── SessionRegistry ── BroadcastBus ──► outbound queues
//! ```
//!
//! Every mutation runs to completion under one async mutex; nothing awaits
//! while the state is borrowed, so each message is applied atomically with
//! respect to every other connection. Outbound delivery never waits either:
//! frames are queued and each connection task drains its own queue.
//!
//! Connection lifecycle: [`EditSession::connect`] (Connecting → Active)
//! registers the editor, queues the `init` handshake and announces the new
//! editor to everyone else. [`EditSession::disconnect`] (→ Disconnected)
//! releases its cell locks and announces `user_left`.
//!
//! Session lifecycle: `save` replaces the table and keeps going; `cancel`
//! and `shutdown` end the session exactly once and set the
//! [`CompletionFlag`] that [`EditSession::wait_for_end`] observes.

use serde_json::Value;
use sheetshare_core::{CellValue, DtypeGuard, Record, Table, TableError, TableStore};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::broadcast::{BroadcastBus, BroadcastStats, Frame};
use crate::presence::{IdentityUpdate, SessionRegistry};
use crate::protocol::{ClientMessage, Collaborator, EndReason, Handshake, ServerMessage};

/// Whether other editors exist from the session's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Any number of editors, with presence and change notices
    #[default]
    Collaborative,
    /// A single editor; presence traffic is not sent
    Solo,
}

/// Per-session knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: SessionMode,
    /// Coerce edits to column types (see [`DtypeGuard`])
    pub strict_types: bool,
    /// Connection limit in collaborative mode
    pub max_editors: usize,
    /// Depth of each editor's outbound queue
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Collaborative,
            strict_types: true,
            max_editors: 100,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// The number of editors allowed at once.
    pub fn editor_limit(&self) -> usize {
        match self.mode {
            SessionMode::Collaborative => self.max_editors.max(1),
            SessionMode::Solo => 1,
        }
    }
}

/// How a session ended, with the table handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Ended normally; the table holds every accepted edit
    Shutdown(Table),
    /// Edits discarded; the table is the one the session started with
    Cancelled(Table),
}

impl SessionOutcome {
    pub fn reason(&self) -> EndReason {
        match self {
            SessionOutcome::Shutdown(_) => EndReason::Shutdown,
            SessionOutcome::Cancelled(_) => EndReason::Cancelled,
        }
    }

    pub fn table(&self) -> &Table {
        match self {
            SessionOutcome::Shutdown(t) | SessionOutcome::Cancelled(t) => t,
        }
    }

    pub fn into_table(self) -> Table {
        match self {
            SessionOutcome::Shutdown(t) | SessionOutcome::Cancelled(t) => t,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("the session has ended")]
    SessionEnded,
    #[error("the session is full ({0} editors)")]
    EditorLimitReached(usize),
    #[error("editor {0} is not connected")]
    UnknownEditor(Uuid),
    #[error(transparent)]
    Table(#[from] TableError),
}

impl SessionError {
    /// Stable machine-readable code used in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::SessionEnded => "session_ended",
            SessionError::EditorLimitReached(_) => "editor_limit",
            SessionError::UnknownEditor(_) => "unknown_editor",
            SessionError::Table(e) => e.code(),
        }
    }

    /// Frame sent to the editor whose request failed.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}

/// Set-once signal that the session is over.
///
/// Setting is idempotent: the first outcome wins and later calls are
/// ignored. Any number of tasks may wait on it.
#[derive(Debug)]
pub struct CompletionFlag {
    tx: watch::Sender<Option<SessionOutcome>>,
}

impl Default for CompletionFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record the outcome. Returns `false` if one was already recorded.
    pub fn set(&self, outcome: SessionOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.tx.borrow().clone()
    }

    /// A receiver that changes once, when the outcome is recorded.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionOutcome>> {
        self.tx.subscribe()
    }

    /// Wait until an outcome is recorded.
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            // The sender lives in `self`, so the channel stays open while we wait.
            let _ = rx.changed().await;
        }
    }
}

/// Handle returned to a newly connected editor.
#[derive(Debug)]
pub struct EditorConnection {
    pub editor_id: Uuid,
    /// Frames for this editor, starting with the `init` handshake. Closes
    /// when the editor disconnects or the session ends.
    pub outbound: mpsc::Receiver<Frame>,
}

struct SessionState {
    store: TableStore,
    registry: SessionRegistry,
    bus: BroadcastBus,
    /// Columns created through `add_column` (renames followed)
    added_columns: Vec<String>,
    /// Successful saves so far
    save_version: u64,
    ended: bool,
}

impl SessionState {
    fn broadcast(&mut self, msg: ServerMessage, exclude: Option<Uuid>) {
        if let Err(e) = self.bus.publish(&msg, exclude) {
            log::error!("Failed to broadcast {}: {e}", msg.kind());
        }
    }

    fn reply(&mut self, editor_id: Uuid, msg: ServerMessage) {
        // Failures are logged and counted by the bus.
        let _ = self.bus.send_to(editor_id, &msg);
    }

    fn added_rows(&self) -> usize {
        self.store
            .row_count()
            .saturating_sub(self.store.original().row_count())
    }

    fn handshake(&self, editor_id: Uuid) -> Handshake {
        Handshake {
            user_id: editor_id,
            collaborators: self.registry.roster_except(&editor_id),
            columns: self.store.table().columns().to_vec(),
            added_columns: self.added_columns.clone(),
            current_data: self.store.snapshot(),
            added_rows: self.added_rows(),
        }
    }
}

/// A collaborative editing session over one table.
pub struct EditSession {
    config: SessionConfig,
    guard: DtypeGuard,
    state: Mutex<SessionState>,
    completion: CompletionFlag,
}

impl EditSession {
    pub fn new(table: Table, config: SessionConfig) -> Self {
        log::info!(
            "Session created: {} rows x {} columns, {:?} mode, strict types {}",
            table.row_count(),
            table.column_count(),
            config.mode,
            config.strict_types
        );
        let state = SessionState {
            store: TableStore::new(table),
            registry: SessionRegistry::new(),
            bus: BroadcastBus::new(config.outbound_capacity),
            added_columns: Vec::new(),
            save_version: 0,
            ended: false,
        };
        Self {
            guard: DtypeGuard::new(config.strict_types),
            config,
            state: Mutex::new(state),
            completion: CompletionFlag::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn collaborative(&self) -> bool {
        self.config.mode == SessionMode::Collaborative
    }

    /// Presence and roster traffic is only sent in collaborative mode.
    fn announce(&self, state: &mut SessionState, msg: ServerMessage, exclude: Option<Uuid>) {
        if self.collaborative() {
            state.broadcast(msg, exclude);
        }
    }

    /// Admit a new editor.
    ///
    /// The returned queue already holds the `init` handshake; every other
    /// editor is sent `user_joined`.
    pub async fn connect(&self) -> Result<EditorConnection, SessionError> {
        let mut state = self.state.lock().await;
        if state.ended {
            return Err(SessionError::SessionEnded);
        }
        let limit = self.config.editor_limit();
        if state.registry.len() >= limit {
            log::warn!("Refusing editor: session is full ({limit})");
            return Err(SessionError::EditorLimitReached(limit));
        }

        let editor_id = state.registry.register();
        let outbound = state.bus.subscribe(editor_id);
        let handshake = state.handshake(editor_id);
        state.reply(editor_id, ServerMessage::Init(handshake));

        if let Some(user) = state.registry.get(&editor_id).cloned() {
            log::info!("Editor {} ({}) joined, {} connected", user.name, editor_id, state.registry.len());
            self.announce(&mut state, ServerMessage::UserJoined { user }, Some(editor_id));
        }
        Ok(EditorConnection { editor_id, outbound })
    }

    /// Remove an editor, release its locks and tell the others.
    pub async fn disconnect(&self, editor_id: Uuid) {
        let mut state = self.state.lock().await;
        state.bus.unsubscribe(&editor_id);
        let Some((user, released_cells)) = state.registry.unregister(&editor_id) else {
            return;
        };
        log::info!(
            "Editor {} ({}) left, released {} cell(s)",
            user.name,
            editor_id,
            released_cells.len()
        );
        if !state.ended {
            self.announce(
                &mut state,
                ServerMessage::UserLeft { user_id: editor_id, released_cells },
                None,
            );
        }
    }

    /// Decode and handle one text frame from `editor_id`.
    ///
    /// Undecodable frames are answered with an `invalid_message` error and
    /// otherwise ignored.
    pub async fn handle_text(&self, editor_id: Uuid, text: &str) -> Result<(), SessionError> {
        match ClientMessage::decode(text) {
            Ok(msg) => self.handle_message(editor_id, msg).await,
            Err(e) => {
                log::warn!("Undecodable frame from {editor_id}: {e}");
                let mut state = self.state.lock().await;
                state.reply(editor_id, ServerMessage::error("invalid_message", e.to_string()));
                Ok(())
            }
        }
    }

    /// Apply one message from `editor_id`.
    ///
    /// A rejected request is reported to the sender only and returned as
    /// `Err`; it never affects other editors.
    pub async fn handle_message(&self, editor_id: Uuid, msg: ClientMessage) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let result = self.dispatch(&mut state, editor_id, msg);
        if let Err(e) = &result {
            log::debug!("Rejected request from {editor_id}: {e}");
            if !matches!(e, SessionError::Table(TableError::TypeMismatch { .. })) {
                state.reply(editor_id, e.to_message());
            }
        }
        result
    }

    fn dispatch(
        &self,
        state: &mut SessionState,
        editor_id: Uuid,
        msg: ClientMessage,
    ) -> Result<(), SessionError> {
        if state.ended {
            return Err(SessionError::SessionEnded);
        }
        if !state.registry.contains(&editor_id) {
            return Err(SessionError::UnknownEditor(editor_id));
        }

        match msg {
            ClientMessage::UpdateUser { name, color, cursor, email } => {
                let update = IdentityUpdate { name, color, cursor, email };
                if let Some(user) = state.registry.update_identity(&editor_id, update).cloned() {
                    self.announce(state, ServerMessage::UpdateUser { user }, None);
                }
            }
            ClientMessage::CellFocus { cell_id } => {
                if let Some(change) = state.registry.focus(&cell_id, &editor_id) {
                    if let Some(previous) = change.released {
                        self.announce(state, ServerMessage::CellBlur { cell_id: previous, user_id: editor_id }, None);
                    }
                    if let Some(holder) = change.displaced {
                        self.announce(state, ServerMessage::CellBlur { cell_id: cell_id.clone(), user_id: holder }, None);
                    }
                }
                self.announce(state, ServerMessage::CellFocus { cell_id, user_id: editor_id }, None);
            }
            ClientMessage::CellBlur { cell_id } => {
                if state.registry.blur(&cell_id, &editor_id) {
                    self.announce(state, ServerMessage::CellBlur { cell_id, user_id: editor_id }, None);
                }
            }
            ClientMessage::CellEdit { row_id, column, value, operation_id } => {
                return self.edit_cell(state, editor_id, row_id, column, value, operation_id);
            }
            ClientMessage::CursorPosition { position } => {
                state.registry.set_cursor(&editor_id, position.clone());
                self.announce(
                    state,
                    ServerMessage::CursorPosition { user_id: editor_id, position },
                    Some(editor_id),
                );
            }
            ClientMessage::AddColumn { column_name, operation_id } => {
                if state.store.add_column(&column_name, CellValue::Text(String::new())) {
                    log::debug!("Editor {editor_id} added column {column_name:?}");
                    state.added_columns.push(column_name.clone());
                }
                state.broadcast(
                    ServerMessage::AddColumn { column_name, user_id: editor_id, operation_id },
                    None,
                );
            }
            ClientMessage::AddRow { row_id, operation_id } => {
                let row_index = state.store.add_row();
                log::debug!("Editor {editor_id} added row {row_index}");
                state.broadcast(
                    ServerMessage::AddRow { row_id, row_index, user_id: editor_id, operation_id },
                    None,
                );
            }
            ClientMessage::RenameColumn { old_name, new_name, operation_id } => {
                state.store.rename_column(&old_name, &new_name)?;
                for name in state.added_columns.iter_mut().filter(|n| **n == old_name) {
                    *name = new_name.clone();
                }
                state.broadcast(
                    ServerMessage::RenameColumn { old_name, new_name, user_id: editor_id, operation_id },
                    None,
                );
            }
            ClientMessage::ReorderColumns { columns, operation_id } => {
                state.store.reorder_columns(&columns)?;
                state.broadcast(
                    ServerMessage::ReorderColumns { columns, user_id: editor_id, operation_id },
                    None,
                );
            }
            ClientMessage::UserFinishing => {
                let name = state
                    .registry
                    .get(&editor_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_default();
                self.announce(state, ServerMessage::UserFinishing { user_id: editor_id, name }, None);
            }
            ClientMessage::Ping { timestamp } => {
                state.reply(editor_id, ServerMessage::Pong { timestamp });
            }
            ClientMessage::FetchData => {
                let rows = state.store.snapshot();
                state.reply(editor_id, ServerMessage::Data { rows });
            }
            ClientMessage::SaveData { data } => {
                let rows = self.save_locked(state, data, Some(editor_id))?;
                state.reply(editor_id, ServerMessage::SaveResult { rows });
            }
            ClientMessage::Cancel => self.end_locked(state, EndReason::Cancelled)?,
            ClientMessage::Shutdown => self.end_locked(state, EndReason::Shutdown)?,
        }
        Ok(())
    }

    fn edit_cell(
        &self,
        state: &mut SessionState,
        editor_id: Uuid,
        row_id: usize,
        column: String,
        value: Value,
        operation_id: Option<String>,
    ) -> Result<(), SessionError> {
        match state.store.edit_cell(row_id, &column, &value, &self.guard) {
            Ok(stored) => {
                log::debug!("Editor {editor_id} set {row_id}:{column} = {stored:?}");
                state.broadcast(
                    ServerMessage::CellEdit {
                        row_id,
                        column,
                        value: stored.to_json(),
                        user_id: editor_id,
                        operation_id,
                    },
                    None,
                );
                Ok(())
            }
            Err(e) => {
                if let TableError::TypeMismatch { expected, .. } = &e {
                    state.reply(
                        editor_id,
                        ServerMessage::DtypeError {
                            row_id,
                            column,
                            value,
                            expected: *expected,
                            message: e.to_string(),
                        },
                    );
                }
                Err(e.into())
            }
        }
    }

    fn save_locked(
        &self,
        state: &mut SessionState,
        rows: Vec<Record>,
        origin: Option<Uuid>,
    ) -> Result<usize, SessionError> {
        if state.ended {
            return Err(SessionError::SessionEnded);
        }
        state.store.replace_all(rows)?;
        let columns = state.store.table().column_names();
        state.added_columns.retain(|name| columns.contains(name));

        state.save_version += 1;
        let version = state.save_version;
        let count = state.store.row_count();
        log::info!("Table saved: {count} rows (version {version})");
        if self.collaborative() {
            state.broadcast(ServerMessage::DataChanged { user_id: origin, version }, None);
        }
        Ok(count)
    }

    fn end_locked(&self, state: &mut SessionState, reason: EndReason) -> Result<(), SessionError> {
        if state.ended {
            return Err(SessionError::SessionEnded);
        }
        if reason == EndReason::Cancelled {
            state.store.revert_to_original();
        }
        state.ended = true;
        state.broadcast(ServerMessage::SessionEnded { reason }, None);
        state.bus.close_all();

        let table = state.store.table().clone();
        let outcome = match reason {
            EndReason::Shutdown => SessionOutcome::Shutdown(table),
            EndReason::Cancelled => SessionOutcome::Cancelled(table),
        };
        log::info!(
            "Session ended ({reason:?}): {} rows x {} columns",
            outcome.table().row_count(),
            outcome.table().column_count()
        );
        self.completion.set(outcome);
        Ok(())
    }

    /// Replace the whole table and keep the session going.
    ///
    /// Returns the new row count. Other editors receive `data_changed` in
    /// collaborative mode.
    pub async fn save(&self, rows: Vec<Record>) -> Result<usize, SessionError> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state, rows, None)
    }

    /// Discard every edit and end the session.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        self.end_locked(&mut state, EndReason::Cancelled)
    }

    /// End the session, handing back the current table.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        self.end_locked(&mut state, EndReason::Shutdown)
    }

    pub fn is_ended(&self) -> bool {
        self.completion.is_set()
    }

    pub fn completion(&self) -> &CompletionFlag {
        &self.completion
    }

    /// Resolve once the session has been cancelled or shut down.
    pub async fn wait_for_end(&self) -> SessionOutcome {
        self.completion.wait().await
    }

    pub async fn snapshot(&self) -> Vec<Record> {
        self.state.lock().await.store.snapshot()
    }

    pub async fn table(&self) -> Table {
        self.state.lock().await.store.table().clone()
    }

    /// Connected editors in join order.
    pub async fn collaborators(&self) -> Vec<Collaborator> {
        self.state.lock().await.registry.roster()
    }

    pub async fn editor_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.state.lock().await.bus.stats()
    }
}
