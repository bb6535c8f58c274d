//! JSON wire protocol between editors and the session server.
//!
//! Every frame is a WebSocket text message holding one JSON object,
//! tagged by `"type"` (snake_case) with camelCase fields:
//!
//! ```text
//! → {"type":"cell_edit","rowId":0,"column":"col1","value":"7","operationId":"op-1"}
//! ← {"type":"cell_edit","rowId":0,"column":"col1","value":7,"userId":"…","operationId":"op-1"}
//! ```
//!
//! Clients send [`ClientMessage`]; the server answers and fans out
//! [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetshare_core::{Column, DType, Record};
use uuid::Uuid;

/// Public identity of a connected editor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: Uuid,
    pub name: String,
    /// CSS hex color, e.g. `#3d7be0`
    pub color: String,
    /// Last reported cursor/focus position (opaque to the server)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Payload of the first frame every editor receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub user_id: Uuid,
    /// Every other editor currently connected, in join order
    pub collaborators: Vec<Collaborator>,
    pub columns: Vec<Column>,
    /// Columns added since the session started
    pub added_columns: Vec<String>,
    pub current_data: Vec<Record>,
    /// Rows added since the session started
    pub added_rows: usize,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Shutdown,
    Cancelled,
}

/// Editor → server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    UpdateUser {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        cursor: Option<Value>,
        #[serde(default)]
        email: Option<String>,
    },
    CellFocus {
        cell_id: String,
    },
    CellBlur {
        cell_id: String,
    },
    CellEdit {
        row_id: usize,
        column: String,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        operation_id: Option<String>,
    },
    CursorPosition {
        #[serde(default)]
        position: Value,
    },
    AddColumn {
        column_name: String,
        #[serde(default)]
        operation_id: Option<String>,
    },
    AddRow {
        /// Client-side id for the optimistic row, echoed back untouched
        #[serde(default)]
        row_id: Option<Value>,
        #[serde(default)]
        operation_id: Option<String>,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
        #[serde(default)]
        operation_id: Option<String>,
    },
    ReorderColumns {
        columns: Vec<String>,
        #[serde(default)]
        operation_id: Option<String>,
    },
    /// The editor is about to save or leave
    UserFinishing,
    /// Liveness probe, answered to the sender only
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    FetchData,
    SaveData {
        data: Vec<Record>,
    },
    Cancel,
    Shutdown,
}

/// Server → editor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Init(Handshake),
    UserJoined {
        user: Collaborator,
    },
    UserLeft {
        user_id: Uuid,
        released_cells: Vec<String>,
    },
    UpdateUser {
        user: Collaborator,
    },
    CellFocus {
        cell_id: String,
        user_id: Uuid,
    },
    CellBlur {
        cell_id: String,
        user_id: Uuid,
    },
    CellEdit {
        row_id: usize,
        column: String,
        value: Value,
        user_id: Uuid,
        operation_id: Option<String>,
    },
    CursorPosition {
        user_id: Uuid,
        position: Value,
    },
    AddColumn {
        column_name: String,
        user_id: Uuid,
        operation_id: Option<String>,
    },
    AddRow {
        row_id: Option<Value>,
        row_index: usize,
        user_id: Uuid,
        operation_id: Option<String>,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
        user_id: Uuid,
        operation_id: Option<String>,
    },
    ReorderColumns {
        columns: Vec<String>,
        user_id: Uuid,
        operation_id: Option<String>,
    },
    UserFinishing {
        user_id: Uuid,
        name: String,
    },
    Pong {
        timestamp: Option<Value>,
    },
    /// A cell edit was rejected by the type guard
    DtypeError {
        row_id: usize,
        column: String,
        value: Value,
        expected: DType,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    Data {
        rows: Vec<Record>,
    },
    /// The whole table was replaced by a save
    DataChanged {
        user_id: Option<Uuid>,
        /// Counts saves in this session, starting at 1
        version: u64,
    },
    SaveResult {
        rows: usize,
    },
    SessionEnded {
        reason: EndReason,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// The `"type"` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Init(_) => "init",
            ServerMessage::UserJoined { .. } => "user_joined",
            ServerMessage::UserLeft { .. } => "user_left",
            ServerMessage::UpdateUser { .. } => "update_user",
            ServerMessage::CellFocus { .. } => "cell_focus",
            ServerMessage::CellBlur { .. } => "cell_blur",
            ServerMessage::CellEdit { .. } => "cell_edit",
            ServerMessage::CursorPosition { .. } => "cursor_position",
            ServerMessage::AddColumn { .. } => "add_column",
            ServerMessage::AddRow { .. } => "add_row",
            ServerMessage::RenameColumn { .. } => "rename_column",
            ServerMessage::ReorderColumns { .. } => "reorder_columns",
            ServerMessage::UserFinishing { .. } => "user_finishing",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::DtypeError { .. } => "dtype_error",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Data { .. } => "data",
            ServerMessage::DataChanged { .. } => "data_changed",
            ServerMessage::SaveResult { .. } => "save_result",
            ServerMessage::SessionEnded { .. } => "session_ended",
        }
    }

    /// Deduplication key: kind + actor + target + value.
    ///
    /// Two events with the same signature are considered the same event
    /// re-sent; any difference in actor, target cell or value makes them
    /// distinct.
    pub fn signature(&self) -> String {
        let (actor, target, value): (Option<Uuid>, String, String) = match self {
            ServerMessage::Init(h) => (Some(h.user_id), String::new(), String::new()),
            ServerMessage::UserJoined { user } | ServerMessage::UpdateUser { user } => (
                Some(user.user_id),
                String::new(),
                serde_json::to_string(user).unwrap_or_default(),
            ),
            ServerMessage::UserLeft { user_id, released_cells } => {
                (Some(*user_id), String::new(), released_cells.join(","))
            }
            ServerMessage::CellFocus { cell_id, user_id }
            | ServerMessage::CellBlur { cell_id, user_id } => {
                (Some(*user_id), cell_id.clone(), String::new())
            }
            ServerMessage::CellEdit { row_id, column, value, user_id, .. } => {
                (Some(*user_id), format!("{row_id}:{column}"), value.to_string())
            }
            ServerMessage::CursorPosition { user_id, position } => {
                (Some(*user_id), String::new(), position.to_string())
            }
            ServerMessage::AddColumn { column_name, user_id, .. } => {
                (Some(*user_id), column_name.clone(), String::new())
            }
            ServerMessage::AddRow { row_id, row_index, user_id, .. } => (
                Some(*user_id),
                row_index.to_string(),
                row_id.as_ref().map(Value::to_string).unwrap_or_default(),
            ),
            ServerMessage::RenameColumn { old_name, new_name, user_id, .. } => {
                (Some(*user_id), old_name.clone(), new_name.clone())
            }
            ServerMessage::ReorderColumns { columns, user_id, .. } => {
                (Some(*user_id), String::new(), columns.join(","))
            }
            ServerMessage::UserFinishing { user_id, name } => (Some(*user_id), String::new(), name.clone()),
            ServerMessage::Pong { timestamp } => (
                None,
                String::new(),
                timestamp.as_ref().map(Value::to_string).unwrap_or_default(),
            ),
            ServerMessage::DtypeError { row_id, column, value, .. } => {
                (None, format!("{row_id}:{column}"), value.to_string())
            }
            ServerMessage::Error { code, message } => (None, code.clone(), message.clone()),
            ServerMessage::Data { rows } => (None, String::new(), rows.len().to_string()),
            ServerMessage::DataChanged { user_id, version } => (*user_id, String::new(), version.to_string()),
            ServerMessage::SaveResult { rows } => (None, String::new(), rows.to_string()),
            ServerMessage::SessionEnded { reason } => (None, String::new(), format!("{reason:?}")),
        };
        let actor = actor.map(|id| id.to_string()).unwrap_or_default();
        format!("{}|{actor}|{target}|{value}", self.kind())
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// First frame from the server was not a handshake
    UnexpectedMessage(String),
    /// The server refused the connection
    Rejected { code: String, message: String },
    ConnectionClosed,
    Timeout,
    Transport(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(kind) => write!(f, "Unexpected message: {kind}"),
            Self::Rejected { code, message } => write!(f, "Rejected ({code}): {message}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}
