//! # sheetshare-collab — live multi-editor sessions over a table
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ EditorClient │ ◄─────────────────► │ EditServer   │
//! │ (per editor) │     JSON frames     │ (per session)│
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                      ┌──────┴───────┐
//!                                      │ EditSession  │
//!                                      │  TableStore  │
//!                                      │  Registry    │
//!                                      │  BroadcastBus│
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`presence`] — connected editors and advisory cell locks
//! - [`broadcast`] — fan-out with duplicate suppression
//! - [`session`] — message dispatch and the session lifecycle
//! - [`server`] — WebSocket transport
//! - [`client`] — WebSocket client

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{
    BroadcastBus, BroadcastStats, DeliveryError, Frame, PublishOutcome, DEDUP_RETENTION,
    DEDUP_WINDOW,
};
pub use client::EditorClient;
pub use presence::{FocusChange, IdentityUpdate, SessionRegistry};
pub use protocol::{ClientMessage, Collaborator, EndReason, Handshake, ProtocolError, ServerMessage};
pub use server::{EditServer, ServerConfig, ServerStats};
pub use session::{
    CompletionFlag, EditSession, EditorConnection, SessionConfig, SessionError, SessionMode,
    SessionOutcome,
};
