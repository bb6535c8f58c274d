//! Fan-out of session events to connected editors.
//!
//! Each editor owns a bounded outbound queue. A publish serializes the event
//! once and pushes the same `Arc<str>` frame into every recipient's queue,
//! optionally skipping the originator. Pushing never waits: a full or closed
//! queue is a per-recipient delivery failure, logged and counted, and the
//! remaining recipients still get the frame. Ordering per recipient is the
//! publish order.
//!
//! A recipient that misses a frame is unsubscribed on the spot. Its
//! receiver drains what was already queued and then yields `None`, so the
//! connection closes instead of carrying on with a gap. The editor
//! reconnects and starts over from a fresh `init`.
//!
//! Duplicate suppression: every event has a signature (kind + actor +
//! target + value). A publish whose signature was already published less
//! than [`DEDUP_WINDOW`] ago is dropped for everyone. Signatures older than
//! [`DEDUP_RETENTION`] are swept on each publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Identical events closer together than this are delivered once.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(300);

/// Signatures older than this are forgotten.
pub const DEDUP_RETENTION: Duration = Duration::from_secs(5);

/// A pre-encoded JSON frame, shared between all recipients of one publish.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    /// Publishes that went out (not suppressed)
    pub messages_sent: u64,
    /// Per-recipient delivery failures
    pub messages_dropped: u64,
    /// Publishes suppressed as duplicates
    pub duplicates_suppressed: u64,
    /// Recipients unsubscribed after a failed delivery
    pub editors_evicted: u64,
    pub active_editors: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    duplicates_suppressed: AtomicU64,
    editors_evicted: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            editors_evicted: AtomicU64::new(0),
        }
    }
}

/// Failure to hand a frame to one recipient.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("editor {0} is no longer connected")]
    Disconnected(Uuid),
    #[error("outbound queue for editor {0} is full")]
    Backlogged(Uuid),
    #[error("editor {0} is not subscribed")]
    UnknownRecipient(Uuid),
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to this many recipients
    Delivered(usize),
    /// Same signature seen within the dedup window; nobody received it
    Suppressed,
}

/// Per-session fan-out with duplicate suppression.
pub struct BroadcastBus {
    recipients: HashMap<Uuid, mpsc::Sender<Frame>>,
    /// signature → time of last delivered publish
    recent: HashMap<String, Instant>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastBus {
    /// `capacity` is the depth of each editor's outbound queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            recipients: HashMap::new(),
            recent: HashMap::new(),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Create the outbound queue for an editor.
    pub fn subscribe(&mut self, editor_id: Uuid) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.recipients.insert(editor_id, tx);
        rx
    }

    pub fn unsubscribe(&mut self, editor_id: &Uuid) -> bool {
        self.recipients.remove(editor_id).is_some()
    }

    /// Drop every outbound queue. Receivers drain what is queued, then close.
    pub fn close_all(&mut self) {
        self.recipients.clear();
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of signatures currently remembered for deduplication.
    pub fn tracked_signatures(&self) -> usize {
        self.recent.len()
    }

    /// Send directly to one editor. Replies bypass deduplication.
    pub fn send_to(&mut self, editor_id: Uuid, msg: &ServerMessage) -> Result<(), DeliveryError> {
        let frame: Frame = match msg.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                log::error!("Failed to encode {} reply: {e}", msg.kind());
                return Ok(());
            }
        };
        let tx = self
            .recipients
            .get(&editor_id)
            .ok_or(DeliveryError::UnknownRecipient(editor_id))?;
        let result = Self::deliver(editor_id, tx, frame);
        if let Err(e) = &result {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("Reply {} not delivered: {e}", msg.kind());
            self.evict(editor_id);
        }
        result
    }

    /// Publish to every editor except `exclude`.
    pub fn publish(
        &mut self,
        msg: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> Result<PublishOutcome, ProtocolError> {
        self.publish_at(msg, exclude, Instant::now())
    }

    /// [`publish`](Self::publish) with an explicit clock reading.
    pub fn publish_at(
        &mut self,
        msg: &ServerMessage,
        exclude: Option<Uuid>,
        now: Instant,
    ) -> Result<PublishOutcome, ProtocolError> {
        self.recent
            .retain(|_, seen| now.saturating_duration_since(*seen) <= DEDUP_RETENTION);

        let signature = msg.signature();
        if let Some(seen) = self.recent.get(&signature) {
            if now.saturating_duration_since(*seen) < DEDUP_WINDOW {
                self.stats.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Suppressed duplicate {} broadcast ({signature})", msg.kind());
                return Ok(PublishOutcome::Suppressed);
            }
        }

        let frame: Frame = msg.encode()?.into();
        self.recent.insert(signature, now);

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (editor_id, tx) in &self.recipients {
            if Some(*editor_id) == exclude {
                continue;
            }
            match Self::deliver(*editor_id, tx, frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Broadcast {} skipped a recipient: {e}", msg.kind());
                    failed.push(*editor_id);
                }
            }
        }
        for editor_id in failed {
            self.evict(editor_id);
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Broadcast {} to {delivered} editor(s)", msg.kind());
        Ok(PublishOutcome::Delivered(delivered))
    }

    /// Drop a recipient that missed a frame.
    fn evict(&mut self, editor_id: Uuid) {
        if self.recipients.remove(&editor_id).is_some() {
            self.stats.editors_evicted.fetch_add(1, Ordering::Relaxed);
            log::warn!("Editor {editor_id} fell behind and was unsubscribed");
        }
    }

    fn deliver(editor_id: Uuid, tx: &mpsc::Sender<Frame>, frame: Frame) -> Result<(), DeliveryError> {
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged(editor_id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected(editor_id),
        })
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            duplicates_suppressed: self.stats.duplicates_suppressed.load(Ordering::Relaxed),
            editors_evicted: self.stats.editors_evicted.load(Ordering::Relaxed),
            active_editors: self.recipients.len(),
        }
    }
}
