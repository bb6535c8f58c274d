//! Editor presence: identities, cursors and advisory cell locks.
//!
//! ```text
//! connect ──► register() ──► Collaborator { id, "Editor N", color }
//!                 │
//!   update_user ──┼──► update_identity()
//!   cell_focus  ──┼──► focus()   ──► locks[cell] = editor, old locks released
//!   cell_blur   ──┼──► blur()    ──► locks.remove(cell) if owned
//!                 │
//! disconnect ─────┴──► unregister() ──► released cells
//! ```
//!
//! Locks are informational only. Nothing in the session consults them
//! before applying an edit; they exist so clients can highlight which cell
//! another editor is working in. Every lock an editor holds is released when
//! it disconnects, so the lock map never outlives its owners.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use crate::protocol::Collaborator;

/// Fields an `update_user` message may overwrite. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub cursor: Option<Value>,
    pub email: Option<String>,
}

/// Locks given up as a side effect of [`SessionRegistry::focus`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusChange {
    /// Cell the focusing editor held before
    pub released: Option<String>,
    /// Editor that held the newly focused cell
    pub displaced: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct EditorEntry {
    info: Collaborator,
    /// Join sequence number, for a stable roster order
    seq: u64,
    /// Cell this editor currently has focus on
    focused: Option<String>,
    joined_at: Instant,
}

/// All editors connected to one session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    editors: HashMap<Uuid, EditorEntry>,
    /// cell id → editor holding focus on it
    locks: HashMap<String, Uuid>,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new editor with a fresh id, a default name and a stable color.
    pub fn register(&mut self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.next_seq += 1;
        let info = Collaborator {
            user_id,
            name: format!("Editor {}", self.next_seq),
            color: color_for(user_id),
            cursor: None,
            email: None,
        };
        self.editors.insert(
            user_id,
            EditorEntry {
                info,
                seq: self.next_seq,
                focused: None,
                joined_at: Instant::now(),
            },
        );
        user_id
    }

    pub fn get(&self, editor_id: &Uuid) -> Option<&Collaborator> {
        self.editors.get(editor_id).map(|e| &e.info)
    }

    pub fn contains(&self, editor_id: &Uuid) -> bool {
        self.editors.contains_key(editor_id)
    }

    pub fn len(&self) -> usize {
        self.editors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.editors.is_empty()
    }

    /// Overwrite the provided fields. Unknown editors are ignored; late
    /// messages from a client that just disconnected land here.
    pub fn update_identity(&mut self, editor_id: &Uuid, update: IdentityUpdate) -> Option<&Collaborator> {
        let entry = self.editors.get_mut(editor_id)?;
        if let Some(name) = update.name {
            entry.info.name = name;
        }
        if let Some(color) = update.color {
            entry.info.color = color;
        }
        if let Some(cursor) = update.cursor {
            entry.info.cursor = Some(cursor);
        }
        if let Some(email) = update.email {
            entry.info.email = Some(email);
        }
        Some(&entry.info)
    }

    pub fn set_cursor(&mut self, editor_id: &Uuid, position: Value) -> bool {
        match self.editors.get_mut(editor_id) {
            Some(entry) => {
                entry.info.cursor = Some(position);
                true
            }
            None => false,
        }
    }

    /// Mark `cell_id` as focused by `editor_id`.
    ///
    /// Focus is advisory: a cell focused by someone else is simply taken
    /// over. An editor focuses one cell at a time, so its previous lock is
    /// dropped. Returns the locks this released, or `None` for unknown editors.
    pub fn focus(&mut self, cell_id: &str, editor_id: &Uuid) -> Option<FocusChange> {
        let entry = self.editors.get_mut(editor_id)?;
        let mut change = FocusChange::default();
        if let Some(previous) = entry.focused.replace(cell_id.to_string()) {
            if previous != cell_id && self.locks.get(&previous) == Some(editor_id) {
                self.locks.remove(&previous);
                change.released = Some(previous);
            }
        }
        if let Some(prior_owner) = self.locks.insert(cell_id.to_string(), *editor_id) {
            if prior_owner != *editor_id {
                if let Some(other) = self.editors.get_mut(&prior_owner) {
                    other.focused = None;
                }
                change.displaced = Some(prior_owner);
            }
        }
        Some(change)
    }

    /// Release `cell_id` if `editor_id` holds it. Returns whether a lock was released.
    pub fn blur(&mut self, cell_id: &str, editor_id: &Uuid) -> bool {
        if self.locks.get(cell_id) != Some(editor_id) {
            return false;
        }
        self.locks.remove(cell_id);
        if let Some(entry) = self.editors.get_mut(editor_id) {
            if entry.focused.as_deref() == Some(cell_id) {
                entry.focused = None;
            }
        }
        true
    }

    pub fn lock_holder(&self, cell_id: &str) -> Option<Uuid> {
        self.locks.get(cell_id).copied()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Remove an editor and every lock it held.
    ///
    /// Returns the editor's last identity and the released cell ids (sorted),
    /// or `None` if the editor was already gone.
    pub fn unregister(&mut self, editor_id: &Uuid) -> Option<(Collaborator, Vec<String>)> {
        let entry = self.editors.remove(editor_id)?;
        let mut released: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, owner)| *owner == editor_id)
            .map(|(cell, _)| cell.clone())
            .collect();
        for cell in &released {
            self.locks.remove(cell);
        }
        released.sort();
        log::debug!(
            "Editor {} left after {:?}, released {} lock(s)",
            entry.info.name,
            entry.joined_at.elapsed(),
            released.len()
        );
        Some((entry.info, released))
    }

    /// Every editor, in join order.
    pub fn roster(&self) -> Vec<Collaborator> {
        let mut entries: Vec<&EditorEntry> = self.editors.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    /// Every editor except `editor_id`, in join order.
    pub fn roster_except(&self, editor_id: &Uuid) -> Vec<Collaborator> {
        self.roster()
            .into_iter()
            .filter(|c| c.user_id != *editor_id)
            .collect()
    }
}

/// Stable, vivid CSS color derived from an editor id.
pub fn color_for(id: Uuid) -> String {
    let hash = id.as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_defaults() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.get(&a).unwrap().name, "Editor 1");
        assert_eq!(registry.get(&b).unwrap().name, "Editor 2");
        assert!(registry.get(&a).unwrap().color.starts_with('#'));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(color_for(id), color_for(id));
        assert_eq!(color_for(id).len(), 7);
    }

    #[test]
    fn test_update_identity_partial() {
        let mut registry = SessionRegistry::new();
        let id = registry.register();
        let color = registry.get(&id).unwrap().color.clone();
        let updated = registry
            .update_identity(
                &id,
                IdentityUpdate {
                    name: Some("Ada".into()),
                    email: Some("ada@example.com".into()),
                    ..IdentityUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Ada");
        assert_eq!(updated.color, color);
        assert_eq!(updated.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_update_identity_unknown_is_noop() {
        let mut registry = SessionRegistry::new();
        assert!(registry
            .update_identity(&Uuid::new_v4(), IdentityUpdate::default())
            .is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_focus_and_blur() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();

        assert_eq!(registry.focus("0:col1", &a), Some(FocusChange::default()));
        assert_eq!(registry.lock_holder("0:col1"), Some(a));

        // Blur by a non-holder does nothing.
        assert!(!registry.blur("0:col1", &b));
        assert_eq!(registry.lock_holder("0:col1"), Some(a));

        assert!(registry.blur("0:col1", &a));
        assert_eq!(registry.lock_holder("0:col1"), None);
        assert!(!registry.blur("0:col1", &a));
    }

    #[test]
    fn test_focus_moves_previous_lock() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        registry.focus("0:col1", &a);
        let change = registry.focus("1:col1", &a).unwrap();
        assert_eq!(change.released.as_deref(), Some("0:col1"));
        assert_eq!(change.displaced, None);
        assert_eq!(registry.lock_holder("0:col1"), None);
        assert_eq!(registry.lock_holder("1:col1"), Some(a));
        assert_eq!(registry.lock_count(), 1);
    }

    #[test]
    fn test_focus_is_advisory() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        registry.focus("0:col1", &a);
        let change = registry.focus("0:col1", &b).unwrap();
        assert_eq!(change, FocusChange { released: None, displaced: Some(a) });
        assert_eq!(registry.lock_holder("0:col1"), Some(b));
        // Refocusing a held cell releases nothing.
        assert_eq!(registry.focus("0:col1", &b), Some(FocusChange::default()));
        // `a` no longer holds anything, so its disconnect releases nothing.
        let (_, released) = registry.unregister(&a).unwrap();
        assert!(released.is_empty());
        assert_eq!(registry.lock_holder("0:col1"), Some(b));
    }

    #[test]
    fn test_focus_unknown_editor() {
        let mut registry = SessionRegistry::new();
        assert!(registry.focus("0:col1", &Uuid::new_v4()).is_none());
        assert_eq!(registry.lock_count(), 0);
    }

    #[test]
    fn test_unregister_releases_locks() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        registry.focus("2:col2", &a);
        registry.focus("0:col1", &b);

        let (info, released) = registry.unregister(&a).unwrap();
        assert_eq!(info.user_id, a);
        assert_eq!(released, vec!["2:col2".to_string()]);
        assert_eq!(registry.lock_holder("2:col2"), None);
        assert_eq!(registry.lock_holder("0:col1"), Some(b));
        assert!(registry.unregister(&a).is_none());
    }

    #[test]
    fn test_roster_order_and_exclusion() {
        let mut registry = SessionRegistry::new();
        let ids: Vec<Uuid> = (0..5).map(|_| registry.register()).collect();
        let roster: Vec<Uuid> = registry.roster().iter().map(|c| c.user_id).collect();
        assert_eq!(roster, ids);

        let others = registry.roster_except(&ids[4]);
        assert_eq!(others.len(), 4);
        assert!(others.iter().all(|c| c.user_id != ids[4]));
    }

    #[test]
    fn test_set_cursor() {
        let mut registry = SessionRegistry::new();
        let a = registry.register();
        assert!(registry.set_cursor(&a, json!({"row": 1, "col": "col2"})));
        assert_eq!(registry.get(&a).unwrap().cursor, Some(json!({"row": 1, "col": "col2"})));
        assert!(!registry.set_cursor(&Uuid::new_v4(), json!(null)));
    }
}
