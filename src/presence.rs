//! Per-room membership. Every open socket of a user contributes one meta;
//! metas merge by user id, and diffs stay idempotent through the
//! `joined_at` ordering: whoever has seen the newest meta for a user wins,
//! and a stale leave can never remove a newer join.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::world::UserId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub name: String,
    pub avatar: Option<String>,
    pub joined_at: u64,
    pub socket_ref: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetas {
    pub metas: Vec<PresenceMeta>,
}

/// The server-side presence set of one room: all metas of all users.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresenceSet(pub BTreeMap<UserId, UserMetas>);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresenceStatePayload {
    pub presences: BTreeMap<UserId, UserMetas>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiffPayload {
    pub joins: BTreeMap<UserId, UserMetas>,
    pub leaves: BTreeMap<UserId, UserMetas>,
}

impl PresenceSet {
    pub fn join(&mut self, user_id: &str, meta: PresenceMeta) -> PresenceDiffPayload {
        let entry = self.0.entry(user_id.to_owned()).or_default();
        entry.metas.retain(|m| m.socket_ref != meta.socket_ref);
        entry.metas.push(meta.clone());

        let mut diff = PresenceDiffPayload::default();
        diff.joins
            .insert(user_id.to_owned(), UserMetas { metas: vec![meta] });
        diff
    }

    /// Remove one socket of a user. Returns the diff to broadcast, or `None`
    /// when the socket was not present.
    pub fn leave(&mut self, user_id: &str, socket_ref: &str) -> Option<PresenceDiffPayload> {
        let entry = self.0.get_mut(user_id)?;
        let idx = entry.metas.iter().position(|m| m.socket_ref == socket_ref)?;
        let meta = entry.metas.remove(idx);

        if entry.metas.is_empty() {
            self.0.remove(user_id);
        }

        let mut diff = PresenceDiffPayload::default();
        diff.leaves
            .insert(user_id.to_owned(), UserMetas { metas: vec![meta] });
        Some(diff)
    }

    /// Remove every socket of a user at once (kick).
    pub fn remove_user(&mut self, user_id: &str) -> Option<PresenceDiffPayload> {
        let entry = self.0.remove(user_id)?;

        let mut diff = PresenceDiffPayload::default();
        diff.leaves.insert(user_id.to_owned(), entry);
        Some(diff)
    }

    pub fn contains(&self, user_id: &str) -> bool { self.0.contains_key(user_id) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// User ids ordered by their earliest join, ties broken by id. This is
    /// the drawer rotation order and the admin succession order.
    pub fn ids_by_join_order(&self) -> Vec<UserId> {
        let mut ids: Vec<(u64, &UserId)> = self
            .0
            .iter()
            .map(|(id, metas)| {
                let earliest = metas.metas.iter().map(|m| m.joined_at).min().unwrap_or(u64::MAX);
                (earliest, id)
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn earliest_joined(&self) -> Option<UserId> {
        self.ids_by_join_order().into_iter().next()
    }

    pub fn state_payload(&self) -> PresenceStatePayload {
        PresenceStatePayload { presences: self.0.clone() }
    }
}

/// The client's view: one meta per user, reconciled from diffs. Mirrors the
/// merge contract clients implement; kept here so the rules are testable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientPresence(pub BTreeMap<UserId, PresenceMeta>);

impl ClientPresence {
    pub fn sync_state(&mut self, state: &PresenceStatePayload) {
        self.0.clear();
        for (id, metas) in &state.presences {
            if let Some(newest) = metas.metas.iter().max_by_key(|m| m.joined_at) {
                self.0.insert(id.clone(), newest.clone());
            }
        }
    }

    /// Apply a diff. Applying the same diff twice leaves the state unchanged,
    /// and a leave older than the held meta is ignored so one dying socket of
    /// a user with a newer one never causes flicker.
    pub fn apply_diff(&mut self, diff: &PresenceDiffPayload) {
        for (id, metas) in &diff.joins {
            if let Some(incoming) = metas.metas.iter().max_by_key(|m| m.joined_at) {
                match self.0.get(id) {
                    Some(held) if held.joined_at > incoming.joined_at => {}
                    _ => {
                        self.0.insert(id.clone(), incoming.clone());
                    }
                }
            }
        }

        for (id, metas) in &diff.leaves {
            let newest_leave = match metas.metas.iter().map(|m| m.joined_at).max() {
                Some(ts) => ts,
                None => continue,
            };
            if let Some(held) = self.0.get(id) {
                if newest_leave >= held.joined_at {
                    self.0.remove(id);
                }
            }
        }
    }
}
