//! Client-held sync state, serialized opaquely between rounds.

use crate::core::{EngineError, Result, codes};
use crate::storage::Collection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const PERIMETER_FORMAT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// The account itself; its usage counters and primary avatar share the id.
    Account,
    /// Secondary avatar.
    Avatar,
    Group,
}

impl EntryKind {
    pub fn majors(self) -> &'static [Collection] {
        match self {
            EntryKind::Account => &[Collection::Accounts, Collection::Usages, Collection::Avatars],
            EntryKind::Avatar => &[Collection::Avatars],
            EntryKind::Group => &[Collection::Groups],
        }
    }

    /// Sub-collections always sent for this kind. Group members and notes
    /// depend on the account's access and are gated by the entry flags.
    pub fn subs(self) -> &'static [Collection] {
        match self {
            EntryKind::Account => &[Collection::Notes, Collection::Chats, Collection::Tickets],
            EntryKind::Avatar => &[Collection::Notes, Collection::Chats],
            EntryKind::Group => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerimeterEntry {
    pub kind: EntryKind,
    /// Last version the client has content for.
    pub seen: i64,
    /// Last version the server confirmed.
    pub baseline: i64,
    pub members_loaded: bool,
    pub members_allowed: bool,
    pub notes_loaded: bool,
    pub notes_allowed: bool,
}

impl PerimeterEntry {
    pub fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            seen: 0,
            baseline: 0,
            members_loaded: false,
            members_allowed: false,
            notes_loaded: false,
            notes_allowed: false,
        }
    }

    /// Content (or a newly authorized sub-collection) is missing client-side.
    pub fn needs_fetch(&self) -> bool {
        self.seen < self.baseline
            || (self.members_allowed && !self.members_loaded)
            || (self.notes_allowed && !self.notes_loaded)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perimeter {
    format: u8,
    pub account: Option<i64>,
    pub entries: BTreeMap<i64, PerimeterEntry>,
}

impl Perimeter {
    pub fn new(account: i64) -> Self {
        Self {
            format: PERIMETER_FORMAT,
            account: Some(account),
            entries: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Rejects undecodable bytes and perimeters of another account.
    pub fn decode(bytes: &[u8], account: i64) -> Result<Self> {
        let perimeter: Perimeter = rmp_serde::from_slice(bytes).map_err(|err| {
            EngineError::functional(codes::BAD_PERIMETER, format!("undecodable perimeter: {}", err))
        })?;
        if perimeter.format != PERIMETER_FORMAT || perimeter.account != Some(account) {
            return Err(EngineError::functional(
                codes::BAD_PERIMETER,
                "perimeter belongs to another session or format",
            ));
        }
        Ok(perimeter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
