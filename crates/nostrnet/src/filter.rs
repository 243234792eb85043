use serde::{Deserialize, Serialize};

use crate::{Error, Note, NoteId, Pubkey};

/// NIP-01 subscription filter
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Default)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<NoteId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<Pubkey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(rename = "#e")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<NoteId>>,
    #[serde(rename = "#p")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<Pubkey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    pub fn ids<'a>(mut self, ids: impl IntoIterator<Item = &'a [u8; 32]>) -> Self {
        self.ids = Some(ids.into_iter().map(|id| NoteId::new(*id)).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = Pubkey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u64>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = NoteId>) -> Self {
        self.events = Some(events.into_iter().collect());
        self
    }

    pub fn pubkeys(mut self, pubkeys: impl IntoIterator<Item = Pubkey>) -> Self {
        self.pubkeys = Some(pubkeys.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Whether `note` satisfies every populated field. `limit` is a
    /// property of the scan, not of a single note, and is ignored here.
    pub fn matches(&self, note: &Note) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&note.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(&note.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&note.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if note.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if note.created_at > until {
                return false;
            }
        }

        if let Some(events) = &self.events {
            let hit = note
                .tag_values("e")
                .filter_map(|v| NoteId::from_hex(v).ok())
                .any(|id| events.contains(&id));
            if !hit {
                return false;
            }
        }

        if let Some(pubkeys) = &self.pubkeys {
            let hit = note
                .tag_values("p")
                .filter_map(|v| Pubkey::from_hex(v).ok())
                .any(|pk| pubkeys.contains(&pk));
            if !hit {
                return false;
            }
        }

        true
    }
}
