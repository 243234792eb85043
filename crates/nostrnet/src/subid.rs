use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Subscription id sent in REQ/CLOSE frames.
#[derive(Debug, Clone)]
pub struct SubId {
    /// Human readable label for logs. The wire id is a random uuid so
    /// relays can't correlate subscriptions across sessions.
    description: String,
    id: String,
}

impl PartialEq for SubId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubId {}

impl Hash for SubId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SubId {
    pub fn new(description: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            description: description.into(),
            id,
        }
    }

    /// Use a caller chosen wire id
    pub fn from_string(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl std::fmt::Display for SubId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "SubId('{}', {}...)",
            self.description,
            abbrev_str(&self.id, 8)
        )
    }
}

fn abbrev_str(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subids_are_unique_and_compare_by_wire_id() {
        let a = SubId::new("timeline");
        let b = SubId::new("timeline");
        assert_ne!(a, b);

        let c = SubId::from_string(a.as_str(), "other label");
        assert_eq!(a, c);
    }

    #[test]
    fn display_abbreviates_on_char_boundary() {
        let id = SubId::from_string("ééééééééééé", "dm");
        assert_eq!(id.to_string(), "SubId('dm', éééééééé...)");
    }
}
