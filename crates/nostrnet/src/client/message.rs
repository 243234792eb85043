use crate::{Error, Filter, Note};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct EventClientMessage {
    pub note: Note,
}

impl EventClientMessage {
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(format!("[\"EVENT\",{}]", self.note.json()?))
    }
}

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(EventClientMessage),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
    /// NIP-42 response to a relay challenge
    Auth(Box<Note>),
    /// NIP-77 session open, carrying the hex encoded initial message
    NegOpen {
        sub_id: String,
        filter: Filter,
        initial: String,
    },
    NegMsg {
        sub_id: String,
        payload: String,
    },
    NegClose {
        sub_id: String,
    },
    Raw(String),
}

impl ClientMessage {
    pub fn event(note: Note) -> Self {
        ClientMessage::Event(EventClientMessage { note })
    }

    pub fn raw(raw: String) -> Self {
        ClientMessage::Raw(raw)
    }

    pub fn req(sub_id: String, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: String) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn auth(note: Note) -> Self {
        ClientMessage::Auth(Box::new(note))
    }

    /// Subscription-style requests only go to relays we read from
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::Req { .. } | Self::Close { .. } | Self::NegOpen { .. } | Self::NegMsg { .. } | Self::NegClose { .. }
        )
    }

    /// Publishing only goes to relays we write to
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Event(_))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Event(ecm) => ecm.to_json()?,
            Self::Raw(raw) => raw.clone(),
            Self::Req { sub_id, filters } => {
                let sub_id = serde_json::to_string(sub_id)?;
                if filters.is_empty() {
                    format!("[\"REQ\",{sub_id},{{}}]")
                } else {
                    let filters_json_str: Result<Vec<String>, Error> =
                        filters.iter().map(Filter::json).collect();
                    format!("[\"REQ\",{},{}]", sub_id, filters_json_str?.join(","))
                }
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
            Self::Auth(note) => format!("[\"AUTH\",{}]", note.json()?),
            Self::NegOpen {
                sub_id,
                filter,
                initial,
            } => json!(["NEG-OPEN", sub_id, filter, initial]).to_string(),
            Self::NegMsg { sub_id, payload } => json!(["NEG-MSG", sub_id, payload]).to_string(),
            Self::NegClose { sub_id } => json!(["NEG-CLOSE", sub_id]).to_string(),
        })
    }
}
