use crate::{Error, Note, NoteId, Result};
use ewebsock::{WsEvent, WsMessage};
use serde_json::Value;

/// Relay answer to a published event (NIP-01 `OK`)
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: NoteId,
    pub status: bool,
    pub message: String,
}

impl CommandResult {
    /// The relay already had the event. Treated the same as acceptance.
    pub fn is_duplicate(&self) -> bool {
        self.message.starts_with("duplicate:")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    OK(CommandResult),
    Eose(String),
    Event(String, Box<Note>),
    Notice(String),
    Auth(String),
    Closed(String, String),
    NegMsg(String, String),
    NegErr(String, String),
}

#[derive(Debug)]
pub enum RelayEvent<'a> {
    Opened,
    Closed,
    Other(&'a WsMessage),
    Error(Error),
    Message(RelayMessage),
}

impl<'a> From<&'a WsEvent> for RelayEvent<'a> {
    fn from(event: &'a WsEvent) -> RelayEvent<'a> {
        match event {
            WsEvent::Opened => RelayEvent::Opened,
            WsEvent::Closed => RelayEvent::Closed,
            WsEvent::Message(ref ws_msg) => ws_msg.into(),
            WsEvent::Error(s) => RelayEvent::Error(Error::Generic(s.to_owned())),
        }
    }
}

impl<'a> From<&'a WsMessage> for RelayEvent<'a> {
    fn from(wsmsg: &'a WsMessage) -> RelayEvent<'a> {
        match wsmsg {
            WsMessage::Text(s) => match RelayMessage::from_json(s).map(RelayEvent::Message) {
                Ok(msg) => msg,
                Err(err) => RelayEvent::Error(err),
            },
            wsmsg => RelayEvent::Other(wsmsg),
        }
    }
}

fn str_at(arr: &[Value], idx: usize, what: &str) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::DecodeFailed(format!("missing {what}")))
}

impl RelayMessage {
    pub fn eose(subid: impl Into<String>) -> Self {
        RelayMessage::Eose(subid.into())
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        RelayMessage::Notice(msg.into())
    }

    pub fn ok(event_id: NoteId, status: bool, message: impl Into<String>) -> Self {
        RelayMessage::OK(CommandResult {
            event_id,
            status,
            message: message.into(),
        })
    }

    pub fn event(sub_id: impl Into<String>, note: Note) -> Self {
        RelayMessage::Event(sub_id.into(), Box::new(note))
    }

    /// The subscription this message belongs to, if any
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Eose(s)
            | RelayMessage::Event(s, _)
            | RelayMessage::Closed(s, _)
            | RelayMessage::NegMsg(s, _)
            | RelayMessage::NegErr(s, _) => Some(s),
            RelayMessage::OK(_) | RelayMessage::Notice(_) | RelayMessage::Auth(_) => None,
        }
    }

    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let value: Value = serde_json::from_str(msg)
            .map_err(|_| Error::DecodeFailed(format!("unrecognized message type: '{msg}'")))?;
        let Some(arr) = value.as_array() else {
            return Err(Error::DecodeFailed("not a json array".into()));
        };
        let Some(kind) = arr.first().and_then(Value::as_str) else {
            return Err(Error::DecodeFailed("missing message type".into()));
        };

        match kind {
            // ["EVENT", <subscription id>, <event JSON>]
            "EVENT" => {
                let sub_id = str_at(arr, 1, "subscription id")?;
                let Some(ev) = arr.get(2) else {
                    return Err(Error::DecodeFailed("Invalid EVENT format".into()));
                };
                let note: Note = serde_json::from_value(ev.clone())
                    .map_err(|e| Error::DecodeFailed(format!("bad event: {e}")))?;
                Ok(Self::event(sub_id, note))
            }

            // ["EOSE", <subscription_id>]
            "EOSE" => Ok(Self::eose(str_at(arr, 1, "subscription id")?)),

            // ["OK", <event_id>, <true|false>, <message>]
            "OK" => {
                let event_id = NoteId::from_hex(&str_at(arr, 1, "event id")?)
                    .map_err(|_| Error::DecodeFailed("bad event id".into()))?;
                let Some(status) = arr.get(2).and_then(Value::as_bool) else {
                    return Err(Error::DecodeFailed("bad boolean value".into()));
                };
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(Self::ok(event_id, status, message))
            }

            // ["NOTICE", <message>]
            "NOTICE" => Ok(Self::notice(str_at(arr, 1, "notice")?)),

            // ["AUTH", <challenge>]
            "AUTH" => Ok(RelayMessage::Auth(str_at(arr, 1, "challenge")?)),

            // ["CLOSED", <subscription_id>, <message>]
            "CLOSED" => {
                let sub_id = str_at(arr, 1, "subscription id")?;
                let message = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(RelayMessage::Closed(sub_id, message))
            }

            // ["NEG-MSG", <subscription_id>, <hex payload>]
            "NEG-MSG" => Ok(RelayMessage::NegMsg(
                str_at(arr, 1, "subscription id")?,
                str_at(arr, 2, "negentropy payload")?,
            )),

            // ["NEG-ERR", <subscription_id>, <reason>]
            "NEG-ERR" => Ok(RelayMessage::NegErr(
                str_at(arr, 1, "subscription id")?,
                str_at(arr, 2, "reason")?,
            )),

            _ => Err(Error::DecodeFailed(format!(
                "unrecognized message type: '{msg}'"
            ))),
        }
    }
}
