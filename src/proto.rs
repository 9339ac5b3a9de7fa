use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::Event;
use crate::queue::Priority;
use crate::subscription::{Filter, Subscription};

/// Hard limit on a single inbound frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 500_000;

/// Maximum live subscriptions per connection.
pub const MAX_SUBS_PER_CONN: u64 = 300;

/// Cap applied to any filter-supplied query limit.
pub const MAX_FILTER_LIMIT: u64 = 5000;

/// Historical query limit when no filter specifies one.
pub const DEFAULT_QUERY_LIMIT: u64 = 500;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("could not parse message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message is not a JSON array")]
    NotAnArray,
    #[error("message is missing its verb")]
    MissingVerb,
    #[error("message is missing its {0}")]
    MissingField(&'static str),
    #[error("message of {0} bytes exceeds the frame limit")]
    Oversized(usize),
    #[error("{0}")]
    BadFilter(#[from] crate::subscription::FilterError),
}

/// Cheap structural look at a frame: enough to classify its priority and
/// to address a rejection back to the client without a full parse.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHead {
    pub verb: String,
    /// Correlation handle: the event id for EVENT frames, the
    /// subscription id for REQ/CLOSE frames.
    pub arg: Option<String>,
}

pub fn inspect(raw: &[u8]) -> Result<FrameHead, ProtocolError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Oversized(raw.len()));
    }
    let value: Value = serde_json::from_slice(raw)?;
    let items = value.as_array().ok_or(ProtocolError::NotAnArray)?;
    let verb = items
        .first()
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingVerb)?
        .to_owned();

    let arg = match verb.as_str() {
        "EVENT" => items
            .get(1)
            .and_then(|e| e.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        "REQ" | "CLOSE" => items.get(1).and_then(Value::as_str).map(str::to_owned),
        _ => None,
    };
    Ok(FrameHead { verb, arg })
}

impl Priority {
    /// Admission band by verb: control-plane verbs outrank data.
    pub fn for_verb(verb: &str) -> Priority {
        match verb {
            "CLOSE" | "AUTH" => Priority::Critical,
            "REQ" => Priority::High,
            "EVENT" => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// A fully parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req(Subscription),
    Close(String),
    Auth(Value),
    Unknown(String),
}

pub fn parse_frame(raw: &[u8]) -> Result<ClientMessage, ProtocolError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Oversized(raw.len()));
    }
    let value: Value = serde_json::from_slice(raw)?;
    let items = value.as_array().ok_or(ProtocolError::NotAnArray)?;
    let verb = items
        .first()
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingVerb)?;

    match verb {
        "EVENT" => {
            let body = items
                .get(1)
                .cloned()
                .ok_or(ProtocolError::MissingField("event body"))?;
            let event: Event = serde_json::from_value(body)?;
            Ok(ClientMessage::Event(Box::new(event)))
        }
        "REQ" => {
            let sub_id = items
                .get(1)
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("subscription id"))?
                .to_owned();
            if items.len() < 3 {
                return Err(ProtocolError::MissingField("filters"));
            }
            let mut filters = Vec::with_capacity(items.len() - 2);
            for item in &items[2..] {
                let filter: Filter = serde_json::from_value(item.clone())?;
                filter.validate()?;
                filters.push(filter);
            }
            Ok(ClientMessage::Req(Subscription {
                id: sub_id,
                filters,
            }))
        }
        "CLOSE" => {
            let sub_id = items
                .get(1)
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("subscription id"))?
                .to_owned();
            Ok(ClientMessage::Close(sub_id))
        }
        "AUTH" => Ok(ClientMessage::Auth(
            items.get(1).cloned().unwrap_or(Value::Null),
        )),
        other => Ok(ClientMessage::Unknown(other.to_owned())),
    }
}

/// Outbound frames. Everything a client receives is one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Ok { id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
}

impl RelayMessage {
    pub fn event(sub_id: &str, event: &Event) -> RelayMessage {
        RelayMessage::Event {
            sub_id: sub_id.to_owned(),
            event: event.clone(),
        }
    }

    pub fn ok(id: &str, accepted: bool, message: &str) -> RelayMessage {
        RelayMessage::Ok {
            id: id.to_owned(),
            accepted,
            message: message.to_owned(),
        }
    }

    pub fn eose(sub_id: &str) -> RelayMessage {
        RelayMessage::Eose {
            sub_id: sub_id.to_owned(),
        }
    }

    pub fn closed(sub_id: &str, message: &str) -> RelayMessage {
        RelayMessage::Closed {
            sub_id: sub_id.to_owned(),
            message: message.to_owned(),
        }
    }

    pub fn notice(message: &str) -> RelayMessage {
        RelayMessage::Notice {
            message: message.to_owned(),
        }
    }

    /// Wire form: a JSON array keyed by verb.
    pub fn to_frame(&self) -> String {
        let value = match self {
            RelayMessage::Event { sub_id, event } => {
                serde_json::json!(["EVENT", sub_id, event])
            }
            RelayMessage::Ok {
                id,
                accepted,
                message,
            } => serde_json::json!(["OK", id, accepted, message]),
            RelayMessage::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            RelayMessage::Closed { sub_id, message } => {
                serde_json::json!(["CLOSED", sub_id, message])
            }
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
        };
        value.to_string()
    }
}

/// Translate an ingress-queue rejection into the frame the client can act
/// on, addressed by the rejected frame's own verb.
pub fn rejection_frame(head: &FrameHead, reason: &str) -> RelayMessage {
    match head.verb.as_str() {
        "EVENT" => RelayMessage::ok(head.arg.as_deref().unwrap_or(""), false, reason),
        "REQ" => RelayMessage::closed(head.arg.as_deref().unwrap_or(""), reason),
        _ => RelayMessage::notice(reason),
    }
}

/// Envelope republished from the ingress queue onto the shared work list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub conn_id: String,
    pub frame: String,
}

impl WorkItem {
    pub fn encode(&self) -> String {
        // Both fields are plain strings; serialization cannot fail.
        serde_json::to_string(self).expect("work item serialization")
    }

    pub fn decode(raw: &str) -> Result<WorkItem, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::signed_event;

    #[test]
    fn classification_table() {
        assert_eq!(Priority::for_verb("CLOSE"), Priority::Critical);
        assert_eq!(Priority::for_verb("AUTH"), Priority::Critical);
        assert_eq!(Priority::for_verb("REQ"), Priority::High);
        assert_eq!(Priority::for_verb("EVENT"), Priority::Normal);
        assert_eq!(Priority::for_verb("COUNT"), Priority::Low);
    }

    #[test]
    fn inspect_extracts_correlation_args() {
        let head = inspect(br#"["REQ","sub-1",{}]"#).unwrap();
        assert_eq!(head.verb, "REQ");
        assert_eq!(head.arg.as_deref(), Some("sub-1"));

        let head = inspect(br#"["EVENT",{"id":"abc123"}]"#).unwrap();
        assert_eq!(head.arg.as_deref(), Some("abc123"));

        let head = inspect(br#"["AUTH","challenge"]"#).unwrap();
        assert_eq!(head.arg, None);

        assert!(inspect(b"{\"not\":\"array\"}").is_err());
        assert!(inspect(b"[42]").is_err());
        assert!(inspect(b"not json at all").is_err());
    }

    #[test]
    fn parse_full_frames() {
        let event = signed_event(1, vec![], "hi", 1_700_000_000);
        let raw = format!("[\"EVENT\",{}]", serde_json::to_string(&event).unwrap());
        match parse_frame(raw.as_bytes()).unwrap() {
            ClientMessage::Event(parsed) => assert_eq!(*parsed, event),
            other => panic!("unexpected parse: {:?}", other),
        }

        match parse_frame(br##"["REQ","s1",{"kinds":[1]},{"#e":["E1"]}]"##).unwrap() {
            ClientMessage::Req(sub) => {
                assert_eq!(sub.id, "s1");
                assert_eq!(sub.filters.len(), 2);
            }
            other => panic!("unexpected parse: {:?}", other),
        }

        assert!(matches!(
            parse_frame(br#"["CLOSE","s1"]"#).unwrap(),
            ClientMessage::Close(id) if id == "s1"
        ));
        assert!(matches!(
            parse_frame(br#"["NEGENTROPY","x"]"#).unwrap(),
            ClientMessage::Unknown(verb) if verb == "NEGENTROPY"
        ));
        assert!(parse_frame(br#"["REQ","s1"]"#).is_err());
        assert!(parse_frame(br##"["REQ","s1",{"#bad-key":["v"]}]"##).is_err());
    }

    #[test]
    fn oversized_frames_rejected() {
        let raw = vec![b' '; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            inspect(&raw),
            Err(ProtocolError::Oversized(n)) if n == MAX_FRAME_BYTES + 1
        ));
    }

    #[test]
    fn rejection_translation_shapes() {
        let event_head = FrameHead {
            verb: "EVENT".to_owned(),
            arg: Some("id-1".to_owned()),
        };
        assert_eq!(
            rejection_frame(&event_head, "rate limited").to_frame(),
            r#"["OK","id-1",false,"rate limited"]"#
        );

        let req_head = FrameHead {
            verb: "REQ".to_owned(),
            arg: Some("sub-1".to_owned()),
        };
        assert_eq!(
            rejection_frame(&req_head, "queue at capacity").to_frame(),
            r#"["CLOSED","sub-1","queue at capacity"]"#
        );

        let auth_head = FrameHead {
            verb: "AUTH".to_owned(),
            arg: None,
        };
        assert_eq!(
            rejection_frame(&auth_head, "circuit breaker open").to_frame(),
            r#"["NOTICE","circuit breaker open"]"#
        );
    }

    #[test]
    fn work_item_round_trip() {
        let item = WorkItem {
            conn_id: "c1".to_owned(),
            frame: r#"["CLOSE","s1"]"#.to_owned(),
        };
        assert_eq!(WorkItem::decode(&item.encode()).unwrap(), item);
    }
}
