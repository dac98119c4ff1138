//! Wire protocol codec (NIP-01).
//!
//! Every frame is one JSON array. Client frames parse into [`ClientMessage`];
//! relay frames serialize from [`RelayMessage`]. A malformed frame is a
//! protocol error the connection answers with a NOTICE, never a disconnect.

use crate::error::RelayError;
use crate::event::Event;
use crate::filter::Filter;
use serde_json::{Value, json};

/// Client → relay frames.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["REQ", subId, filter...]`
    Req { sub_id: String, filters: Vec<Filter> },
    /// `["EVENT", event]`
    Event(Box<Event>),
    /// `["CLOSE", subId]`
    Close { sub_id: String },
    /// `["COUNT", subId, filter...]`
    Count { sub_id: String, filters: Vec<Filter> },
}

impl ClientMessage {
    /// Parse one text frame. Errors carry a client-safe description.
    pub fn parse(frame: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|_| RelayError::Protocol("invalid: message is not valid JSON".into()))?;

        let Value::Array(items) = value else {
            return Err(RelayError::Protocol(
                "invalid: message must be a JSON array".into(),
            ));
        };

        let Some(Value::String(verb)) = items.first() else {
            return Err(RelayError::Protocol(
                "invalid: missing message type".into(),
            ));
        };

        match verb.as_str() {
            "REQ" => {
                let sub_id = sub_id_at(&items, 1)?;
                let filters = filters_from(&items[2..])?;
                if filters.is_empty() {
                    return Err(RelayError::Protocol(
                        "invalid: REQ requires at least one filter".into(),
                    ));
                }
                Ok(Self::Req { sub_id, filters })
            }
            "EVENT" => {
                let raw = items.get(1).ok_or_else(|| {
                    RelayError::Protocol("invalid: EVENT requires an event".into())
                })?;
                let event: Event = serde_json::from_value(raw.clone())
                    .map_err(|_| RelayError::Protocol("invalid: malformed event".into()))?;
                Ok(Self::Event(Box::new(event)))
            }
            "CLOSE" => Ok(Self::Close {
                sub_id: sub_id_at(&items, 1)?,
            }),
            "COUNT" => {
                let sub_id = sub_id_at(&items, 1)?;
                let filters = filters_from(&items[2..])?;
                Ok(Self::Count { sub_id, filters })
            }
            other => Err(RelayError::Protocol(format!(
                "invalid: unknown message type {other:?}"
            ))),
        }
    }
}

fn sub_id_at(items: &[Value], index: usize) -> Result<String, RelayError> {
    match items.get(index) {
        Some(Value::String(s)) if !s.is_empty() && s.len() <= 64 => Ok(s.clone()),
        _ => Err(RelayError::Protocol(
            "invalid: subscription id must be a non-empty string".into(),
        )),
    }
}

fn filters_from(items: &[Value]) -> Result<Vec<Filter>, RelayError> {
    items
        .iter()
        .map(|raw| {
            serde_json::from_value(raw.clone())
                .map_err(|_| RelayError::Protocol("invalid: malformed filter".into()))
        })
        .collect()
}

/// Relay → client frames.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// `["EVENT", subId, event]`
    Event { sub_id: String, event: Event },
    /// `["EOSE", subId]`
    Eose { sub_id: String },
    /// `["OK", eventId, ok, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["CLOSED", subId, message]`
    Closed { sub_id: String, message: String },
    /// `["COUNT", subId, {count, approximate}]`
    Count {
        sub_id: String,
        count: u64,
        approximate: bool,
    },
    /// `["NOTICE", message]`
    Notice { message: String },
}

impl RelayMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Event { sub_id, event } => json!(["EVENT", sub_id, event]),
            Self::Eose { sub_id } => json!(["EOSE", sub_id]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Closed { sub_id, message } => json!(["CLOSED", sub_id, message]),
            Self::Count {
                sub_id,
                count,
                approximate,
            } => json!(["COUNT", sub_id, { "count": count, "approximate": approximate }]),
            Self::Notice { message } => json!(["NOTICE", message]),
        };
        value.to_string()
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_req() {
        let msg = ClientMessage::parse(r#"["REQ","s1",{"kinds":[1],"limit":0}]"#).unwrap();
        let ClientMessage::Req { sub_id, filters } = msg else {
            panic!("expected REQ");
        };
        assert_eq!(sub_id, "s1");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].kinds, Some(vec![1]));
        assert_eq!(filters[0].limit, Some(0));
    }

    #[test]
    fn parse_event() {
        let frame = r#"["EVENT",{"id":"aa","pubkey":"bb","created_at":10,"kind":1,"tags":[],"content":"hi","sig":"cc"}]"#;
        let ClientMessage::Event(event) = ClientMessage::parse(frame).unwrap() else {
            panic!("expected EVENT");
        };
        assert_eq!(event.kind, 1);
        assert_eq!(event.content, "hi");
    }

    #[test]
    fn parse_close_and_count() {
        assert!(matches!(
            ClientMessage::parse(r#"["CLOSE","s1"]"#).unwrap(),
            ClientMessage::Close { .. }
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["COUNT","s1",{"kinds":[1]}]"#).unwrap(),
            ClientMessage::Count { .. }
        ));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for frame in [
            "not json",
            "{}",
            "[]",
            r#"["REQ"]"#,
            r#"["REQ","s1"]"#,
            r#"["REQ","",{"kinds":[1]}]"#,
            r#"["EVENT"]"#,
            r#"["EVENT",{"kind":"wrong"}]"#,
            r#"["PUBLISH","s1"]"#,
        ] {
            assert!(
                matches!(ClientMessage::parse(frame), Err(RelayError::Protocol(_))),
                "frame should be rejected: {frame}"
            );
        }
    }

    #[test]
    fn relay_messages_serialize_to_arrays() {
        assert_eq!(
            RelayMessage::Eose { sub_id: "s1".into() }.to_json(),
            r#"["EOSE","s1"]"#
        );
        assert_eq!(
            RelayMessage::Ok {
                event_id: "aa".into(),
                accepted: false,
                message: "blocked: no".into()
            }
            .to_json(),
            r#"["OK","aa",false,"blocked: no"]"#
        );
        let count = RelayMessage::Count {
            sub_id: "s1".into(),
            count: 42,
            approximate: false,
        }
        .to_json();
        assert!(count.contains(r#""count":42"#));
        assert!(count.contains(r#""approximate":false"#));
    }
}
