use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

#[derive(Debug, Deserialize, Serialize)]
pub(super) struct Payload {
    pub(super) op: Opcode,
    #[serde(default)]
    pub(super) d: Value,
    #[serde(skip_serializing)]
    pub(super) s: Option<u64>,
    #[serde(skip_serializing)]
    pub(super) t: Option<Box<str>>,
}

impl Payload {
    pub(super) fn new(op: Opcode, d: impl Serialize) -> serde_json::Result<Self> {
        Ok(Payload {
            op,
            d: serde_json::to_value(d)?,
            s: None,
            t: None,
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
pub(super) enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume = 6,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatACK,
}

pub(super) const INTENT_GUILDS: u32 = 1 << 0;
pub(super) const INTENT_GUILD_MEMBERS: u32 = 1 << 1;
pub(super) const INTENT_GUILD_VOICE_STATES: u32 = 1 << 7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_payload_omits_sequence_and_event() {
        let payload = Payload::new(Opcode::VoiceStateUpdate, serde_json::json!({"x": 1})).unwrap();
        let text = serde_json::to_string(&payload).unwrap();
        assert_eq!(text, r#"{"op":4,"d":{"x":1}}"#);
    }

    #[test]
    fn dispatch_carries_sequence_and_event() {
        let payload: Payload =
            serde_json::from_str(r#"{"op":0,"d":{},"s":42,"t":"READY"}"#).unwrap();
        assert_eq!(payload.op, Opcode::Dispatch);
        assert_eq!(payload.s, Some(42));
        assert_eq!(payload.t.as_deref(), Some("READY"));
    }

    #[test]
    fn heartbeat_ack_has_no_data() {
        let payload: Payload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(payload.op, Opcode::HeartbeatACK);
        assert!(payload.d.is_null());
    }
}
