use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize, Serialize)]
pub(super) struct VoicePayload {
    pub(super) op: u8,
    #[serde(default)]
    pub(super) d: Value,
    #[serde(default, skip_serializing)]
    pub(super) seq: Option<i64>,
}

impl VoicePayload {
    pub(super) fn new(op: u8, d: Value) -> Self {
        VoicePayload { op, d, seq: None }
    }
}

/// Voice gateway opcodes, JSON and binary.
pub(super) mod op {
    pub(in super::super) const IDENTIFY: u8 = 0;
    pub(in super::super) const SELECT_PROTOCOL: u8 = 1;
    pub(in super::super) const READY: u8 = 2;
    pub(in super::super) const HEARTBEAT: u8 = 3;
    pub(in super::super) const SESSION_DESCRIPTION: u8 = 4;
    pub(in super::super) const SPEAKING: u8 = 5;
    pub(in super::super) const HEARTBEAT_ACK: u8 = 6;
    pub(in super::super) const HELLO: u8 = 8;
    pub(in super::super) const CLIENTS_CONNECT: u8 = 11;
    pub(in super::super) const CLIENT_DISCONNECT: u8 = 13;
    pub(in super::super) const DAVE_PREPARE_TRANSITION: u8 = 21;
    pub(in super::super) const DAVE_EXECUTE_TRANSITION: u8 = 22;
    pub(in super::super) const DAVE_TRANSITION_READY: u8 = 23;
    pub(in super::super) const DAVE_PREPARE_EPOCH: u8 = 24;
    pub(in super::super) const DAVE_MLS_EXTERNAL_SENDER: u8 = 25;
    pub(in super::super) const DAVE_MLS_KEY_PACKAGE: u8 = 26;
    pub(in super::super) const DAVE_MLS_PROPOSALS: u8 = 27;
    pub(in super::super) const DAVE_MLS_COMMIT_WELCOME: u8 = 28;
    pub(in super::super) const DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION: u8 = 29;
    pub(in super::super) const DAVE_MLS_WELCOME: u8 = 30;
    pub(in super::super) const DAVE_MLS_INVALID_COMMIT_WELCOME: u8 = 31;
}
