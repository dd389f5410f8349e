use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

use super::dave::{DaveHandler, Handshake};
use super::payload::{op, VoicePayload};
use super::udp::{discover_ip, Mode};

pub(super) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the sender needs once the session description arrives.
pub(super) struct Established {
    pub(super) ssrc: u32,
    pub(super) address: SocketAddr,
    pub(super) secret_key: [u8; 32],
    pub(super) mode: Mode,
}

/// Voice gateway state for one connection.
pub(super) struct Handler {
    guild_id: Box<str>,
    output: UnboundedSender<Message>,
    seq_ack: Arc<AtomicI64>,
    socket: Arc<UdpSocket>,
    dave: Arc<Mutex<DaveHandler>>,
    connected_users: HashSet<u64>,
    ssrc: u32,
    address: Option<SocketAddr>,
    heartbeat: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Handler {
    pub(super) fn new(
        guild_id: Box<str>,
        user_id: u64,
        output: UnboundedSender<Message>,
        socket: Arc<UdpSocket>,
        dave: Arc<Mutex<DaveHandler>>,
        cancel: CancellationToken,
    ) -> Self {
        Handler {
            guild_id,
            output,
            seq_ack: Arc::new(AtomicI64::new(-1)),
            socket,
            dave,
            connected_users: HashSet::from([user_id]),
            ssrc: 0,
            address: None,
            heartbeat: None,
            cancel,
        }
    }

    /// Reads until the session description arrives.
    pub(super) async fn handshake(&mut self, input: &mut SplitStream<Socket>) -> Result<Established> {
        while let Some(message) = input.next().await {
            match message? {
                Message::Text(text) => {
                    if let Some(established) = self.handle_text(&text).await? {
                        return Ok(established);
                    }
                }
                Message::Binary(bin) => self.handle_binary(&bin).await,
                Message::Close(frame) => {
                    return Err(Error::VoiceHandshake(format!("closed during handshake: {frame:?}")));
                }
                _ => {}
            }
        }
        Err(Error::VoiceClosed)
    }

    /// Keeps the connection serviced until it closes or is cancelled.
    pub(super) async fn run(mut self, mut input: SplitStream<Socket>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = input.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = self.handle_text(&text).await {
                        warn!(guild_id = %self.guild_id, "voice gateway error: {e}");
                    }
                }
                Some(Ok(Message::Binary(bin))) => self.handle_binary(&bin).await,
                Some(Ok(Message::Close(frame))) => {
                    info!(guild_id = %self.guild_id, ?frame, "voice gateway closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(guild_id = %self.guild_id, "voice gateway read error: {e}");
                    break;
                }
                None => break,
            }
        }
        self.cancel.cancel();
    }

    async fn handle_text(&mut self, text: &str) -> Result<Option<Established>> {
        trace!(%text, "voice gateway receive");
        let payload: VoicePayload = serde_json::from_str(text)?;
        if let Some(seq) = payload.seq {
            self.seq_ack.store(seq, Ordering::Relaxed);
        }

        match payload.op {
            op::HELLO => self.handle_hello(payload.d)?,
            op::READY => self.handle_ready(payload.d).await?,
            op::SESSION_DESCRIPTION => return self.handle_session_description(payload.d).await.map(Some),
            op::HEARTBEAT_ACK => {}
            op::CLIENTS_CONNECT => {
                #[derive(Deserialize)]
                struct ClientsConnect {
                    user_ids: Vec<String>,
                }
                let clients: ClientsConnect = serde_json::from_value(payload.d)?;
                self.connected_users
                    .extend(clients.user_ids.iter().filter_map(|id| id.parse::<u64>().ok()));
            }
            op::CLIENT_DISCONNECT => {
                if let Some(id) = payload.d["user_id"].as_str().and_then(|id| id.parse::<u64>().ok()) {
                    self.connected_users.remove(&id);
                }
            }
            op::DAVE_PREPARE_TRANSITION => {
                let (transition_id, version) = transition_fields(&payload.d);
                if self.dave.lock().await.prepare_transition(transition_id, version) {
                    self.send_json(op::DAVE_TRANSITION_READY, json!({ "transition_id": transition_id }))?;
                }
            }
            op::DAVE_EXECUTE_TRANSITION => {
                let (transition_id, _) = transition_fields(&payload.d);
                self.dave.lock().await.execute_transition(transition_id);
            }
            op::DAVE_PREPARE_EPOCH => {
                let epoch = payload.d["epoch"].as_u64().unwrap_or(0);
                let (_, version) = transition_fields(&payload.d);
                let key_package = self.dave.lock().await.prepare_epoch(epoch, version);
                if let Some(key_package) = key_package {
                    self.send_binary(op::DAVE_MLS_KEY_PACKAGE, &key_package)?;
                }
            }
            other => debug!(op = other, "ignoring voice opcode"),
        }
        Ok(None)
    }

    fn handle_hello(&mut self, d: Value) -> Result<()> {
        #[derive(Deserialize)]
        struct Hello {
            heartbeat_interval: f64,
        }
        let hello: Hello = serde_json::from_value(d)?;
        let interval = Duration::from_millis((hello.heartbeat_interval as u64).max(1));
        debug!(guild_id = %self.guild_id, ?interval, "voice heartbeat");

        if let Some(previous) = self.heartbeat.take() {
            previous.abort();
        }
        self.heartbeat = Some(spawn_heartbeat(
            self.output.clone(),
            self.seq_ack.clone(),
            interval,
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn handle_ready(&mut self, d: Value) -> Result<()> {
        #[derive(Deserialize)]
        struct Ready {
            ssrc: u32,
            ip: String,
            port: u16,
            modes: Vec<String>,
        }
        let ready: Ready = serde_json::from_value(d)?;
        let address: SocketAddr = format!("{}:{}", ready.ip, ready.port)
            .parse()
            .map_err(|_| Error::VoiceHandshake(format!("bad voice server address {}", ready.ip)))?;
        let mode = Mode::select(ready.modes.iter().map(String::as_str)).ok_or_else(|| {
            Error::VoiceHandshake(format!("no supported encryption mode in {:?}", ready.modes))
        })?;
        debug!(guild_id = %self.guild_id, ssrc = ready.ssrc, %address, mode = mode.name(), "voice ready");

        let (external_ip, external_port) = discover_ip(&self.socket, address, ready.ssrc).await?;
        self.ssrc = ready.ssrc;
        self.address = Some(address);

        self.send_json(
            op::SELECT_PROTOCOL,
            json!({
                "protocol": "udp",
                "data": { "address": external_ip, "port": external_port, "mode": mode.name() }
            }),
        )
    }

    async fn handle_session_description(&mut self, d: Value) -> Result<Established> {
        #[derive(Deserialize)]
        struct SessionDescription {
            mode: String,
            secret_key: Vec<u8>,
            #[serde(default)]
            dave_protocol_version: u16,
        }
        let description: SessionDescription = serde_json::from_value(d)?;

        let secret_key: [u8; 32] = description
            .secret_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::VoiceHandshake("secret key is not 32 bytes".into()))?;
        let mode = Mode::from_name(&description.mode)
            .ok_or_else(|| Error::VoiceHandshake(format!("server chose unknown mode {}", description.mode)))?;
        let address = self
            .address
            .ok_or_else(|| Error::VoiceHandshake("session description before ready".into()))?;

        if description.dave_protocol_version > 0 {
            let key_package = self
                .dave
                .lock()
                .await
                .start(description.dave_protocol_version)?;
            self.send_binary(op::DAVE_MLS_KEY_PACKAGE, &key_package)?;
        }
        info!(
            guild_id = %self.guild_id,
            mode = mode.name(),
            dave = description.dave_protocol_version,
            "voice session established"
        );

        Ok(Established {
            ssrc: self.ssrc,
            address,
            secret_key,
            mode,
        })
    }

    async fn handle_binary(&mut self, bin: &[u8]) {
        let [hi, lo, opcode, payload @ ..] = bin else {
            return;
        };
        self.seq_ack
            .store(u16::from_be_bytes([*hi, *lo]) as i64, Ordering::Relaxed);

        let result = match *opcode {
            op::DAVE_MLS_EXTERNAL_SENDER => self.handle_external_sender(payload).await,
            op::DAVE_MLS_PROPOSALS => self.handle_proposals(payload).await,
            op::DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION | op::DAVE_MLS_WELCOME => {
                self.handle_commit_or_welcome(*opcode, payload).await
            }
            other => {
                debug!(op = other, "ignoring binary voice opcode");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(guild_id = %self.guild_id, "DAVE message {opcode} failed: {e}");
        }
    }

    async fn handle_external_sender(&mut self, payload: &[u8]) -> Result<()> {
        let responses = self
            .dave
            .lock()
            .await
            .set_external_sender(payload, &self.connected_users)?;
        for response in responses {
            self.send_binary(op::DAVE_MLS_COMMIT_WELCOME, &response)?;
        }
        Ok(())
    }

    async fn handle_proposals(&mut self, payload: &[u8]) -> Result<()> {
        let mut dave = self.dave.lock().await;
        match dave.proposals(payload, &self.connected_users) {
            Ok(Some(commit)) => self.send_binary(op::DAVE_MLS_COMMIT_WELCOME, &commit),
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(guild_id = %self.guild_id, "DAVE proposals failed, restarting session: {e}");
                self.restart_dave(&mut dave, 0)
            }
        }
    }

    async fn handle_commit_or_welcome(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let mut dave = self.dave.lock().await;
        let kind = if opcode == op::DAVE_MLS_WELCOME {
            Handshake::Welcome
        } else {
            Handshake::Commit
        };
        match dave.handshake(kind, payload) {
            Ok(0) => Ok(()),
            Ok(transition_id) => {
                self.send_json(op::DAVE_TRANSITION_READY, json!({ "transition_id": transition_id }))
            }
            Err(e) => {
                let transition_id = match payload {
                    [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                    _ => 0,
                };
                warn!(guild_id = %self.guild_id, "DAVE transition failed, restarting session: {e}");
                self.restart_dave(&mut dave, transition_id)
            }
        }
    }

    /// Reports the invalid commit and rejoins the group with a new key package.
    fn restart_dave(&self, dave: &mut DaveHandler, transition_id: u16) -> Result<()> {
        let version = dave.version().max(1);
        self.send_json(
            op::DAVE_MLS_INVALID_COMMIT_WELCOME,
            json!({ "transition_id": transition_id }),
        )?;
        let key_package = dave.restart(version)?;
        self.send_binary(op::DAVE_MLS_KEY_PACKAGE, &key_package)
    }

    fn send_json(&self, op: u8, d: Value) -> Result<()> {
        let text = serde_json::to_string(&VoicePayload::new(op, d))?;
        trace!(%text, "voice gateway send");
        self.output
            .send(Message::Text(text))
            .map_err(|_| Error::VoiceClosed)
    }

    fn send_binary(&self, op: u8, payload: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(op);
        out.extend_from_slice(payload);
        self.output
            .send(Message::Binary(out))
            .map_err(|_| Error::VoiceClosed)
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

fn transition_fields(d: &Value) -> (u16, u16) {
    (
        d["transition_id"].as_u64().unwrap_or(0) as u16,
        d["protocol_version"].as_u64().unwrap_or(0) as u16,
    )
}

fn spawn_heartbeat(
    output: UnboundedSender<Message>,
    seq_ack: Arc<AtomicI64>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let nonce = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let heartbeat = VoicePayload::new(
                op::HEARTBEAT,
                json!({ "t": nonce, "seq_ack": seq_ack.load(Ordering::Relaxed) }),
            );
            let Ok(text) = serde_json::to_string(&heartbeat) else {
                break;
            };
            if output.send(Message::Text(text)).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_fields_default_to_zero() {
        assert_eq!(
            transition_fields(&json!({"transition_id": 3, "protocol_version": 1})),
            (3, 1)
        );
        assert_eq!(transition_fields(&json!({})), (0, 0));
    }
}
