use std::collections::{HashMap, HashSet};
use std::env::consts::OS;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::spawn;
use tokio::sync::mpsc::{
    channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::model::{GuildCreate, Ready, VoiceServerUpdate, VoiceState};
use super::payload::{
    Opcode, Payload, INTENT_GUILDS, INTENT_GUILD_MEMBERS, INTENT_GUILD_VOICE_STATES,
};
use super::voice::{VoiceConnection, VoiceServerInfo};
use super::{DiscordClient, API_VERSION};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READY_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to wait for guilds announced in READY to stream in.
const GUILD_STREAM_TIMEOUT: Duration = Duration::from_secs(5);
const VOICE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TASK_SHUTDOWN: Duration = Duration::from_millis(500);

/// Voice channel of every user the gateway has told us about, per guild.
#[derive(Default)]
struct VoiceCache {
    channels: HashMap<Box<str>, HashMap<Box<str>, Box<str>>>,
    pending_guilds: HashSet<Box<str>>,
}

impl VoiceCache {
    fn apply(&mut self, guild_id: &str, state: &VoiceState) {
        let guild = self.channels.entry(guild_id.into()).or_default();
        match &state.channel_id {
            Some(channel_id) => {
                guild.insert(state.user_id.clone(), channel_id.clone());
            }
            None => {
                guild.remove(&state.user_id);
            }
        }
    }

    fn guild_available(&mut self, guild: GuildCreate) {
        for state in &guild.voice_states {
            self.apply(&guild.id, state);
        }
        self.pending_guilds.remove(&guild.id);
    }

    fn channel_of(&self, guild_id: &str, user_id: &str) -> Option<Box<str>> {
        self.channels.get(guild_id)?.get(user_id).cloned()
    }
}

enum VoiceEvent {
    State(VoiceState),
    Server(VoiceServerUpdate),
}

struct ReadyInfo {
    user_id: Box<str>,
    session_id: Box<str>,
}

/// An identified gateway connection with a live voice-state cache.
pub(crate) struct Session {
    client: DiscordClient,
    user_id: Box<str>,
    output: Sender<Payload>,
    cache: Arc<RwLock<VoiceCache>>,
    voice_events: Mutex<UnboundedReceiver<VoiceEvent>>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Connects, identifies and waits until READY and the guilds it lists
    /// have arrived.
    pub(crate) async fn open(client: DiscordClient) -> Result<Session> {
        let mut url = Url::parse(client.get_gateway_url().await?.deref())?;
        url.query_pairs_mut()
            .append_pair("v", &API_VERSION.to_string())
            .append_pair("encoding", "json");

        let socket = connect_async(url.as_str()).await?.0;
        let (output_stream, input) = socket.split();
        let (output, receiver) = channel::<Payload>(16);
        let writer = spawn(write_loop(output_stream, receiver));

        let cache = Arc::new(RwLock::new(VoiceCache::default()));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (pending_tx, mut pending_rx) = watch::channel(usize::MAX);
        let (voice_tx, voice_rx) = unbounded_channel();

        let reader = spawn(
            Reader {
                token: client.token.clone(),
                output: output.clone(),
                cache: cache.clone(),
                s: Arc::new(Mutex::new(None)),
                ready: Some(ready_tx),
                pending: pending_tx,
                voice: voice_tx,
                user_id: None,
                cancel: cancel.clone(),
            }
            .run(input),
        );

        let ready = match timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(ready)) => ready,
            outcome => {
                cancel.cancel();
                reader.abort();
                return Err(match outcome {
                    Ok(Err(_)) => Error::GatewayClosed("READY"),
                    _ => Error::Timeout("READY"),
                });
            }
        };
        info!(user_id = %ready.user_id, session_id = %ready.session_id, "gateway ready");

        if timeout(GUILD_STREAM_TIMEOUT, pending_rx.wait_for(|&n| n == 0))
            .await
            .is_err()
        {
            warn!("not every guild arrived in time, voice states may be incomplete");
        }

        Ok(Session {
            client,
            user_id: ready.user_id,
            output,
            cache,
            voice_events: Mutex::new(voice_rx),
            cancel,
            reader,
            writer,
        })
    }

    pub(crate) fn client(&self) -> &DiscordClient {
        &self.client
    }

    pub(crate) async fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> Option<Box<str>> {
        self.cache.read().await.channel_of(guild_id, user_id)
    }

    /// Joins `channel_id` deafened and unmuted and opens its voice connection.
    pub(crate) async fn join_voice(&self, guild_id: &str, channel_id: &str) -> Result<VoiceConnection> {
        let mut events = self.voice_events.lock().await;
        while events.try_recv().is_ok() {}

        self.update_voice_state(guild_id, Some(channel_id)).await?;

        let info = timeout(VOICE_JOIN_TIMEOUT, async {
            let mut session_id = None;
            let mut server = None;
            loop {
                match events.recv().await {
                    Some(VoiceEvent::State(state))
                        if state.guild_id.as_deref() == Some(guild_id) =>
                    {
                        session_id = Some(state.session_id);
                    }
                    Some(VoiceEvent::Server(update)) if update.guild_id.deref() == guild_id => {
                        match update.endpoint {
                            Some(endpoint) => server = Some((update.token, endpoint)),
                            None => debug!("voice server not allocated yet"),
                        }
                    }
                    Some(_) => {}
                    None => return Err(Error::GatewayClosed("the voice server was assigned")),
                }
                if let (Some(session_id), Some((token, endpoint))) = (&session_id, &server) {
                    return Ok(VoiceServerInfo {
                        guild_id: guild_id.into(),
                        channel_id: channel_id.into(),
                        user_id: self.user_id.clone(),
                        session_id: session_id.clone(),
                        token: token.clone(),
                        endpoint: endpoint.clone(),
                    });
                }
            }
        })
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("the voice server")));

        let connection = match info {
            Ok(info) => VoiceConnection::connect(info).await,
            Err(e) => Err(e),
        };
        if connection.is_err() {
            if let Err(e) = self.leave_voice(guild_id).await {
                warn!("could not leave voice after failed join: {e}");
            }
        }
        connection
    }

    pub(crate) async fn leave_voice(&self, guild_id: &str) -> Result<()> {
        self.update_voice_state(guild_id, None).await
    }

    async fn update_voice_state(&self, guild_id: &str, channel_id: Option<&str>) -> Result<()> {
        #[derive(Serialize)]
        struct UpdateVoiceState<'a> {
            guild_id: &'a str,
            channel_id: Option<&'a str>,
            self_mute: bool,
            self_deaf: bool,
        }

        let payload = Payload::new(
            Opcode::VoiceStateUpdate,
            UpdateVoiceState {
                guild_id,
                channel_id,
                self_mute: false,
                self_deaf: true,
            },
        )?;
        self.output
            .send(payload)
            .await
            .map_err(|_| Error::GatewayClosed("the voice state update was sent"))
    }

    /// Stops background tasks and closes the socket.
    pub(crate) async fn close(self) {
        self.cancel.cancel();
        self.reader.abort();
        drop(self.output);
        if timeout(WRITE_TASK_SHUTDOWN, self.writer).await.is_err() {
            debug!("gateway writer did not stop in time");
        }
    }
}

async fn write_loop(mut output_stream: SplitSink<Socket, Message>, mut receiver: Receiver<Payload>) {
    while let Some(payload) = receiver.recv().await {
        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => {
                warn!("could not encode {:?} payload: {e}", payload.op);
                continue;
            }
        };
        trace!(%text, "gateway send");
        if let Err(e) = output_stream.send(Message::text(text)).await {
            warn!("gateway write error: {e}");
            return;
        }
    }
    let _ = output_stream.close().await;
}

struct Reader {
    token: Box<str>,
    output: Sender<Payload>,
    cache: Arc<RwLock<VoiceCache>>,
    s: Arc<Mutex<Option<u64>>>,
    ready: Option<oneshot::Sender<ReadyInfo>>,
    pending: watch::Sender<usize>,
    voice: UnboundedSender<VoiceEvent>,
    user_id: Option<Box<str>>,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(mut self, mut input: SplitStream<Socket>) {
        while let Some(message) = input.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(frame)) => {
                    info!(?frame, "gateway closed");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("gateway read error: {e}");
                    break;
                }
            };
            trace!(%text, "gateway receive");

            let payload: Payload = match serde_json::from_str(&text) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("unreadable gateway payload: {e}");
                    continue;
                }
            };

            match payload.op {
                Opcode::Dispatch => {
                    if let Some(s) = payload.s {
                        self.s.lock().await.replace(s);
                    }
                    if let Some(event_name) = payload.t {
                        if let Err(e) = self.dispatch(&event_name, payload.d).await {
                            warn!("could not handle {event_name}: {e}");
                        }
                    }
                }
                Opcode::Heartbeat => {
                    if self.heartbeat().await.is_err() {
                        break;
                    }
                }
                Opcode::Reconnect | Opcode::InvalidSession => {
                    warn!("gateway asked us to reconnect, ending session");
                    break;
                }
                Opcode::Hello => {
                    #[derive(Deserialize)]
                    struct Hello {
                        heartbeat_interval: u64,
                    }
                    let interval = match serde_json::from_value::<Hello>(payload.d) {
                        Ok(hello) => hello.heartbeat_interval,
                        Err(e) => {
                            warn!("malformed hello: {e}");
                            break;
                        }
                    };
                    if self.identify().await.is_err() {
                        break;
                    }
                    self.spawn_heartbeat(Duration::from_millis(interval));
                }
                Opcode::HeartbeatACK => {}
                op => debug!(?op, "ignoring gateway opcode"),
            }
        }
        self.cancel.cancel();
    }

    async fn dispatch(&mut self, event_name: &str, d: serde_json::Value) -> Result<()> {
        match event_name {
            "READY" => {
                let ready: Ready = serde_json::from_value(d)?;
                let pending = {
                    let mut cache = self.cache.write().await;
                    cache.pending_guilds = ready.guilds.into_iter().map(|g| g.id).collect();
                    cache.pending_guilds.len()
                };
                self.pending.send_replace(pending);
                self.user_id = Some(ready.user.id.clone());
                if let Some(tx) = self.ready.take() {
                    let _ = tx.send(ReadyInfo {
                        user_id: ready.user.id,
                        session_id: ready.session_id,
                    });
                }
            }
            "GUILD_CREATE" => {
                let guild: GuildCreate = serde_json::from_value(d)?;
                debug!(guild_id = %guild.id, voice_states = guild.voice_states.len(), "guild available");
                let pending = {
                    let mut cache = self.cache.write().await;
                    cache.guild_available(guild);
                    cache.pending_guilds.len()
                };
                self.pending.send_replace(pending);
            }
            "VOICE_STATE_UPDATE" => {
                let state: VoiceState = serde_json::from_value(d)?;
                if let Some(guild_id) = &state.guild_id {
                    self.cache.write().await.apply(guild_id, &state);
                }
                if self.user_id.as_deref() == Some(state.user_id.deref()) {
                    let _ = self.voice.send(VoiceEvent::State(state));
                }
            }
            "VOICE_SERVER_UPDATE" => {
                let update: VoiceServerUpdate = serde_json::from_value(d)?;
                let _ = self.voice.send(VoiceEvent::Server(update));
            }
            _ => {}
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        let payload = Payload::new(Opcode::Heartbeat, *self.s.lock().await)?;
        self.output
            .send(payload)
            .await
            .map_err(|_| Error::GatewayClosed("heartbeat"))
    }

    async fn identify(&self) -> Result<()> {
        #[derive(Serialize)]
        struct Identify<'a> {
            token: &'a str,
            properties: ConnectionProperties,
            intents: u32,
        }
        #[derive(Serialize)]
        struct ConnectionProperties {
            os: &'static str,
            browser: &'static str,
            device: &'static str,
        }
        const PKG_NAME: &str = env!("CARGO_PKG_NAME");

        let payload = Payload::new(
            Opcode::Identify,
            Identify {
                token: &self.token,
                properties: ConnectionProperties {
                    os: OS,
                    browser: PKG_NAME,
                    device: PKG_NAME,
                },
                intents: INTENT_GUILDS | INTENT_GUILD_MEMBERS | INTENT_GUILD_VOICE_STATES,
            },
        )?;
        self.output
            .send(payload)
            .await
            .map_err(|_| Error::GatewayClosed("identify"))
    }

    fn spawn_heartbeat(&self, interval: Duration) {
        let output = self.output.clone();
        let s = self.s.clone();
        let cancel = self.cancel.clone();
        spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                let payload = match Payload::new(Opcode::Heartbeat, *s.lock().await) {
                    Ok(payload) => payload,
                    Err(_) => break,
                };
                if output.send(payload).await.is_err() {
                    break;
                }
            }
        });
    }
}
