use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::playback::VoiceSink;
use crate::error::{Error, Result};

use self::dave::DaveHandler;
use self::gateway::{Handler, Socket};
use self::payload::{op, VoicePayload};
use self::sender::{outbound_queue, send_loop, FrameSender, VoiceTransport};
use self::udp::{RtpSealer, UdpBackend};

mod dave;
mod gateway;
mod payload;
mod sender;
mod udp;

const VOICE_GATEWAY_VERSION: u8 = 8;
const MAX_DAVE_PROTOCOL_VERSION: u16 = 1;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// What the main gateway hands over for a voice connection.
pub(crate) struct VoiceServerInfo {
    pub(crate) guild_id: Box<str>,
    pub(crate) channel_id: Box<str>,
    pub(crate) user_id: Box<str>,
    pub(crate) session_id: Box<str>,
    pub(crate) token: Box<str>,
    pub(crate) endpoint: Box<str>,
}

/// A joined voice channel accepting Opus frames.
pub(crate) struct VoiceConnection {
    guild_id: Box<str>,
    frames: FrameSender,
    cancel: CancellationToken,
    sender: JoinHandle<()>,
    driver: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl VoiceConnection {
    pub(crate) async fn connect(info: VoiceServerInfo) -> Result<VoiceConnection> {
        let user_id = parse_snowflake(&info.user_id)?;
        let channel_id = parse_snowflake(&info.channel_id)?;

        let url = format!("wss://{}/?v={VOICE_GATEWAY_VERSION}", info.endpoint);
        debug!(guild_id = %info.guild_id, %url, "connecting to voice gateway");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (output_stream, mut input) = socket.split();

        let cancel = CancellationToken::new();
        let (output, receiver) = unbounded_channel();
        let writer = spawn(write_loop(output_stream, receiver, cancel.clone()));

        let identify = VoicePayload::new(
            op::IDENTIFY,
            json!({
                "server_id": info.guild_id,
                "user_id": info.user_id,
                "session_id": info.session_id,
                "token": info.token,
                "max_dave_protocol_version": MAX_DAVE_PROTOCOL_VERSION,
            }),
        );
        output
            .send(Message::Text(serde_json::to_string(&identify)?))
            .map_err(|_| Error::VoiceClosed)?;

        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let dave = Arc::new(Mutex::new(DaveHandler::new(user_id, channel_id)));
        let mut handler = Handler::new(
            info.guild_id.clone(),
            user_id,
            output.clone(),
            udp.clone(),
            dave.clone(),
            cancel.clone(),
        );

        let established = match timeout(HANDSHAKE_TIMEOUT, handler.handshake(&mut input)).await {
            Ok(Ok(established)) => established,
            outcome => {
                cancel.cancel();
                return Err(match outcome {
                    Ok(Err(e)) => e,
                    _ => Error::Timeout("the voice session description"),
                });
            }
        };
        let driver = spawn(handler.run(input));

        let backend = UdpBackend::new(
            udp,
            established.address,
            RtpSealer::new(established.ssrc, established.secret_key, established.mode),
        );
        let transport = VoiceTransport::new(backend, dave, output, established.ssrc);
        let (frames, queue) = outbound_queue();
        let sender = spawn(send_loop(queue, transport, cancel.clone()));

        info!(guild_id = %info.guild_id, channel_id = %info.channel_id, "voice connected");
        Ok(VoiceConnection {
            guild_id: info.guild_id,
            frames,
            cancel,
            sender,
            driver,
            writer,
        })
    }

    /// Lets the sender flush its queue and trailing silence, then closes the
    /// voice gateway.
    pub(crate) async fn disconnect(self) {
        drop(self.frames);
        if timeout(SHUTDOWN_TIMEOUT, self.sender).await.is_err() {
            debug!("voice sender did not stop in time");
        }
        self.cancel.cancel();
        if timeout(SHUTDOWN_TIMEOUT, self.writer).await.is_err() {
            debug!("voice writer did not stop in time");
        }
        self.driver.abort();
        info!(guild_id = %self.guild_id, "voice disconnected");
    }
}

#[async_trait]
impl VoiceSink for VoiceConnection {
    async fn speaking(&mut self, speaking: bool) -> Result<()> {
        self.frames.speaking(speaking).await
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        self.frames.send_frame(frame).await
    }
}

fn parse_snowflake(id: &str) -> Result<u64> {
    id.parse()
        .map_err(|_| Error::VoiceHandshake(format!("{id:?} is not a snowflake")))
}

async fn write_loop(
    mut output_stream: SplitSink<Socket, Message>,
    mut receiver: UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        // Queued messages go out before a cancel takes effect.
        let message = tokio::select! {
            biased;
            message = receiver.recv() => message,
            _ = cancel.cancelled() => break,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = output_stream.send(message).await {
            warn!("voice gateway write error: {e}");
            return;
        }
    }
    let _ = output_stream.close().await;
}
