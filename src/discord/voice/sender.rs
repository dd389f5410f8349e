use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audio::playback::VoiceSink;
use crate::error::{Error, Result};

use super::dave::{DaveHandler, SILENCE_FRAME};
use super::payload::{op, VoicePayload};
use super::udp::UdpBackend;

/// One Opus frame every 20ms.
const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Items the sender may hold before playback waits.
const QUEUE_CAPACITY: usize = 2;
/// An item that cannot be queued for this long means the transport is stuck.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Silence after the last frame so clients do not interpolate.
const TRAILING_SILENCE_FRAMES: usize = 5;

/// What playback hands to the sender task, in playback order.
pub(super) enum Outbound {
    Frame(Bytes),
    Speaking(bool),
}

/// Playback end of the outbound queue.
pub(super) struct FrameSender {
    queue: mpsc::Sender<Outbound>,
}

pub(super) fn outbound_queue() -> (FrameSender, mpsc::Receiver<Outbound>) {
    let (queue, receiver) = mpsc::channel(QUEUE_CAPACITY);
    (FrameSender { queue }, receiver)
}

impl FrameSender {
    async fn push(&self, item: Outbound) -> Result<()> {
        match timeout(SEND_TIMEOUT, self.queue.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::VoiceClosed),
            Err(_) => Err(Error::SendStalled),
        }
    }
}

#[async_trait]
impl VoiceSink for FrameSender {
    async fn speaking(&mut self, speaking: bool) -> Result<()> {
        self.push(Outbound::Speaking(speaking)).await
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        self.push(Outbound::Frame(frame)).await
    }
}

/// Where paced audio and speaking updates end up.
#[async_trait]
pub(super) trait Transport: Send {
    async fn send_audio(&mut self, frame: &[u8]);

    fn set_speaking(&mut self, speaking: bool);
}

/// Drains the queue at playback speed.
///
/// Frames leave one per tick. A speaking-off update is held back until the
/// frames before it and a short run of silence have gone out, and the same
/// silence closes the stream when the queue is dropped.
pub(super) async fn send_loop<T: Transport>(
    mut queue: mpsc::Receiver<Outbound>,
    mut transport: T,
    cancel: CancellationToken,
) {
    let mut ticker = interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut speaking = false;
    let mut unsilenced = false;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = queue.recv() => item,
        };
        match item {
            Some(Outbound::Frame(frame)) => {
                ticker.tick().await;
                transport.send_audio(&frame).await;
                unsilenced = true;
            }
            Some(Outbound::Speaking(true)) => {
                transport.set_speaking(true);
                speaking = true;
            }
            Some(Outbound::Speaking(false)) => {
                if mem::take(&mut unsilenced) {
                    send_silence(&mut ticker, &mut transport).await;
                }
                transport.set_speaking(false);
                speaking = false;
            }
            None => break,
        }
    }

    if unsilenced {
        send_silence(&mut ticker, &mut transport).await;
    }
    if speaking {
        transport.set_speaking(false);
    }
}

async fn send_silence<T: Transport>(ticker: &mut Interval, transport: &mut T) {
    for _ in 0..TRAILING_SILENCE_FRAMES {
        ticker.tick().await;
        transport.send_audio(&SILENCE_FRAME).await;
    }
}

/// Sends audio over UDP and speaking updates over the voice gateway.
pub(super) struct VoiceTransport {
    backend: UdpBackend,
    dave: Arc<Mutex<DaveHandler>>,
    output: UnboundedSender<Message>,
    ssrc: u32,
}

impl VoiceTransport {
    pub(super) fn new(
        backend: UdpBackend,
        dave: Arc<Mutex<DaveHandler>>,
        output: UnboundedSender<Message>,
        ssrc: u32,
    ) -> Self {
        VoiceTransport {
            backend,
            dave,
            output,
            ssrc,
        }
    }
}

#[async_trait]
impl Transport for VoiceTransport {
    async fn send_audio(&mut self, frame: &[u8]) {
        let packet = self.dave.lock().await.encrypt(frame);
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping frame: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.send_opus_packet(&packet).await {
            warn!("voice send failed: {e}");
        }
    }

    fn set_speaking(&mut self, speaking: bool) {
        let payload = VoicePayload::new(
            op::SPEAKING,
            json!({ "speaking": u8::from(speaking), "delay": 0, "ssrc": self.ssrc }),
        );
        let sent = serde_json::to_string(&payload)
            .map_err(Error::from)
            .and_then(|text| {
                self.output
                    .send(Message::Text(text))
                    .map_err(|_| Error::VoiceClosed)
            });
        if let Err(e) = sent {
            warn!(speaking, "could not update speaking state: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Sent {
        Audio(Vec<u8>),
        Speaking(bool),
    }

    #[derive(Clone)]
    struct Recorder {
        start: Instant,
        sent: Arc<StdMutex<Vec<(Duration, Sent)>>>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                start: Instant::now(),
                sent: Arc::default(),
            }
        }

        fn record(&self, sent: Sent) {
            self.sent.lock().unwrap().push((self.start.elapsed(), sent));
        }

        fn events(&self) -> Vec<Sent> {
            mem::take(&mut *self.sent.lock().unwrap())
                .into_iter()
                .map(|(_, sent)| sent)
                .collect()
        }

        fn audio_times(&self) -> Vec<Duration> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, sent)| matches!(sent, Sent::Audio(_)))
                .map(|(at, _)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send_audio(&mut self, frame: &[u8]) {
            self.record(Sent::Audio(frame.to_vec()));
        }

        fn set_speaking(&mut self, speaking: bool) {
            self.record(Sent::Speaking(speaking));
        }
    }

    fn frame(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    fn silence() -> Vec<Sent> {
        (0..TRAILING_SILENCE_FRAMES)
            .map(|_| Sent::Audio(SILENCE_FRAME.to_vec()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_transport_fails_after_the_deadline() {
        let (mut sender, queue) = outbound_queue();

        for n in 0..QUEUE_CAPACITY as u8 {
            sender.send_frame(frame(n)).await.unwrap();
        }
        let start = Instant::now();
        let err = sender.send_frame(frame(9)).await.unwrap_err();
        assert!(matches!(err, Error::SendStalled));
        assert_eq!(start.elapsed(), SEND_TIMEOUT);

        drop(queue);
        let err = sender.send_frame(frame(9)).await.unwrap_err();
        assert!(matches!(err, Error::VoiceClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_leave_one_tick_apart() {
        let (mut sender, queue) = outbound_queue();
        let recorder = Recorder::new();
        let task = tokio::spawn(send_loop(queue, recorder.clone(), CancellationToken::new()));

        for n in 0..6 {
            sender.send_frame(frame(n)).await.unwrap();
        }
        drop(sender);
        task.await.unwrap();

        let times = recorder.audio_times();
        assert_eq!(times.len(), 6 + TRAILING_SILENCE_FRAMES);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], FRAME_DURATION);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speaking_off_follows_the_audio_and_its_silence() {
        let (mut sender, queue) = outbound_queue();
        let recorder = Recorder::new();
        let task = tokio::spawn(send_loop(queue, recorder.clone(), CancellationToken::new()));

        sender.speaking(true).await.unwrap();
        for n in 0..3 {
            sender.send_frame(frame(n)).await.unwrap();
        }
        sender.speaking(false).await.unwrap();
        drop(sender);
        task.await.unwrap();

        let mut expected = vec![
            Sent::Speaking(true),
            Sent::Audio(vec![0]),
            Sent::Audio(vec![1]),
            Sent::Audio(vec![2]),
        ];
        expected.extend(silence());
        expected.push(Sent::Speaking(false));
        assert_eq!(recorder.events(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_queue_ends_with_silence() {
        let (mut sender, queue) = outbound_queue();
        let recorder = Recorder::new();
        let task = tokio::spawn(send_loop(queue, recorder.clone(), CancellationToken::new()));

        sender.speaking(true).await.unwrap();
        sender.send_frame(frame(7)).await.unwrap();
        drop(sender);
        task.await.unwrap();

        let mut expected = vec![Sent::Speaking(true), Sent::Audio(vec![7])];
        expected.extend(silence());
        expected.push(Sent::Speaking(false));
        assert_eq!(recorder.events(), expected);
    }
}
