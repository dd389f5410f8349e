use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::Result;

/// Pause around speaking-state changes while the media path settles.
pub(crate) const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Longest a non-final chime may run before the next one starts.
pub(crate) const CHIME_SPACING: Duration = Duration::from_millis(4000);

#[async_trait]
pub(crate) trait VoiceSink: Send {
    async fn speaking(&mut self, speaking: bool) -> Result<()>;

    /// Queues one encoded frame. Resolves once the transport has room for it.
    async fn send_frame(&mut self, frame: Bytes) -> Result<()>;
}

/// Plays `frames` once per chime. Every chime but the last is cut off after
/// [`CHIME_SPACING`].
pub(crate) async fn play_chimes<S>(sink: &mut S, frames: &[Bytes], chimes: u32) -> Result<()>
where
    S: VoiceSink + ?Sized,
{
    sleep(SETTLE_DELAY).await;
    sink.speaking(true).await?;

    let rung = ring(sink, frames, chimes).await;
    // The speaking flag is cleared even when a frame could not be sent.
    let stopped = sink.speaking(false).await;
    rung.and(stopped)?;

    sleep(SETTLE_DELAY).await;
    Ok(())
}

async fn ring<S>(sink: &mut S, frames: &[Bytes], chimes: u32) -> Result<()>
where
    S: VoiceSink + ?Sized,
{
    for chime in 0..chimes {
        let last = chime + 1 == chimes;
        let start = Instant::now();
        let mut sent = 0;

        for frame in frames {
            sink.send_frame(frame.clone()).await?;
            sent += 1;

            if !last && start.elapsed() > CHIME_SPACING {
                break;
            }
        }
        debug!(chime = chime + 1, of = chimes, frames = sent, "chime played");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const FRAME_TIME: Duration = Duration::from_millis(20);

    #[derive(Debug, PartialEq)]
    enum Event {
        Speaking(bool),
        Frame(u16),
    }

    /// Accepts one frame every 20ms, like the real outbound queue.
    #[derive(Default)]
    struct RealtimeSink {
        events: Vec<Event>,
        stall_after: Option<usize>,
    }

    impl RealtimeSink {
        fn frames(&self) -> Vec<u16> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Frame(n) => Some(*n),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl VoiceSink for RealtimeSink {
        async fn speaking(&mut self, speaking: bool) -> Result<()> {
            self.events.push(Event::Speaking(speaking));
            Ok(())
        }

        async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
            if self.stall_after == Some(self.frames().len()) {
                return Err(Error::SendStalled);
            }
            sleep(FRAME_TIME).await;
            self.events
                .push(Event::Frame(u16::from_be_bytes([frame[0], frame[1]])));
            Ok(())
        }
    }

    fn numbered(count: u16) -> Vec<Bytes> {
        (0..count)
            .map(|n| Bytes::copy_from_slice(&n.to_be_bytes()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn short_clip_plays_whole_each_chime() {
        let frames = numbered(10);
        let mut sink = RealtimeSink::default();

        play_chimes(&mut sink, &frames, 3).await.unwrap();

        assert_eq!(sink.events.first(), Some(&Event::Speaking(true)));
        assert_eq!(sink.events.last(), Some(&Event::Speaking(false)));
        let expected: Vec<u16> = (0..3).flat_map(|_| 0..10).collect();
        assert_eq!(sink.frames(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn long_clip_is_cut_between_chimes_but_not_at_the_end() {
        // 10 seconds of audio at 20ms per frame.
        let frames = numbered(500);
        let mut sink = RealtimeSink::default();

        play_chimes(&mut sink, &frames, 2).await.unwrap();

        let sent = sink.frames();
        let second_start = sent.iter().skip(1).position(|&n| n == 0).unwrap() + 1;
        // 4000ms / 20ms is 200 frames; the frame that crosses the line still goes out.
        assert_eq!(second_start, 201);
        assert_eq!(sent.len() - second_start, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn single_chime_is_never_cut() {
        let frames = numbered(400);
        let mut sink = RealtimeSink::default();

        play_chimes(&mut sink, &frames, 1).await.unwrap();

        assert_eq!(sink.frames().len(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delays_bracket_playback() {
        let frames = numbered(5);
        let mut sink = RealtimeSink::default();
        let start = Instant::now();

        play_chimes(&mut sink, &frames, 1).await.unwrap();

        assert_eq!(start.elapsed(), SETTLE_DELAY * 2 + FRAME_TIME * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_still_clears_speaking() {
        let frames = numbered(50);
        let mut sink = RealtimeSink {
            stall_after: Some(70),
            ..RealtimeSink::default()
        };

        let err = play_chimes(&mut sink, &frames, 3).await.unwrap_err();

        assert!(matches!(err, Error::SendStalled));
        assert_eq!(sink.frames().len(), 70);
        assert_eq!(sink.events.last(), Some(&Event::Speaking(false)));
    }
}
