use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) mod playback;

/// Loads a length-prefixed Opus frame file from disk.
pub(crate) fn load_sound(path: impl AsRef<Path>) -> Result<Vec<Bytes>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| Error::SoundOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let frames = load_frames(BufReader::new(file))?;
    debug!(frames = frames.len(), path = %path.display(), "sound loaded");
    Ok(frames)
}

/// Reads `[u16 LE length][payload]` records until the stream ends exactly on
/// a record boundary. Any other end of stream is an error.
pub(crate) fn load_frames<R: BufRead>(mut reader: R) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();

    loop {
        if reader.fill_buf().map_err(Error::SoundRead)?.is_empty() {
            return Ok(frames);
        }

        let len = reader
            .read_u16::<LittleEndian>()
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::TruncatedLength(frames.len()),
                _ => Error::SoundRead(e),
            })?;

        let mut frame = vec![0; len as usize];
        reader.read_exact(&mut frame).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::TruncatedFrame {
                index: frames.len(),
                expected: len,
            },
            _ => Error::SoundRead(e),
        })?;

        frames.push(Bytes::from(frame));
    }
}

/// Number of chimes for an hour of the day on a 12-hour clock.
pub(crate) fn chime_count(hour: u32) -> u32 {
    match hour % 12 {
        0 => 12,
        h => h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            out.extend_from_slice(chunk);
        }
        out
    }

    #[test]
    fn frames_come_back_in_file_order() {
        let big = vec![0xAB; u16::MAX as usize];
        let chunks: [&[u8]; 4] = [b"\xf8\xff\xfe", b"", &big, b"opus"];

        let frames = load_frames(Cursor::new(encode(&chunks))).unwrap();

        assert_eq!(frames.len(), 4);
        for (frame, chunk) in frames.iter().zip(chunks) {
            assert_eq!(frame.as_ref(), chunk);
        }
    }

    #[test]
    fn empty_file_is_zero_frames() {
        let frames = load_frames(Cursor::new(Vec::new())).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn short_payload_is_an_error() {
        let mut data = encode(&[b"abc"]);
        data.extend_from_slice(&10u16.to_le_bytes());
        data.extend_from_slice(b"short");

        match load_frames(Cursor::new(data)) {
            Err(Error::TruncatedFrame { index, expected }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, 10);
            }
            other => panic!("expected truncated frame, got {other:?}"),
        }
    }

    #[test]
    fn length_without_payload_is_an_error() {
        let data = 4u16.to_le_bytes().to_vec();
        assert!(matches!(
            load_frames(Cursor::new(data)),
            Err(Error::TruncatedFrame { index: 0, expected: 4 })
        ));
    }

    #[test]
    fn half_a_length_field_is_an_error() {
        let mut data = encode(&[b"abc", b"de"]);
        data.push(0x07);
        assert!(matches!(
            load_frames(Cursor::new(data)),
            Err(Error::TruncatedLength(2))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_sound("does-not-exist.dca").unwrap_err();
        assert!(matches!(err, Error::SoundOpen { .. }));
        assert!(err.to_string().contains("does-not-exist.dca"));
    }

    #[test]
    fn hours_map_onto_twelve_hour_clock() {
        assert_eq!(chime_count(0), 12);
        assert_eq!(chime_count(1), 1);
        assert_eq!(chime_count(12), 12);
        assert_eq!(chime_count(13), 1);
        assert_eq!(chime_count(23), 11);
    }
}
