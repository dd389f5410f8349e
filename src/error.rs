use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("could not open {}: {source}", path.display())]
    SoundOpen { path: PathBuf, source: io::Error },

    #[error("length field after frame {0} is cut short")]
    TruncatedLength(usize),

    #[error("frame {index} is cut short: expected {expected} bytes")]
    TruncatedFrame { index: usize, expected: u16 },

    #[error("reading sound: {0}")]
    SoundRead(#[source] io::Error),

    #[error("token contains characters that cannot be sent in a header")]
    InvalidToken,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("gateway closed before {0}")]
    GatewayClosed(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("voice handshake failed: {0}")]
    VoiceHandshake(String),

    #[error("voice encryption failed: {0}")]
    Encryption(String),

    #[error("DAVE: {0}")]
    Dave(String),

    #[error("outbound audio queue stalled")]
    SendStalled,

    #[error("voice connection closed")]
    VoiceClosed,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
