use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::XChaCha20Poly1305;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Error, Result};

const RTP_VERSION_BYTE: u8 = 0x80;
const RTP_OPUS_PAYLOAD_TYPE: u8 = 0x78;
const RTP_HEADER_LEN: usize = 12;
/// Samples per 20ms frame at 48kHz.
const RTP_TIMESTAMP_STEP: u32 = 960;
const DISCOVERY_PACKET_SIZE: usize = 74;
const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport encryption modes this client can speak, most preferred first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Mode {
    Aes256GcmRtpSize,
    XChaCha20Poly1305RtpSize,
}

impl Mode {
    const PREFERENCE: [Mode; 2] = [Mode::Aes256GcmRtpSize, Mode::XChaCha20Poly1305RtpSize];

    pub(super) fn name(self) -> &'static str {
        match self {
            Mode::Aes256GcmRtpSize => "aead_aes256_gcm_rtpsize",
            Mode::XChaCha20Poly1305RtpSize => "aead_xchacha20_poly1305_rtpsize",
        }
    }

    pub(super) fn from_name(name: &str) -> Option<Mode> {
        Self::PREFERENCE.into_iter().find(|m| m.name() == name)
    }

    /// Best mode among those the server offers.
    pub(super) fn select<'a>(offered: impl IntoIterator<Item = &'a str> + Clone) -> Option<Mode> {
        Self::PREFERENCE
            .into_iter()
            .find(|m| offered.clone().into_iter().any(|o| o == m.name()))
    }
}

enum Cipher {
    Aes256Gcm(Box<Aes256Gcm>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

/// Seals Opus frames into encrypted RTP packets.
pub(super) struct RtpSealer {
    ssrc: u32,
    cipher: Cipher,
    sequence: u16,
    timestamp: u32,
    nonce: u32,
    packet: Vec<u8>,
}

impl RtpSealer {
    pub(super) fn new(ssrc: u32, secret_key: [u8; 32], mode: Mode) -> Self {
        let cipher = match mode {
            Mode::Aes256GcmRtpSize => Cipher::Aes256Gcm(Box::new(Aes256Gcm::new(&secret_key.into()))),
            Mode::XChaCha20Poly1305RtpSize => {
                Cipher::XChaCha20Poly1305(Box::new(XChaCha20Poly1305::new(&secret_key.into())))
            }
        };
        RtpSealer {
            ssrc,
            cipher,
            sequence: 0,
            timestamp: 0,
            nonce: 0,
            packet: Vec::with_capacity(1500),
        }
    }

    /// Builds the next packet: RTP header, encrypted payload, tag, then the
    /// 4-byte nonce counter.
    pub(super) fn seal(&mut self, payload: &[u8]) -> Result<&[u8]> {
        let header = rtp_header(self.sequence, self.timestamp, self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(RTP_TIMESTAMP_STEP);
        let counter = self.nonce.to_be_bytes();
        self.nonce = self.nonce.wrapping_add(1);

        self.packet.clear();
        self.packet.extend_from_slice(&header);
        self.packet.extend_from_slice(payload);
        let body = &mut self.packet[RTP_HEADER_LEN..];

        let tag = match &self.cipher {
            Cipher::Aes256Gcm(cipher) => {
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(&counter);
                cipher
                    .encrypt_in_place_detached(&nonce.into(), &header, body)
                    .map(|tag| tag.to_vec())
            }
            Cipher::XChaCha20Poly1305(cipher) => {
                let mut nonce = [0u8; 24];
                nonce[..4].copy_from_slice(&counter);
                cipher
                    .encrypt_in_place_detached(&nonce.into(), &header, body)
                    .map(|tag| tag.to_vec())
            }
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        self.packet.extend_from_slice(&tag);
        self.packet.extend_from_slice(&counter);
        Ok(&self.packet)
    }
}

fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = RTP_VERSION_BYTE;
    header[1] = RTP_OPUS_PAYLOAD_TYPE;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

pub(super) struct UdpBackend {
    socket: Arc<UdpSocket>,
    address: SocketAddr,
    sealer: RtpSealer,
}

impl UdpBackend {
    pub(super) fn new(socket: Arc<UdpSocket>, address: SocketAddr, sealer: RtpSealer) -> Self {
        UdpBackend {
            socket,
            address,
            sealer,
        }
    }

    pub(super) async fn send_opus_packet(&mut self, payload: &[u8]) -> Result<()> {
        let packet = self.sealer.seal(payload)?;
        self.socket.send_to(packet, self.address).await?;
        Ok(())
    }
}

/// Asks the voice server which address and port it sees us on.
pub(super) async fn discover_ip(socket: &UdpSocket, addr: SocketAddr, ssrc: u32) -> Result<(String, u16)> {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    packet[0..2].copy_from_slice(&1u16.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    socket.send_to(&packet, addr).await?;

    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    let n = timeout(IP_DISCOVERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Timeout("IP discovery"))??;
    parse_discovery_response(&buf[..n])
}

fn parse_discovery_response(buf: &[u8]) -> Result<(String, u16)> {
    if buf.len() < DISCOVERY_PACKET_SIZE || buf[0..2] != 2u16.to_be_bytes() {
        return Err(Error::VoiceHandshake("malformed IP discovery response".into()));
    }
    let address = std::str::from_utf8(&buf[8..72])
        .map_err(|e| Error::VoiceHandshake(e.to_string()))?
        .trim_end_matches('\0')
        .to_string();
    let port = u16::from_be_bytes([buf[72], buf[73]]);
    Ok((address, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::Aead;

    #[test]
    fn prefers_aes_when_offered() {
        let offered = ["aead_xchacha20_poly1305_rtpsize", "aead_aes256_gcm_rtpsize", "xsalsa20_poly1305"];
        assert_eq!(Mode::select(offered), Some(Mode::Aes256GcmRtpSize));
        assert_eq!(
            Mode::select(["aead_xchacha20_poly1305_rtpsize"]),
            Some(Mode::XChaCha20Poly1305RtpSize)
        );
        assert_eq!(Mode::select(["xsalsa20_poly1305"]), None);
        assert_eq!(Mode::from_name("aead_aes256_gcm_rtpsize"), Some(Mode::Aes256GcmRtpSize));
    }

    #[test]
    fn sealed_packet_opens_with_header_as_aad() {
        let key = [7u8; 32];
        let mut sealer = RtpSealer::new(0xDEADBEEF, key, Mode::Aes256GcmRtpSize);
        sealer.seal(b"first").unwrap();
        let packet = sealer.seal(b"second").unwrap().to_vec();

        let header = &packet[..RTP_HEADER_LEN];
        assert_eq!(header[0], RTP_VERSION_BYTE);
        assert_eq!(header[1], RTP_OPUS_PAYLOAD_TYPE);
        assert_eq!(&header[2..4], &1u16.to_be_bytes());
        assert_eq!(&header[4..8], &RTP_TIMESTAMP_STEP.to_be_bytes());
        assert_eq!(&header[8..12], &0xDEADBEEFu32.to_be_bytes());

        let counter = &packet[packet.len() - 4..];
        assert_eq!(counter, &1u32.to_be_bytes());

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(counter);
        let opened = Aes256Gcm::new(&key.into())
            .decrypt(
                &nonce.into(),
                aes_gcm::aead::Payload {
                    msg: &packet[RTP_HEADER_LEN..packet.len() - 4],
                    aad: header,
                },
            )
            .unwrap();
        assert_eq!(opened, b"second");
    }

    #[test]
    fn xchacha_packet_opens() {
        let key = [3u8; 32];
        let mut sealer = RtpSealer::new(1, key, Mode::XChaCha20Poly1305RtpSize);
        let packet = sealer.seal(b"\xf8\xff\xfe").unwrap().to_vec();

        let mut nonce = [0u8; 24];
        nonce[..4].copy_from_slice(&packet[packet.len() - 4..]);
        let opened = XChaCha20Poly1305::new(&key.into())
            .decrypt(
                &nonce.into(),
                aes_gcm::aead::Payload {
                    msg: &packet[RTP_HEADER_LEN..packet.len() - 4],
                    aad: &packet[..RTP_HEADER_LEN],
                },
            )
            .unwrap();
        assert_eq!(opened, b"\xf8\xff\xfe");
    }

    #[test]
    fn discovery_response_yields_address_and_port() {
        let mut response = [0u8; DISCOVERY_PACKET_SIZE];
        response[0..2].copy_from_slice(&2u16.to_be_bytes());
        response[2..4].copy_from_slice(&70u16.to_be_bytes());
        response[8..8 + 11].copy_from_slice(b"203.0.113.9");
        response[72..74].copy_from_slice(&50004u16.to_be_bytes());

        let (address, port) = parse_discovery_response(&response).unwrap();
        assert_eq!(address, "203.0.113.9");
        assert_eq!(port, 50004);
    }

    #[test]
    fn short_discovery_response_is_rejected() {
        assert!(parse_discovery_response(&[0, 2, 0, 70]).is_err());
    }
}
