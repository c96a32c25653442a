//! miIO LAN transport.
//!
//! Every packet is a 32 byte header followed by an AES-128-CBC encrypted JSON
//! payload. The header carries the device id and a stamp learned from an
//! unencrypted hello exchange, plus an MD5 checksum over the whole packet
//! computed with the token in the checksum slot.

use std::time::Duration;
use std::time::Instant;

use aes::cipher::BlockDecryptMut;
use aes::cipher::BlockEncryptMut;
use aes::cipher::KeyIvInit;
use aes::cipher::block_padding::Pkcs7;
use async_trait::async_trait;
use md5::Digest;
use md5::Md5;
use tokio::net::UdpSocket;
use tracing::debug;

use super::device::Connector;
use super::device::DeviceClient;
use super::device::DeviceError;
use super::device::Result;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const PORT: u16 = 54321;
const HEADER_LEN: usize = 32;
const MAGIC: u16 = 0x2131;
const MAX_PACKET: usize = 4096;

/// Per-exchange timeout
const TIMEOUT: Duration = Duration::from_secs(5);

/// Key material derived from a device token
struct Cipher {
    token: [u8; 16],
    key: [u8; 16],
    iv: [u8; 16],
}

impl Cipher {
    fn new(token_hex: &str) -> Result<Self> {
        let bytes = hex::decode(token_hex.trim())
            .map_err(|e| DeviceError::InvalidToken(e.to_string()))?;
        let token: [u8; 16] = bytes
            .try_into()
            .map_err(|_| DeviceError::InvalidToken("expected 32 hex characters".to_string()))?;

        let key: [u8; 16] = Md5::digest(token).into();
        let mut hasher = Md5::new();
        hasher.update(key);
        hasher.update(token);
        let iv: [u8; 16] = hasher.finalize().into();

        Ok(Self { token, key, iv })
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DeviceError::InvalidResponse("payload decryption failed".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    length: u16,
    device_id: u32,
    stamp: u32,
    checksum: [u8; 16],
}

fn hello_packet() -> [u8; HEADER_LEN] {
    let mut packet = [0xffu8; HEADER_LEN];
    packet[..2].copy_from_slice(&MAGIC.to_be_bytes());
    packet[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    packet
}

fn parse_header(packet: &[u8]) -> Result<Header> {
    if packet.len() < HEADER_LEN {
        return Err(DeviceError::InvalidResponse(format!(
            "packet too short: {} bytes",
            packet.len()
        )));
    }

    let be_u32 = |at: usize| {
        u32::from_be_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]])
    };

    let magic = u16::from_be_bytes([packet[0], packet[1]]);
    if magic != MAGIC {
        return Err(DeviceError::InvalidResponse(format!(
            "bad magic 0x{:04x}",
            magic
        )));
    }

    let mut checksum = [0u8; 16];
    checksum.copy_from_slice(&packet[16..32]);

    Ok(Header {
        length: u16::from_be_bytes([packet[2], packet[3]]),
        device_id: be_u32(8),
        stamp: be_u32(12),
        checksum,
    })
}

fn encode_packet(cipher: &Cipher, device_id: u32, stamp: u32, payload: &[u8]) -> Vec<u8> {
    let encrypted = cipher.encrypt(payload);
    let length = (HEADER_LEN + encrypted.len()) as u16;

    let mut packet = Vec::with_capacity(length as usize);
    packet.extend_from_slice(&MAGIC.to_be_bytes());
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&device_id.to_be_bytes());
    packet.extend_from_slice(&stamp.to_be_bytes());
    packet.extend_from_slice(&cipher.token);
    packet.extend_from_slice(&encrypted);

    let checksum = Md5::digest(&packet);
    packet[16..32].copy_from_slice(&checksum);
    packet
}

fn decode_packet(cipher: &Cipher, packet: &[u8]) -> Result<serde_json::Value> {
    let header = parse_header(packet)?;
    let length = header.length as usize;
    if length <= HEADER_LEN || length > packet.len() {
        return Err(DeviceError::InvalidResponse(format!(
            "bad packet length {} ({} bytes received)",
            length,
            packet.len()
        )));
    }

    let mut check = packet[..length].to_vec();
    check[16..32].copy_from_slice(&cipher.token);
    if Md5::digest(&check)[..] != header.checksum[..] {
        return Err(DeviceError::InvalidResponse("checksum mismatch".to_string()));
    }

    let plaintext = cipher.decrypt(&packet[HEADER_LEN..length])?;
    let end = plaintext
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);

    Ok(serde_json::from_slice(&plaintext[..end])?)
}

/// Pull `result` out of a reply, or turn its `error` into a [`DeviceError`]
fn reply_result(mut reply: serde_json::Value) -> Result<serde_json::Value> {
    if let Some(error) = reply.get("error") {
        return Err(DeviceError::Device {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    reply
        .get_mut("result")
        .map(serde_json::Value::take)
        .ok_or_else(|| DeviceError::InvalidResponse("reply has no result".to_string()))
}

/// Session with one gateway
pub struct MiioClient {
    socket: UdpSocket,
    cipher: Cipher,
    device_id: u32,
    device_stamp: u32,
    handshake_at: Instant,
    needs_handshake: bool,
    next_id: u64,
}

impl MiioClient {
    /// Open a session to a gateway on the standard miIO port
    pub async fn connect(host: &str, token: &str) -> Result<Self> {
        Self::connect_to(host, PORT, token).await
    }

    async fn connect_to(host: &str, port: u16, token: &str) -> Result<Self> {
        let cipher = Cipher::new(token)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((host, port)).await?;

        let mut client = Self {
            socket,
            cipher,
            device_id: 0,
            device_stamp: 0,
            handshake_at: Instant::now(),
            needs_handshake: true,
            next_id: 0,
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        self.socket.send(&hello_packet()).await?;

        let mut buf = [0u8; MAX_PACKET];
        let len = tokio::time::timeout(TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| DeviceError::Timeout)??;
        let header = parse_header(&buf[..len])?;

        debug!(
            "miIO handshake: device_id={:08x}, stamp={}",
            header.device_id, header.stamp
        );
        self.device_id = header.device_id;
        self.device_stamp = header.stamp;
        self.handshake_at = Instant::now();
        self.needs_handshake = false;
        Ok(())
    }

    fn stamp(&self) -> u32 {
        self.device_stamp
            .wrapping_add(self.handshake_at.elapsed().as_secs() as u32)
    }

    async fn recv_reply(&self, id: u64) -> Result<serde_json::Value> {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            let reply = match decode_packet(&self.cipher, &buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("Skipping undecodable miIO packet: {}", e);
                    continue;
                }
            };
            if reply.get("id").and_then(|v| v.as_u64()) == Some(id) {
                return Ok(reply);
            }
            debug!("Skipping stale miIO reply: {}", reply);
        }
    }
}

#[async_trait]
impl DeviceClient for MiioClient {
    async fn send(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        if self.needs_handshake {
            self.handshake().await?;
        }

        self.next_id += 1;
        let id = self.next_id;
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": id,
            "method": method,
            "params": params,
        }))?;

        let packet = encode_packet(&self.cipher, self.device_id, self.stamp(), &payload);
        self.socket.send(&packet).await?;

        let outcome = tokio::time::timeout(TIMEOUT, self.recv_reply(id)).await;
        match outcome {
            Ok(reply) => reply_result(reply?),
            Err(_) => {
                // The device may have rebooted and reset its stamp.
                self.needs_handshake = true;
                Err(DeviceError::Timeout)
            }
        }
    }
}

/// Connector for real gateways
#[derive(Debug, Default)]
pub struct MiioConnector;

#[async_trait]
impl Connector for MiioConnector {
    async fn connect(&self, host: &str, token: &str) -> Result<Box<dyn DeviceClient>> {
        Ok(Box::new(MiioClient::connect(host, token).await?))
    }
}
