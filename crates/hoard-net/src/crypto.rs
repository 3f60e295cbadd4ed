//! Encrypted framing and key handshake.
//!
//! After TCP connect the client sends an 8-byte random salt in clear, then
//! [`KNOWN_STRING`] sealed with its first nonce. The server tries every
//! registered key until one opens it and answers with the known string sealed
//! in its own direction. Both sides then seal every frame with AES-128-GCM.
//!
//! Nonce layout: `[direction: 1][salt: 3][counter: u64 LE]`. Each direction
//! keeps its own counter, so nonces never repeat under one key and salt.

use std::fmt;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::protocol::{read_frame, write_frame};
use crate::{NetworkError, Result};

pub const KEY_SIZE: usize = 16;
pub const SALT_SIZE: usize = 8;
pub const TAG_SIZE: usize = 16;
pub const KNOWN_STRING_SIZE: usize = 128;

/// Plaintext both sides must agree on to prove they hold the same key.
pub const KNOWN_STRING: [u8; KNOWN_STRING_SIZE] = known_string();

const fn known_string() -> [u8; KNOWN_STRING_SIZE] {
    let mut out = [0u8; KNOWN_STRING_SIZE];
    let mut i = 0;
    while i < KNOWN_STRING_SIZE {
        out[i] = (i as u8).wrapping_mul(37).wrapping_add(0x5b);
        i += 1;
    }
    out
}

/// Symmetric key shared by client and server.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CryptoKey([u8; KEY_SIZE]);

impl CryptoKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(Self)
    }

    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| NetworkError::Crypto("random source unavailable"))?;
        Ok(Self(bytes))
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound =
            UnboundKey::new(&AES_128_GCM, &self.0).map_err(|_| NetworkError::Crypto("invalid key"))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

/// One direction of an encrypted connection.
pub struct FrameCipher {
    key: LessSafeKey,
    direction: Direction,
    salt: [u8; 3],
    counter: u64,
}

impl FrameCipher {
    fn new(key: &CryptoKey, direction: Direction, salt: &[u8; SALT_SIZE]) -> Result<Self> {
        Ok(Self {
            key: key.aead_key()?,
            direction,
            salt: [salt[0], salt[1], salt[2]],
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[0] = self.direction as u8;
        nonce[1..4].copy_from_slice(&self.salt);
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypt `frame` in place, appending the tag.
    pub fn seal(&mut self, frame: &mut Vec<u8>) -> Result<()> {
        let nonce = self.next_nonce();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), frame)
            .map_err(|_| NetworkError::Crypto("seal failed"))
    }

    /// Decrypt `frame` in place and strip the tag.
    pub fn open(&mut self, frame: &mut Vec<u8>) -> Result<()> {
        let nonce = self.next_nonce();
        let len = self
            .key
            .open_in_place(nonce, Aad::empty(), frame)
            .map_err(|_| NetworkError::Crypto("open failed"))?
            .len();
        frame.truncate(len);
        Ok(())
    }
}

/// Cipher pair of an established encrypted connection.
pub struct CryptoChannel {
    pub sealer: FrameCipher,
    pub opener: FrameCipher,
}

impl CryptoChannel {
    fn new(key: &CryptoKey, salt: &[u8; SALT_SIZE], role: Direction) -> Result<Self> {
        let (send, recv) = match role {
            Direction::ClientToServer => (Direction::ClientToServer, Direction::ServerToClient),
            Direction::ServerToClient => (Direction::ServerToClient, Direction::ClientToServer),
        };
        Ok(Self {
            sealer: FrameCipher::new(key, send, salt)?,
            opener: FrameCipher::new(key, recv, salt)?,
        })
    }
}

/// Client half of the handshake.
pub async fn client_handshake<R, W>(reader: &mut R, writer: &mut W, key: &CryptoKey) -> Result<CryptoChannel>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; SALT_SIZE];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| NetworkError::Crypto("random source unavailable"))?;
    writer.write_all(&salt).await?;

    let mut channel = CryptoChannel::new(key, &salt, Direction::ClientToServer)?;
    let mut challenge = KNOWN_STRING.to_vec();
    channel.sealer.seal(&mut challenge)?;
    write_frame(writer, &challenge).await?;

    let mut answer = read_frame(reader, KNOWN_STRING_SIZE + TAG_SIZE)
        .await?
        .ok_or(NetworkError::Disconnected)?;
    channel
        .opener
        .open(&mut answer)
        .map_err(|_| NetworkError::Crypto("server answered with a different key"))?;
    if answer[..] != KNOWN_STRING[..] {
        return Err(NetworkError::Crypto("handshake mismatch"));
    }
    Ok(channel)
}

/// Server half of the handshake: any of `keys` may match.
pub async fn server_handshake<R, W>(reader: &mut R, writer: &mut W, keys: &[CryptoKey]) -> Result<CryptoChannel>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; SALT_SIZE];
    tokio::io::AsyncReadExt::read_exact(reader, &mut salt).await?;
    let challenge = read_frame(reader, KNOWN_STRING_SIZE + TAG_SIZE)
        .await?
        .ok_or(NetworkError::Disconnected)?;

    for key in keys {
        let mut channel = CryptoChannel::new(key, &salt, Direction::ServerToClient)?;
        let mut attempt = challenge.clone();
        if channel.opener.open(&mut attempt).is_err() || attempt[..] != KNOWN_STRING[..] {
            continue;
        }

        let mut answer = KNOWN_STRING.to_vec();
        channel.sealer.seal(&mut answer)?;
        write_frame(writer, &answer).await?;
        return Ok(channel);
    }
    Err(NetworkError::Crypto("no registered key matches"))
}
