//! Wire format shared by server and client.
//!
//! ```text
//! [len: u32 LE][frame]
//! frame  = header + body                  (plain)
//!        | seal(header + body) + tag(16)  (encrypted)
//! header = [service_id: u8][message_type: u8][message_id: u16 LE]
//! ```
//!
//! Responses set [`RESPONSE_FLAG`] on `service_id` and echo type and id.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, Result};

pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 4;
pub const RESPONSE_FLAG: u8 = 0x80;
/// Number of addressable services; ids above this collide with the response flag.
pub const MAX_SERVICES: usize = RESPONSE_FLAG as usize;
/// Upper bound on one frame, so a corrupt length cannot exhaust memory.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

macro_rules! message_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),*
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)*
                }
            }

            /// Name of a raw message type, for logging.
            pub fn name_of(value: u8) -> &'static str {
                Self::from_u8(value).map(Self::name).unwrap_or("Unknown")
            }
        }
    };
}

message_enum!(
    /// Service selector carried in every header.
    ServiceId {
        System = 0,
        Storage = 1,
        Session = 2,
        Cache = 3,
    }
);

message_enum!(
    /// Messages handled by the server itself before user dispatch.
    SystemMessage {
        Connect = 1,
        SetConnectionCount = 2,
        KeepAlive = 3,
    }
);

message_enum!(
    StorageMessage {
        Connect = 0,
        FetchBegin = 1,
        FetchSegment = 2,
        FetchEnd = 3,
        ExistsOnServer = 4,
        StoreBegin = 5,
        StoreSegment = 6,
        StoreEnd = 7,
    }
);

message_enum!(
    SessionMessage {
        Connect = 0,
        EnsureBinaryFile = 1,
        GetApplication = 2,
        GetFileFromServer = 3,
        SendFileToServer = 4,
        DeleteFile = 5,
        CopyFile = 6,
        CreateDirectory = 7,
        RemoveDirectory = 8,
        ListDirectory = 9,
        ProcessAvailable = 10,
        ProcessInputs = 11,
        ProcessFinished = 12,
        ProcessReturned = 13,
        Ping = 14,
        Notification = 15,
        UpdateEnvironment = 16,
        Summary = 17,
        Command = 18,
        HostRun = 19,
        GetNextProcess = 20,
        Custom = 21,
    }
);

message_enum!(
    CacheMessage {
        Connect = 0,
        StorePathTable = 1,
        StoreCasTable = 2,
        StoreEntry = 3,
        StoreEntryDone = 4,
        FetchPathTable = 5,
        FetchCasTable = 6,
        FetchEntries = 7,
        ExecuteCommand = 8,
        RequestShutdown = 9,
        ReportUsedEntry = 10,
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub service_id: u8,
    pub message_type: u8,
    pub message_id: u16,
    pub is_response: bool,
}

impl MessageHeader {
    pub fn request(service_id: u8, message_type: u8, message_id: u16) -> Self {
        Self {
            service_id,
            message_type,
            message_id,
            is_response: false,
        }
    }

    /// Header answering `self`.
    pub fn response(&self) -> Self {
        Self {
            is_response: true,
            ..*self
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let service = if self.is_response {
            self.service_id | RESPONSE_FLAG
        } else {
            self.service_id
        };
        let id = self.message_id.to_le_bytes();
        [service, self.message_type, id[0], id[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(NetworkError::Truncated);
        }
        Ok(Self {
            service_id: bytes[0] & !RESPONSE_FLAG,
            message_type: bytes[1],
            message_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            is_response: bytes[0] & RESPONSE_FLAG != 0,
        })
    }

    /// Header followed by `body`, ready for [`write_frame`].
    pub fn frame(&self, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&self.to_bytes());
        frame.extend_from_slice(body);
        frame
    }
}

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_size {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(frame.len() as u32).to_le_bytes()).await?;
    writer.write_all(frame).await?;
    Ok(())
}

/// Cursor over a message body. All integers are little endian.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn left(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.left() < len {
            return Err(NetworkError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// `[len: u16][utf8]`
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| NetworkError::Protocol("invalid utf8 string".into()))
    }

    /// Everything not consumed yet.
    pub fn remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Growable message body builder.
#[derive(Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Strings longer than `u16::MAX` bytes are truncated at a char boundary.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u16(end as u16).write_bytes(&value.as_bytes()[..end])
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_response_flag() {
        let request = MessageHeader::request(ServiceId::Storage as u8, StorageMessage::StoreBegin as u8, 513);
        let bytes = request.to_bytes();
        assert_eq!(bytes, [1, 5, 0x01, 0x02]);

        let response = MessageHeader::from_bytes(&request.response().to_bytes()).unwrap();
        assert!(response.is_response);
        assert_eq!(response.service_id, 1);
        assert_eq!(response.message_id, 513);
        assert_eq!(response.to_bytes()[0], 0x81);
    }

    #[test]
    fn test_reader_writer_fields() {
        let mut writer = BinaryWriter::new();
        writer
            .write_u8(7)
            .write_u16(300)
            .write_u32(70_000)
            .write_u64(u64::MAX)
            .write_string("client-a")
            .write_bytes(b"tail");

        let mut reader = BinaryReader::new(writer.as_slice());
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 300);
        assert_eq!(reader.read_u32().unwrap(), 70_000);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_string().unwrap(), "client-a");
        assert_eq!(reader.remaining(), b"tail");
        assert_eq!(reader.left(), 0);
        assert!(matches!(reader.read_u8(), Err(NetworkError::Truncated)));
    }

    #[test]
    fn test_message_names() {
        assert_eq!(StorageMessage::name_of(7), "StoreEnd");
        assert_eq!(SystemMessage::name_of(3), "KeepAlive");
        assert_eq!(CacheMessage::name_of(10), "ReportUsedEntry");
        assert_eq!(SessionMessage::name_of(200), "Unknown");
        assert_eq!(ServiceId::from_u8(3), Some(ServiceId::Cache));
    }

    #[tokio::test]
    async fn test_frame_io() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"frame one").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), b"frame one");
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[0u8; 100]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 10).await,
            Err(NetworkError::FrameTooLarge(100))
        ));
    }
}
