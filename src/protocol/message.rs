use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::ProtocolError;
use super::text;

/// Type codes known to the device firmware.
///
/// Only a subset has a [`Body`] variant; the rest are listed so that traffic
/// can be named in logs and decoders can be registered for them later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    StreamChunk = 0x14,
    Text = 0x20,
    StorageAddressRequest = 0x30,
    StorageAddress,
    StorageRequest,
    StorageContent,
    SimpleFileWrite = 0x36,
    SimpleFileWriteResponse,
    SimpleFileWriteNoAck,
    FileOpen = 0x40,
    FileOpenResponse,
    FileClose,
    FileCloseResponse,
    FileWrite,
    FileWriteResponse,
    FileWriteNoAck,
    FileWriteNoAckResponse,
    FileRead,
    FileContent,
    FileList,
    FileListItem,
    FileDelete,
    FileDeleteResponse,
    FolderCreate,
    FolderCreateResponse,
    Reboot,
    RxSize = 0x52,
    RxCount = 0x54,
    FormatFileSystem = 0x56,
    FormatFileSystemResponse,
    DiscSpace,
    DiscSpaceResponse,
    SetupEncryption = 0x60,
    SetupEncryptionResponse,
}

impl TypeCode {
    const ALL: [TypeCode; 34] = [
        TypeCode::StreamChunk,
        TypeCode::Text,
        TypeCode::StorageAddressRequest,
        TypeCode::StorageAddress,
        TypeCode::StorageRequest,
        TypeCode::StorageContent,
        TypeCode::SimpleFileWrite,
        TypeCode::SimpleFileWriteResponse,
        TypeCode::SimpleFileWriteNoAck,
        TypeCode::FileOpen,
        TypeCode::FileOpenResponse,
        TypeCode::FileClose,
        TypeCode::FileCloseResponse,
        TypeCode::FileWrite,
        TypeCode::FileWriteResponse,
        TypeCode::FileWriteNoAck,
        TypeCode::FileWriteNoAckResponse,
        TypeCode::FileRead,
        TypeCode::FileContent,
        TypeCode::FileList,
        TypeCode::FileListItem,
        TypeCode::FileDelete,
        TypeCode::FileDeleteResponse,
        TypeCode::FolderCreate,
        TypeCode::FolderCreateResponse,
        TypeCode::Reboot,
        TypeCode::RxSize,
        TypeCode::RxCount,
        TypeCode::FormatFileSystem,
        TypeCode::FormatFileSystemResponse,
        TypeCode::DiscSpace,
        TypeCode::DiscSpaceResponse,
        TypeCode::SetupEncryption,
        TypeCode::SetupEncryptionResponse,
    ];

    /// Looks up a type code by its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| *code as u8 == value)
    }

    /// Wire value of this type code
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Open mode flags for `FileOpen`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileMode(pub u8);

impl FileMode {
    pub const READ: FileMode = FileMode(1 << 0);
    pub const WRITE: FileMode = FileMode(1 << 1);
    pub const CREATE_NEW: FileMode = FileMode(1 << 2);
    pub const CREATE_ALWAYS: FileMode = FileMode(1 << 3);
    pub const OPEN_ALWAYS: FileMode = FileMode(1 << 4);
    pub const CHECK_MD5: FileMode = FileMode(1 << 5);

    /// Returns true if every flag in `other` is set
    pub fn contains(self, other: FileMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw flag byte
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for FileMode {
    type Output = FileMode;

    fn bitor(self, rhs: FileMode) -> FileMode {
        FileMode(self.0 | rhs.0)
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const FLAGS: [(FileMode, &str); 6] = [
            (FileMode::READ, "r"),
            (FileMode::WRITE, "w"),
            (FileMode::CREATE_NEW, "cn"),
            (FileMode::CREATE_ALWAYS, "ca"),
            (FileMode::OPEN_ALWAYS, "oa"),
            (FileMode::CHECK_MD5, "md5"),
        ];
        let set: Vec<&str> = FLAGS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(","))
    }
}

/// Result code reported by the device file system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Ok,
    DiskErr,
    IntErr,
    NotReady,
    NoFile,
    NoPath,
    InvalidName,
    Denied,
    Exist,
    InvalidObject,
    WriteProtected,
    InvalidDrive,
    NotEnabled,
    NoFileSystem,
    MkfsAborted,
    TimeOut,
    Locked,
    NotEnoughCore,
    TooManyOpenFiles,
    InvalidPosition,
    Unknown(u8),
}

impl FileStatus {
    /// Decodes a status byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FileStatus::Ok,
            1 => FileStatus::DiskErr,
            2 => FileStatus::IntErr,
            3 => FileStatus::NotReady,
            4 => FileStatus::NoFile,
            5 => FileStatus::NoPath,
            6 => FileStatus::InvalidName,
            7 => FileStatus::Denied,
            8 => FileStatus::Exist,
            9 => FileStatus::InvalidObject,
            10 => FileStatus::WriteProtected,
            11 => FileStatus::InvalidDrive,
            12 => FileStatus::NotEnabled,
            13 => FileStatus::NoFileSystem,
            14 => FileStatus::MkfsAborted,
            15 => FileStatus::TimeOut,
            16 => FileStatus::Locked,
            17 => FileStatus::NotEnoughCore,
            18 => FileStatus::TooManyOpenFiles,
            128 => FileStatus::InvalidPosition,
            other => FileStatus::Unknown(other),
        }
    }

    /// Encodes a status byte
    pub fn as_u8(self) -> u8 {
        match self {
            FileStatus::Ok => 0,
            FileStatus::DiskErr => 1,
            FileStatus::IntErr => 2,
            FileStatus::NotReady => 3,
            FileStatus::NoFile => 4,
            FileStatus::NoPath => 5,
            FileStatus::InvalidName => 6,
            FileStatus::Denied => 7,
            FileStatus::Exist => 8,
            FileStatus::InvalidObject => 9,
            FileStatus::WriteProtected => 10,
            FileStatus::InvalidDrive => 11,
            FileStatus::NotEnabled => 12,
            FileStatus::NoFileSystem => 13,
            FileStatus::MkfsAborted => 14,
            FileStatus::TimeOut => 15,
            FileStatus::Locked => 16,
            FileStatus::NotEnoughCore => 17,
            FileStatus::TooManyOpenFiles => 18,
            FileStatus::InvalidPosition => 128,
            FileStatus::Unknown(other) => other,
        }
    }

    pub fn is_ok(self) -> bool {
        self == FileStatus::Ok
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Payload of one telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Command or reply text
    Text(String),
    FileOpen {
        mode: FileMode,
        name: String,
    },
    FileOpenResponse {
        status: FileStatus,
        handle: u8,
        /// File size in bytes, meaningful for read opens
        size: u32,
    },
    FileClose {
        handle: u8,
    },
    FileCloseResponse {
        status: FileStatus,
    },
    FileWrite {
        handle: u8,
        offset: u32,
        data: Bytes,
    },
    FileWriteResponse {
        status: FileStatus,
        handle: u8,
        offset: u32,
    },
    FileWriteNoAck {
        handle: u8,
        offset: u32,
        data: Bytes,
    },
    FileWriteNoAckResponse {
        status: FileStatus,
        handle: u8,
        offset: u32,
    },
    /// Asks the device to stream `length` bytes starting at `offset`
    FileRead {
        handle: u8,
        offset: u32,
        length: u32,
    },
    /// One streamed slice of file content
    FileContent {
        handle: u8,
        position: u32,
        data: Bytes,
    },
    /// Telegram of a type decoded by an extension decoder
    Opaque {
        type_code: u8,
        payload: Bytes,
    },
}

/// Discriminant of a [`Body`], used to match replies against requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelegramKind {
    Text,
    FileOpen,
    FileOpenResponse,
    FileClose,
    FileCloseResponse,
    FileWrite,
    FileWriteResponse,
    FileWriteNoAck,
    FileWriteNoAckResponse,
    FileRead,
    FileContent,
    Opaque(u8),
}

impl Body {
    /// Discriminant of this body
    pub fn kind(&self) -> TelegramKind {
        match self {
            Body::Text(_) => TelegramKind::Text,
            Body::FileOpen { .. } => TelegramKind::FileOpen,
            Body::FileOpenResponse { .. } => TelegramKind::FileOpenResponse,
            Body::FileClose { .. } => TelegramKind::FileClose,
            Body::FileCloseResponse { .. } => TelegramKind::FileCloseResponse,
            Body::FileWrite { .. } => TelegramKind::FileWrite,
            Body::FileWriteResponse { .. } => TelegramKind::FileWriteResponse,
            Body::FileWriteNoAck { .. } => TelegramKind::FileWriteNoAck,
            Body::FileWriteNoAckResponse { .. } => TelegramKind::FileWriteNoAckResponse,
            Body::FileRead { .. } => TelegramKind::FileRead,
            Body::FileContent { .. } => TelegramKind::FileContent,
            Body::Opaque { type_code, .. } => TelegramKind::Opaque(*type_code),
        }
    }

    /// Wire type code of this body
    pub fn type_code(&self) -> u8 {
        let code = match self {
            Body::Text(_) => TypeCode::Text,
            Body::FileOpen { .. } => TypeCode::FileOpen,
            Body::FileOpenResponse { .. } => TypeCode::FileOpenResponse,
            Body::FileClose { .. } => TypeCode::FileClose,
            Body::FileCloseResponse { .. } => TypeCode::FileCloseResponse,
            Body::FileWrite { .. } => TypeCode::FileWrite,
            Body::FileWriteResponse { .. } => TypeCode::FileWriteResponse,
            Body::FileWriteNoAck { .. } => TypeCode::FileWriteNoAck,
            Body::FileWriteNoAckResponse { .. } => TypeCode::FileWriteNoAckResponse,
            Body::FileRead { .. } => TypeCode::FileRead,
            Body::FileContent { .. } => TypeCode::FileContent,
            Body::Opaque { type_code, .. } => return *type_code,
        };
        code.as_u8()
    }

    /// Serializes the payload bytes of this body
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Body::Text(message) => buf.put_slice(&text::encode_cp1251(message)),
            Body::FileOpen { mode, name } => {
                buf.put_u8(mode.bits());
                buf.put_slice(&text::encode_cp1251(name));
            }
            Body::FileOpenResponse { status, handle, size } => {
                buf.put_u8(status.as_u8());
                buf.put_u8(*handle);
                buf.put_u32_le(*size);
            }
            Body::FileClose { handle } => buf.put_u8(*handle),
            Body::FileCloseResponse { status } => buf.put_u8(status.as_u8()),
            Body::FileWrite { handle, offset, data }
            | Body::FileWriteNoAck { handle, offset, data }
            | Body::FileContent { handle, position: offset, data } => {
                buf.put_u8(*handle);
                buf.put_u32_le(*offset);
                buf.put_slice(data);
            }
            Body::FileWriteResponse { status, handle, offset }
            | Body::FileWriteNoAckResponse { status, handle, offset } => {
                buf.put_u8(status.as_u8());
                buf.put_u8(*handle);
                buf.put_u32_le(*offset);
            }
            Body::FileRead { handle, offset, length } => {
                buf.put_u8(*handle);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*length);
            }
            Body::Opaque { payload, .. } => buf.put_slice(payload),
        }
        buf.freeze()
    }
}

/// Signature of a payload decoder held in the decoder registry
pub type DecodeFn = fn(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError>;

fn require(type_code: u8, payload: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if payload.len() < needed {
        return Err(ProtocolError::MalformedPayload {
            type_code,
            reason: format!("need at least {} bytes, got {}", needed, payload.len()),
        });
    }
    Ok(())
}

pub(crate) fn decode_text(_type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    Ok(Body::Text(text::decode_cp1251(payload)))
}

pub(crate) fn decode_file_open(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    require(type_code, payload, 1)?;
    Ok(Body::FileOpen {
        mode: FileMode(payload[0]),
        name: text::decode_cp1251(&payload[1..]),
    })
}

pub(crate) fn decode_file_open_response(type_code: u8, mut payload: &[u8]) -> Result<Body, ProtocolError> {
    require(type_code, payload, 6)?;
    Ok(Body::FileOpenResponse {
        status: FileStatus::from_u8(payload.get_u8()),
        handle: payload.get_u8(),
        size: payload.get_u32_le(),
    })
}

pub(crate) fn decode_file_close(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    require(type_code, payload, 1)?;
    Ok(Body::FileClose { handle: payload[0] })
}

pub(crate) fn decode_file_close_response(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    require(type_code, payload, 1)?;
    Ok(Body::FileCloseResponse {
        status: FileStatus::from_u8(payload[0]),
    })
}

fn split_chunk(type_code: u8, mut payload: &[u8]) -> Result<(u8, u32, Bytes), ProtocolError> {
    require(type_code, payload, 5)?;
    let handle = payload.get_u8();
    let offset = payload.get_u32_le();
    Ok((handle, offset, Bytes::copy_from_slice(payload)))
}

pub(crate) fn decode_file_write(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    let (handle, offset, data) = split_chunk(type_code, payload)?;
    Ok(if type_code == TypeCode::FileWriteNoAck.as_u8() {
        Body::FileWriteNoAck { handle, offset, data }
    } else {
        Body::FileWrite { handle, offset, data }
    })
}

pub(crate) fn decode_file_content(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    let (handle, position, data) = split_chunk(type_code, payload)?;
    Ok(Body::FileContent { handle, position, data })
}

pub(crate) fn decode_file_write_response(type_code: u8, mut payload: &[u8]) -> Result<Body, ProtocolError> {
    require(type_code, payload, 6)?;
    let status = FileStatus::from_u8(payload.get_u8());
    let handle = payload.get_u8();
    let offset = payload.get_u32_le();
    Ok(if type_code == TypeCode::FileWriteNoAckResponse.as_u8() {
        Body::FileWriteNoAckResponse { status, handle, offset }
    } else {
        Body::FileWriteResponse { status, handle, offset }
    })
}

pub(crate) fn decode_file_read(type_code: u8, mut payload: &[u8]) -> Result<Body, ProtocolError> {
    require(type_code, payload, 9)?;
    Ok(Body::FileRead {
        handle: payload.get_u8(),
        offset: payload.get_u32_le(),
        length: payload.get_u32_le(),
    })
}

/// Keeps the payload as-is; useful for registering type codes without a typed body
pub fn decode_opaque(type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
    Ok(Body::Opaque {
        type_code,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// One framed protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Destination pseudo-address
    pub dst: u8,
    /// Source pseudo-address
    pub src: u8,
    pub body: Body,
}

impl Telegram {
    /// Creates a telegram with both pseudo-addresses zeroed
    pub fn new(body: Body) -> Self {
        Telegram { dst: 0, src: 0, body }
    }

    /// Creates a text telegram
    pub fn text(message: impl Into<String>) -> Self {
        Self::new(Body::Text(message.into()))
    }

    /// Sets the pseudo-addresses
    pub fn with_addresses(mut self, dst: u8, src: u8) -> Self {
        self.dst = dst;
        self.src = src;
        self
    }

    pub fn kind(&self) -> TelegramKind {
        self.body.kind()
    }

    pub fn type_code(&self) -> u8 {
        self.body.type_code()
    }

    /// Text of a text telegram
    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            Body::Text(message) => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Body::Text(message) => write!(f, "(dst={}, src={}, {:?})", self.dst, self.src, message),
            Body::FileOpen { mode, name } => {
                write!(f, "(dst={}, src={}, open {:?} {})", self.dst, self.src, name, mode)
            }
            other => write!(f, "(dst={}, src={}, {:?})", self.dst, self.src, other.kind()),
        }
    }
}
