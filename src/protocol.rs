//! Secure DFU control point frames.
//!
//! Opcodes and result codes as defined in
//! nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Marker byte every control point response starts with
pub const RESPONSE_MARKER: u8 = 0x60;

/// Status byte of a successful response
pub const STATUS_SUCCESS: u8 = 0x01;

/// Length of the `[marker, opcode, status]` response header
pub const RESPONSE_HEADER_LEN: usize = 3;

/// DFU Object variants
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    Command = 0x01,
    Data = 0x02,
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectType::Command => write!(f, "command"),
            ObjectType::Data => write!(f, "data"),
        }
    }
}

/// DFU Command opcodes used by this engine
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    CreateObject = 0x01,
    SetPrn = 0x02,
    CalculateCrc = 0x03,
    Execute = 0x04,
    SelectObject = 0x06,
}

/// DFU Response codes
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ResponseError {
    #[error("invalid opcode")]
    Invalid = 0x00,
    #[error("success (not an error)")]
    Success = 0x01,
    #[error("opcode not supported")]
    OpCodeNotSupported = 0x02,
    #[error("invalid parameter")]
    InvalidParameter = 0x03,
    #[error("not enough memory for the data object")]
    InsufficientResources = 0x04,
    #[error("invalid data object")]
    InvalidObject = 0x05,
    #[error("invalid object type")]
    UnsupportedType = 0x07,
    #[error("operation not permitted")]
    OperationNotPermitted = 0x08,
    #[error("operation failed")]
    OperationFailed = 0x0A,
    #[error("extended error")]
    ExtError = 0x0B,
    #[error("unknown result code {0:#04x}")]
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// DFU Extended Error codes
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ExtendedError {
    #[error("no extended error (bad implementation)")]
    NoError = 0x00,
    #[error("invalid error code")]
    InvalidErrorCode = 0x01,
    #[error("wrong command format")]
    WrongCommandFormat = 0x02,
    #[error("unknown command")]
    UnknownCommand = 0x03,
    #[error("invalid init command")]
    InitCommandInvalid = 0x04,
    #[error("firmware version is too low")]
    FwVersionFailure = 0x05,
    #[error("hardware version mismatch")]
    HwVersionFailure = 0x06,
    #[error("required softdevice version mismatch")]
    SdVersionFailure = 0x07,
    #[error("missing signature")]
    SignatureMissing = 0x08,
    #[error("wrong hash type")]
    WrongHashType = 0x09,
    #[error("hash calculation failed")]
    HashFailed = 0x0A,
    #[error("wrong signature type")]
    WrongSignatureType = 0x0B,
    #[error("hash verification failed")]
    VerificationFailed = 0x0C,
    #[error("insufficient space")]
    InsufficientSpace = 0x0D,
    #[error("unknown extended error {0:#04x}")]
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Non-success status reported by the target
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusError {
    #[error(transparent)]
    Response(ResponseError),
    #[error(transparent)]
    Extended(ExtendedError),
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MalformedFrame {
    #[error("response too short ({len} bytes, need {needed})")]
    TooShort { len: usize, needed: usize },
    #[error("missing response marker ({0:#04x})")]
    BadMarker(u8),
}

/// Result of selecting an object type
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ObjectInfo {
    pub max_size: u32,
    pub offset: u32,
    pub crc32: u32,
}

/// Checksum reported by the target for the bytes accepted so far
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ObjectChecksum {
    pub offset: u32,
    pub crc32: u32,
}

pub fn encode_set_prn(prn: u16) -> Vec<u8> {
    let mut frame = vec![u8::from(OpCode::SetPrn)];
    frame.extend_from_slice(&prn.to_le_bytes());
    frame
}

pub fn encode_create_object(obj_type: ObjectType, size: u32) -> Vec<u8> {
    let mut frame = vec![u8::from(OpCode::CreateObject), u8::from(obj_type)];
    frame.extend_from_slice(&size.to_le_bytes());
    frame
}

pub fn encode_select_object(obj_type: ObjectType) -> Vec<u8> {
    vec![u8::from(OpCode::SelectObject), u8::from(obj_type)]
}

pub fn encode_calculate_crc() -> Vec<u8> {
    vec![u8::from(OpCode::CalculateCrc)]
}

pub fn encode_execute() -> Vec<u8> {
    vec![u8::from(OpCode::Execute)]
}

/// Borrowed view of a well-formed response frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResponseView<'a> {
    bytes: &'a [u8],
}

impl<'a> ResponseView<'a> {
    /// Opcode of the request this response answers
    pub fn request_opcode(&self) -> u8 {
        self.bytes[1]
    }

    pub fn status(&self) -> u8 {
        self.bytes[2]
    }

    pub fn is_success(&self) -> bool {
        self.status() == STATUS_SUCCESS
    }

    fn le_u32(&self, offset: usize) -> Result<u32, MalformedFrame> {
        let field = self.bytes.get(offset..offset + 4).ok_or(MalformedFrame::TooShort {
            len: self.bytes.len(),
            needed: offset + 4,
        })?;
        Ok(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
    }
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseView<'_>, MalformedFrame> {
    if bytes.len() < RESPONSE_HEADER_LEN {
        return Err(MalformedFrame::TooShort {
            len: bytes.len(),
            needed: RESPONSE_HEADER_LEN,
        });
    }
    if bytes[0] != RESPONSE_MARKER {
        return Err(MalformedFrame::BadMarker(bytes[0]));
    }
    Ok(ResponseView { bytes })
}

pub fn decode_object_info(response: &ResponseView<'_>) -> Result<ObjectInfo, MalformedFrame> {
    Ok(ObjectInfo {
        max_size: response.le_u32(3)?,
        offset: response.le_u32(7)?,
        crc32: response.le_u32(11)?,
    })
}

pub fn decode_checksum(response: &ResponseView<'_>) -> Result<ObjectChecksum, MalformedFrame> {
    Ok(ObjectChecksum {
        offset: response.le_u32(3)?,
        crc32: response.le_u32(7)?,
    })
}

/// Decode the status of a response into its error taxonomy.
///
/// The extended code is only read when the status is the extended error
/// sentinel, and must then be present at byte 3.
pub fn decode_error(response: &ResponseView<'_>) -> Result<StatusError, MalformedFrame> {
    let result = ResponseError::from(response.status());
    if result == ResponseError::ExtError {
        let ext = *response.bytes.get(3).ok_or(MalformedFrame::TooShort {
            len: response.bytes.len(),
            needed: 4,
        })?;
        return Ok(StatusError::Extended(ExtendedError::from(ext)));
    }
    Ok(StatusError::Response(result))
}
