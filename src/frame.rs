use crate::error::Error;

/// Control frames carry at most 125 bytes of payload, since their length has
/// to fit in the 7-bit short form of the length encoding.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// A single RFC 6455 frame, after unmasking.
///
/// The `compressed` flag mirrors the RSV1 bit on the wire: it may only be set
/// on the first frame of a data message, and only when permessage-deflate has
/// been negotiated during the handshake. Masking is not represented here, it
/// is decided by the connection role when the frame is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }

    /// Close frame carrying a status code and no reason text.
    pub fn close_with_code(code: u16) -> Self {
        Self::new(true, OpCode::Close, code.to_be_bytes().to_vec(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode() {
        let byte = 0x0;
        let res = OpCode::from(byte).unwrap();
        assert_eq!(res, OpCode::Continue);

        let opcode = OpCode::Text;
        let op_byte = opcode.as_u8();
        assert_eq!(op_byte, 0x1);

        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Binary.is_data());
        assert!(!OpCode::Continue.is_data());
    }

    #[test]
    fn test_unknown_opcodes_reject() {
        for byte in [0x3, 0x7, 0xB, 0xF] {
            assert!(OpCode::from(byte).is_err());
        }
    }

    #[test]
    fn test_frame() {
        let frame = Frame::new(false, OpCode::Text, Vec::new(), false);

        assert!(!frame.final_fragment);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.payload.is_empty());
        assert!(!frame.compressed);
    }

    #[test]
    fn test_close_with_code() {
        let frame = Frame::close_with_code(1002);
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.payload, vec![0x03, 0xEA]);
    }
}
