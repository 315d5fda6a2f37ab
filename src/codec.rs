use crate::error::Error;
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD};
use bytes::{BufMut, BytesMut};

/// Which end of the connection this codec is running on. The role decides the
/// masking policy in both directions: clients must mask every outgoing frame
/// and must receive unmasked frames, servers are the exact mirror of that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// Tries to decode a single frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer doesn't hold a complete frame yet, in
/// which case the buffer is left untouched so the caller can read more bytes
/// from the transport and retry. On success, exactly the bytes of the decoded
/// frame are consumed and the payload is returned unmasked.
pub(crate) fn decode_frame(
    buf: &mut BytesMut,
    role: Role,
    deflate_negotiated: bool,
    max_frame_size: usize,
) -> Result<Option<Frame>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }

    // The first bit in the first byte tells us whether the current frame is
    // the final fragment of a message, the last 4 bits carry the opcode.
    let final_fragment = (buf[0] & 0b10000000) != 0;
    let opcode = OpCode::from(buf[0] & 0b00001111)?;

    // RSV is short for "Reserved": optional flags that aren't used by the
    // base protocol, only by negotiated extensions. RSV2 and RSV3 have no
    // defined extension here, so they must always be zero. RSV1 marks a
    // deflate-compressed message and is only legal on the first frame of a
    // data message, and only after permessage-deflate has been negotiated.
    let rsv1 = (buf[0] & 0b01000000) != 0;
    let rsv2 = (buf[0] & 0b00100000) != 0;
    let rsv3 = (buf[0] & 0b00010000) != 0;

    if rsv2 || rsv3 {
        return Err(Error::RSVNotZero);
    }
    if rsv1 && (!deflate_negotiated || !opcode.is_data()) {
        return Err(Error::RSVNotZero);
    }

    // Control opcodes (ping, pong, close) can't be fragmented.
    if !final_fragment && opcode.is_control() {
        return Err(Error::ControlFramesFragmented);
    }

    // First bit of the second byte is the mask bit, the remaining 7 bits are
    // the payload length or the marker for one of the extended encodings.
    let masked = (buf[1] & 0b10000000) != 0;
    match role {
        Role::Server if !masked => return Err(Error::UnmaskedFrame),
        Role::Client if masked => return Err(Error::MaskedFrame),
        _ => {}
    }

    let len7 = (buf[1] & 0b01111111) as usize;

    // Control frames are only allowed a payload up to and including 125
    // octets, which also rules out both extended length encodings.
    if opcode.is_control() && len7 > MAX_CONTROL_PAYLOAD {
        return Err(Error::ControlFramePayloadSize);
    }

    // Lengths 126 and 127 announce a 16-bit respectively 64-bit big-endian
    // extended length right after the second byte.
    let (payload_len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut be_bytes = [0u8; 8];
            be_bytes.copy_from_slice(&buf[2..10]);
            let length = u64::from_be_bytes(be_bytes);
            // The most significant bit of the 64-bit form must be zero.
            if length > i64::MAX as u64 {
                return Err(Error::MaxFrameSize);
            }
            (length as usize, 10)
        }
        n => (n, 2),
    };

    if payload_len > max_frame_size {
        return Err(Error::MaxFrameSize);
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(mask)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    // The whole frame is buffered: consume the header and take the payload.
    let _ = buf.split_to(offset);
    let mut payload = buf.split_to(payload_len).to_vec();

    // The mask is applied with a bytewise XOR, each payload byte against the
    // corresponding byte (modulo 4) of the 4-byte key, so applying it again
    // here recovers the original data.
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some(Frame {
        final_fragment,
        opcode,
        payload,
        compressed: rsv1,
    }))
}

/// Encodes one frame for the wire, choosing the shortest possible length
/// encoding. Client frames get masked with a fresh random 4-byte key.
pub(crate) fn encode_frame(frame: &Frame, role: Role) -> BytesMut {
    let mut buf = BytesMut::with_capacity(frame.payload.len() + 14);

    // First byte: FIN bit shifted into the top position, RSV1 if the message
    // is compressed, then the opcode in the low 4 bits.
    let mut first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();
    if frame.compressed {
        first_byte |= 0b01000000;
    }
    buf.put_u8(first_byte);

    let mask_bit = match role {
        Role::Client => 0b10000000,
        Role::Server => 0,
    };

    // Payloads up to 125 bytes encode the length directly, up to 65535 as a
    // 16-bit extension after the marker 126, anything larger as a 64-bit
    // extension after the marker 127.
    let payload_len = frame.payload.len();
    if payload_len <= 125 {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= 65535 {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    match role {
        Role::Client => {
            let mask: [u8; 4] = rand::random();
            buf.put_slice(&mask);

            let mut masked_payload = frame.payload.clone();
            apply_mask(&mut masked_payload, mask);
            buf.put_slice(&masked_payload);
        }
        Role::Server => buf.put_slice(&frame.payload),
    }

    buf
}

fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_LIMIT: usize = usize::MAX;

    fn roundtrip(frame: Frame, encode_role: Role, decode_role: Role) -> Frame {
        let mut buf = encode_frame(&frame, encode_role);
        let decoded = decode_frame(&mut buf, decode_role, true, NO_LIMIT)
            .unwrap()
            .expect("complete frame should decode");
        assert!(buf.is_empty(), "decode must consume the whole frame");
        decoded
    }

    #[test]
    fn test_roundtrip_server_to_client() {
        let frame = Frame::new(true, OpCode::Text, b"hello".to_vec(), false);
        assert_eq!(roundtrip(frame.clone(), Role::Server, Role::Client), frame);
    }

    #[test]
    fn test_roundtrip_client_to_server_unmasks() {
        let frame = Frame::new(true, OpCode::Binary, vec![1, 2, 3, 4, 5], false);
        assert_eq!(roundtrip(frame.clone(), Role::Client, Role::Server), frame);
    }

    #[test]
    fn test_roundtrip_compressed_flag() {
        let frame = Frame::new(false, OpCode::Text, b"abc".to_vec(), true);
        assert_eq!(roundtrip(frame.clone(), Role::Server, Role::Client), frame);
    }

    #[test]
    fn test_length_encoding_boundaries() {
        // (payload length, expected size of the length encoding in bytes)
        for (len, header_len) in [
            (125usize, 2usize),
            (126, 4),
            (127, 4),
            (65535, 4),
            (65536, 10),
        ] {
            let frame = Frame::new(true, OpCode::Binary, vec![0xAB; len], false);
            let encoded = encode_frame(&frame, Role::Server);
            assert_eq!(encoded.len(), header_len + len, "payload len {}", len);

            let mut buf = encoded;
            let decoded = decode_frame(&mut buf, Role::Client, false, NO_LIMIT)
                .unwrap()
                .unwrap();
            assert_eq!(decoded.payload.len(), len);
        }
    }

    #[test]
    fn test_incremental_decode_is_chunking_invariant() {
        let frames = vec![
            Frame::new(false, OpCode::Text, b"Hel".to_vec(), false),
            Frame::new(false, OpCode::Continue, b"lo ".to_vec(), false),
            Frame::new(true, OpCode::Continue, b"World".to_vec(), false),
            Frame::new(true, OpCode::Ping, b"hi".to_vec(), false),
            Frame::new(true, OpCode::Binary, vec![0x42; 300], false),
        ];
        let mut stream = BytesMut::new();
        for frame in &frames {
            stream.extend_from_slice(&encode_frame(frame, Role::Server));
        }

        // Feed the stream one byte at a time and collect every decoded frame;
        // the result must match decoding the stream in a single piece.
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = decode_frame(&mut buf, Role::Client, false, NO_LIMIT).unwrap()
            {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_partial_frame_leaves_buffer_untouched() {
        let frame = Frame::new(true, OpCode::Text, vec![7; 200], false);
        let encoded = encode_frame(&frame, Role::Server);

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        let before = buf.clone();
        assert!(decode_frame(&mut buf, Role::Client, false, NO_LIMIT)
            .unwrap()
            .is_none());
        assert_eq!(buf, before);
    }

    #[test]
    fn test_control_frame_payload_126_rejected() {
        // Hand-built header: FIN + ping opcode, unmasked, length 126.
        let mut buf = BytesMut::new();
        buf.put_u8(0b10000000 | 0x9);
        buf.put_u8(126);
        buf.put_u16(126);
        buf.put_slice(&vec![0; 126]);
        assert!(matches!(
            decode_frame(&mut buf, Role::Client, false, NO_LIMIT),
            Err(Error::ControlFramePayloadSize)
        ));
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x9); // FIN = 0, ping
        buf.put_u8(0);
        assert!(matches!(
            decode_frame(&mut buf, Role::Client, false, NO_LIMIT),
            Err(Error::ControlFramesFragmented)
        ));
    }

    #[test]
    fn test_masking_policy() {
        // An unmasked frame must be rejected by a server.
        let frame = Frame::new(true, OpCode::Text, b"x".to_vec(), false);
        let mut unmasked = encode_frame(&frame, Role::Server);
        assert!(matches!(
            decode_frame(&mut unmasked, Role::Server, false, NO_LIMIT),
            Err(Error::UnmaskedFrame)
        ));

        // A masked frame must be rejected by a client.
        let mut masked = encode_frame(&frame, Role::Client);
        assert!(matches!(
            decode_frame(&mut masked, Role::Client, false, NO_LIMIT),
            Err(Error::MaskedFrame)
        ));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        for first_byte in [0b10100001u8, 0b10010001] {
            let mut buf = BytesMut::new();
            buf.put_u8(first_byte);
            buf.put_u8(0);
            assert!(matches!(
                decode_frame(&mut buf, Role::Client, true, NO_LIMIT),
                Err(Error::RSVNotZero)
            ));
        }
    }

    #[test]
    fn test_rsv1_requires_deflate() {
        let frame = Frame::new(true, OpCode::Text, b"x".to_vec(), true);
        let mut buf = encode_frame(&frame, Role::Server);
        assert!(matches!(
            decode_frame(&mut buf, Role::Client, false, NO_LIMIT),
            Err(Error::RSVNotZero)
        ));
    }

    #[test]
    fn test_rsv1_on_control_frame_rejected() {
        let frame = Frame::new(true, OpCode::Ping, Vec::new(), true);
        let mut buf = encode_frame(&frame, Role::Server);
        assert!(matches!(
            decode_frame(&mut buf, Role::Client, true, NO_LIMIT),
            Err(Error::RSVNotZero)
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0b10000000 | 0x3);
        buf.put_u8(0);
        assert!(matches!(
            decode_frame(&mut buf, Role::Client, false, NO_LIMIT),
            Err(Error::InvalidOpcode)
        ));
    }

    #[test]
    fn test_max_frame_size_enforced() {
        let frame = Frame::new(true, OpCode::Binary, vec![0; 2048], false);
        let mut buf = encode_frame(&frame, Role::Server);
        assert!(matches!(
            decode_frame(&mut buf, Role::Client, false, 1024),
            Err(Error::MaxFrameSize)
        ));
    }
}
