use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Builds a message from a fully reassembled (and decompressed) payload.
    /// Text payloads must be valid UTF-8.
    pub(crate) fn from_payload(opcode: OpCode, payload: Vec<u8>) -> Result<Self, Error> {
        match opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(payload)?)),
            OpCode::Binary => Ok(Message::Binary(payload)),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub(crate) fn into_parts(self) -> (OpCode, Vec<u8>) {
        match self {
            Message::Text(text) => (OpCode::Text, text.into_bytes()),
            Message::Binary(data) => (OpCode::Binary, data),
        }
    }

    // Function to get the payload as binary (Vec<u8>)
    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.clone(),
        }
    }

    // Function to get the payload as a String
    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits one (possibly compressed) message payload into wire frames: the
/// first frame carries the data opcode and, when the message was compressed,
/// the RSV1 marker; every following chunk goes out as a continuation frame
/// and only the last one has FIN set.
pub(crate) fn build_data_frames(
    opcode: OpCode,
    payload: Vec<u8>,
    fragment_size: usize,
    compressed: bool,
) -> Vec<Frame> {
    if payload.is_empty() {
        return vec![Frame::new(true, opcode, payload, compressed)];
    }

    let mut frames = Vec::new();
    for chunk in payload.chunks(fragment_size) {
        let first = frames.is_empty();
        frames.push(Frame {
            final_fragment: false,
            opcode: if first { opcode } else { OpCode::Continue },
            payload: chunk.to_vec(),
            compressed: compressed && first,
        });
    }

    if let Some(last_frame) = frames.last_mut() {
        last_frame.final_fragment = true;
    }

    frames
}
