use crate::compression::Decoder;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::message::Message;

struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
    compressed: bool,
}

/// Joins data frames back into whole messages.
///
/// The first frame of a message must carry a Text or Binary opcode; from the
/// second frame to the last the opcode must be Continue, and only the last
/// one has the FIN bit set. The compressed flag is taken from the first frame
/// and, once the final fragment arrived, the accumulated payload runs through
/// the inflator before delivery. Control frames never reach this type, they
/// are handled directly by the connection.
pub(crate) struct MessageAssembler {
    fragmented_message: Option<FragmentedMessage>,
    decoder: Option<Decoder>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(decoder: Option<Decoder>, max_message_size: usize) -> Self {
        Self {
            fragmented_message: None,
            decoder,
            max_message_size,
        }
    }

    /// Feeds one data frame; returns a complete message once the final
    /// fragment has been pushed.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, Error> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                // A second Text or Binary frame while a fragmented message is
                // still in progress can't be valid, the peer has to finish
                // the first message with continuation frames.
                if self.fragmented_message.is_some() {
                    return Err(Error::FragmentedInProgress);
                }
                self.fragmented_message = Some(FragmentedMessage {
                    op_code: frame.opcode,
                    fragments: frame.payload,
                    compressed: frame.compressed,
                });
            }
            OpCode::Continue => match self.fragmented_message {
                Some(ref mut fragmented_message) => {
                    fragmented_message.fragments.extend_from_slice(&frame.payload);
                }
                None => return Err(Error::InvalidContinuationFrame),
            },
            _ => return Err(Error::InvalidOpcode),
        }

        let in_progress = self
            .fragmented_message
            .as_ref()
            .map(|m| m.fragments.len())
            .unwrap_or_default();
        if in_progress > self.max_message_size {
            return Err(Error::MaxMessageSize);
        }

        if !frame.final_fragment {
            return Ok(None);
        }

        // Final fragment: the message is complete, reset the assembler state
        // before decompression so an error leaves it clean for the caller.
        let message = match self.fragmented_message.take() {
            Some(message) => message,
            None => return Err(Error::InvalidContinuationFrame),
        };

        let payload = if message.compressed {
            match self.decoder {
                Some(ref mut decoder) => {
                    decoder.decompress(&message.fragments, self.max_message_size)?
                }
                // The codec only lets RSV1 through when deflate was
                // negotiated, so a missing decoder is a protocol violation.
                None => return Err(Error::RSVNotZero),
            }
        } else {
            message.fragments
        };

        Message::from_payload(message.op_code, payload).map(Some)
    }
}
