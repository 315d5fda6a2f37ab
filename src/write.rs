use crate::codec::{self, Role};
use crate::compression::Encoder;
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::Frame;
use crate::message::{build_data_frames, Message};
use crate::stream::WsStream;
use tokio::io::{AsyncWriteExt, WriteHalf};

/// Owns the write half of the transport and the outbound compressor.
///
/// Exactly one of these exists per connection, behind a mutex, so frames from
/// `send`, control replies and close frames never interleave partially on the
/// wire.
pub(crate) struct Writer {
    write_half: WriteHalf<WsStream>,
    role: Role,
    encoder: Option<Encoder>,
    config: WebSocketConfig,
}

impl Writer {
    pub fn new(write_half: WriteHalf<WsStream>, role: Role, config: WebSocketConfig) -> Self {
        Self {
            write_half,
            role,
            encoder: None,
            config,
        }
    }

    /// Installed once the handshake decided whether compression is on.
    pub fn set_encoder(&mut self, encoder: Encoder) {
        self.encoder = Some(encoder);
    }

    /// Used during the handshake, before the connection talks frames.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_half.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let bytes = codec::encode_frame(frame, self.role);
        self.write_half.write_all(&bytes).await?;
        Ok(())
    }

    /// Sends one data message, compressing it first when permessage-deflate
    /// is active. Messages larger than `max_frame_size` are fragmented.
    pub async fn write_message(&mut self, message: Message) -> Result<(), Error> {
        let fragment_size = self.config.max_frame_size;
        self.write_message_fragmented(message, fragment_size).await
    }

    pub async fn write_message_fragmented(
        &mut self,
        message: Message,
        fragment_size: usize,
    ) -> Result<(), Error> {
        if fragment_size > self.config.max_frame_size {
            return Err(Error::CustomFragmentSizeExceeded(
                fragment_size,
                self.config.max_frame_size,
            ));
        }
        if message.len() > self.config.max_message_size {
            return Err(Error::MaxMessageSize);
        }

        let (opcode, mut payload) = message.into_parts();

        // Compression covers the whole message, before fragmentation; only
        // the first frame announces it through RSV1. Empty payloads are never
        // compressed.
        let compressed = match self.encoder {
            Some(ref mut encoder) if !payload.is_empty() => {
                payload = encoder.compress(&payload)?;
                true
            }
            _ => false,
        };

        for frame in build_data_frames(opcode, payload, fragment_size, compressed) {
            self.write_frame(&frame).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.write_half.shutdown().await;
    }
}
