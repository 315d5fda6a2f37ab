use crate::error::Error;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Every DEFLATE block flushed with a sync flush ends in this marker. RFC 7692
/// requires it to be stripped from outgoing messages and re-appended to
/// incoming ones before inflating.
pub(crate) const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Sliding window used by our own compressor.
pub(crate) const ENCODER_WINDOW_BITS: u8 = 9;

/// Window advertised to the peer via `client_max_window_bits`.
pub(crate) const DECODER_WINDOW_BITS: u8 = 15;

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096 // 4 KB for small payloads
    } else if payload_size <= 65536 {
        16384 // 16 KB for medium payloads
    } else {
        65536 // 64 KB for large payloads
    }
}

/// Streaming permessage-deflate compressor, one per connection.
///
/// Works on a raw DEFLATE stream (no zlib header). When `reset_context` is
/// set the compression context is thrown away after every message, which is
/// what `server_no_context_takeover` / `client_no_context_takeover` demand
/// from whichever side agreed to them.
pub(crate) struct Encoder {
    compressor: Compress,
    reset_context: bool,
}

impl Encoder {
    pub fn new(mut window_bits: u8, reset_context: bool) -> Self {
        // zlib can't actually produce raw streams with a 256-byte window and
        // silently bumps 8 to 9, so do the same up front.
        if window_bits == 8 {
            window_bits = 9;
        }
        let compressor = Compress::new_with_window_bits(Compression::default(), false, window_bits);
        Self {
            compressor,
            reset_context,
        }
    }

    /// Compresses one whole message payload, returning the DEFLATE stream
    /// with the trailing `00 00 FF FF` sync marker already stripped.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let buffer_size = calculate_buffer_size(payload.len());
        let mut compressed = Vec::with_capacity(buffer_size);
        let mut offset = 0;

        loop {
            // compress_vec only writes into the spare capacity of the output
            // vector, so it has to be grown ahead of each call.
            if compressed.capacity() - compressed.len() < 64 {
                compressed.reserve(buffer_size);
            }

            let before_in = self.compressor.total_in();
            let before_out = self.compressor.total_out();
            let status =
                self.compressor
                    .compress_vec(&payload[offset..], &mut compressed, FlushCompress::Sync)?;
            offset += (self.compressor.total_in() - before_in) as usize;
            let produced = self.compressor.total_out() - before_out;

            match status {
                // BufError just means no progress was possible with the space
                // or input at hand; once the input is fully consumed and the
                // sync flush stopped producing bytes, the message is done.
                Status::Ok | Status::BufError => {
                    if offset >= payload.len() && produced == 0 {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        if compressed.ends_with(&DEFLATE_TRAILER) {
            compressed.truncate(compressed.len() - DEFLATE_TRAILER.len());
        }

        if self.reset_context {
            self.compressor.reset();
        }

        Ok(compressed)
    }
}

/// Streaming permessage-deflate decompressor, one per connection.
///
/// When the sending side keeps its compression context across messages, this
/// side has to keep the decompression context as well, so back-references in
/// later messages can still be resolved. That is why `reset_context` must
/// mirror exactly what was negotiated in the handshake.
pub(crate) struct Decoder {
    decompressor: Decompress,
    reset_context: bool,
}

impl Decoder {
    pub fn new(mut window_bits: u8, reset_context: bool) -> Self {
        if window_bits == 8 {
            window_bits = 9;
        }
        let decompressor = Decompress::new_with_window_bits(false, window_bits);
        Self {
            decompressor,
            reset_context,
        }
    }

    /// Inflates one whole message payload, re-appending the 4-byte sync
    /// marker the sender stripped. `max_size` bounds the inflated size so a
    /// small hostile payload can't blow up into gigabytes.
    pub fn decompress(&mut self, payload: &[u8], max_size: usize) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let buffer_size = calculate_buffer_size(payload.len());
        let mut decompressed = Vec::with_capacity(buffer_size);
        let mut offset = 0;

        loop {
            if decompressed.capacity() - decompressed.len() < 64 {
                decompressed.reserve(buffer_size);
            }

            let before_in = self.decompressor.total_in();
            let before_out = self.decompressor.total_out();
            let status = self.decompressor.decompress_vec(
                &input[offset..],
                &mut decompressed,
                FlushDecompress::Sync,
            )?;
            offset += (self.decompressor.total_in() - before_in) as usize;
            let produced = self.decompressor.total_out() - before_out;

            if decompressed.len() > max_size {
                return Err(Error::MaxMessageSize);
            }

            match status {
                Status::Ok | Status::BufError => {
                    if offset >= input.len() && produced == 0 {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        if self.reset_context {
            self.decompressor.reset(false);
        }

        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut encoder = Encoder::new(ENCODER_WINDOW_BITS, true);
        let mut decoder = Decoder::new(DECODER_WINDOW_BITS, true);

        let payload = b"Hello WebSocket Compression Test! ".repeat(1000);
        let compressed = encoder.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));

        let decompressed = decoder.decompress(&compressed, usize::MAX).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn test_roundtrip_small_payloads() {
        let mut encoder = Encoder::new(ENCODER_WINDOW_BITS, true);
        let mut decoder = Decoder::new(DECODER_WINDOW_BITS, true);

        for payload in [&b"a"[..], b"hi", b"Hello World"] {
            let compressed = encoder.compress(payload).unwrap();
            let decompressed = decoder.decompress(&compressed, usize::MAX).unwrap();
            assert_eq!(decompressed, payload);
        }
    }

    #[test]
    fn test_context_takeover_across_messages() {
        // With context takeover both sides keep their window between
        // messages: later compressions may back-reference earlier ones, and
        // decompression must still line up message by message.
        let mut encoder = Encoder::new(DECODER_WINDOW_BITS, false);
        let mut decoder = Decoder::new(DECODER_WINDOW_BITS, false);

        let first = b"a very repetitive websocket payload".to_vec();
        for _ in 0..5 {
            let compressed = encoder.compress(&first).unwrap();
            let decompressed = decoder.decompress(&compressed, usize::MAX).unwrap();
            assert_eq!(decompressed, first);
        }
    }

    #[test]
    fn test_no_context_takeover_resets_between_messages() {
        let mut encoder = Encoder::new(ENCODER_WINDOW_BITS, true);
        let mut decoder = Decoder::new(DECODER_WINDOW_BITS, true);

        let payload = b"reset me".to_vec();
        let first = encoder.compress(&payload).unwrap();
        let second = encoder.compress(&payload).unwrap();
        // A reset compressor produces identical output for identical input.
        assert_eq!(first, second);

        assert_eq!(decoder.decompress(&first, usize::MAX).unwrap(), payload);
        assert_eq!(decoder.decompress(&second, usize::MAX).unwrap(), payload);
    }

    #[test]
    fn test_decompress_enforces_max_size() {
        let mut encoder = Encoder::new(ENCODER_WINDOW_BITS, true);
        let mut decoder = Decoder::new(DECODER_WINDOW_BITS, true);

        let payload = vec![0u8; 1 << 20];
        let compressed = encoder.compress(&payload).unwrap();
        assert!(matches!(
            decoder.decompress(&compressed, 1024),
            Err(Error::MaxMessageSize)
        ));
    }
}
