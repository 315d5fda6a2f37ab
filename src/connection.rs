use crate::assembler::MessageAssembler;
use crate::codec::{self, Role};
use crate::compression::{Decoder, Encoder, DECODER_WINDOW_BITS, ENCODER_WINDOW_BITS};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::extensions::Extensions;
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::message::Message;
use crate::request::HttpRequest;
use crate::stream::WsStream;
use crate::write::Writer;
use bytes::BytesMut;
use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Grace period after sending a close frame, giving the peer a moment to
/// answer with its own close before the transport goes away.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Handshaking = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

type RequestHandler = Arc<dyn Fn(&HttpRequest) + Send + Sync>;
type ConnectHandler = Arc<dyn Fn(Arc<WSConnection>) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(Arc<WSConnection>, Message) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(u64) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// The callback set registered by the application. A panicking callback is
/// caught and logged; it never tears the connection down or poisons the
/// codec.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub on_request: Option<RequestHandler>,
    pub on_connect: Option<ConnectHandler>,
    pub on_message: Option<MessageHandler>,
    pub on_close: Option<CloseHandler>,
    pub on_error: Option<ErrorHandler>,
}

impl Handlers {
    pub fn dispatch_request(&self, request: &HttpRequest) {
        if let Some(handler) = &self.on_request {
            if catch_unwind(AssertUnwindSafe(|| handler(request))).is_err() {
                error!("on_request callback panicked");
            }
        }
    }

    pub fn dispatch_connect(&self, connection: Arc<WSConnection>) {
        if let Some(handler) = &self.on_connect {
            if catch_unwind(AssertUnwindSafe(|| handler(connection))).is_err() {
                error!("on_connect callback panicked");
            }
        }
    }

    pub fn dispatch_message(&self, connection: Arc<WSConnection>, message: Message) {
        if let Some(handler) = &self.on_message {
            if catch_unwind(AssertUnwindSafe(|| handler(connection, message))).is_err() {
                error!("on_message callback panicked");
            }
        }
    }

    pub fn dispatch_close(&self, id: u64) {
        if let Some(handler) = &self.on_close {
            if catch_unwind(AssertUnwindSafe(|| handler(id))).is_err() {
                error!("on_close callback panicked");
            }
        }
    }

    pub fn dispatch_error(&self, err: &Error) {
        if let Some(handler) = &self.on_error {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                error!("on_error callback panicked");
            }
        }
    }
}

/// One websocket connection, shared between the library's read task and the
/// application.
///
/// The connection exclusively owns its transport halves and compressor state;
/// user code only ever holds this handle behind an `Arc` and interacts
/// through `send`/`close` and the read-only accessors.
pub struct WSConnection {
    id: u64,
    pub(crate) role: Role,
    state: AtomicU8,
    deflate: AtomicBool,
    pub(crate) writer: Arc<Mutex<Writer>>,
    request: OnceLock<HttpRequest>,
    close_dispatched: AtomicBool,
}

impl WSConnection {
    pub(crate) fn new(id: u64, role: Role, writer: Arc<Mutex<Writer>>) -> Self {
        Self {
            id,
            role,
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            deflate: AtomicBool::new(false),
            writer,
            request: OnceLock::new(),
            close_dispatched: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_handshake(&self) -> bool {
        self.state() == ConnectionState::Handshaking
    }

    /// The parsed upgrade request; `None` on client connections and before
    /// the server handshake completed.
    pub fn get_request(&self) -> Option<&HttpRequest> {
        self.request.get()
    }

    pub(crate) fn set_request(&self, request: HttpRequest) {
        let _ = self.request.set(request);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically moves `from` to `to`; false when some other task got there
    /// first.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn set_deflate(&self, negotiated: bool) {
        self.deflate.store(negotiated, Ordering::SeqCst);
    }

    pub fn deflate_negotiated(&self) -> bool {
        self.deflate.load(Ordering::SeqCst)
    }

    /// True exactly once, for whichever task reaches teardown first.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.close_dispatched.swap(true, Ordering::SeqCst)
    }

    /// Sends one data message. Only valid while the connection is open;
    /// after a close has started this fails instead of queueing.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        if self.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }
        self.writer.lock().await.write_message(message).await
    }

    /// Sends one data message split into continuation frames of at most
    /// `fragment_size` bytes each.
    pub async fn send_fragmented(
        &self,
        message: Message,
        fragment_size: usize,
    ) -> Result<(), Error> {
        if self.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }
        self.writer
            .lock()
            .await
            .write_message_fragmented(message, fragment_size)
            .await
    }

    /// Sends a ping frame; the payload is limited to 125 bytes like any
    /// other control frame.
    pub async fn send_ping(&self, payload: Vec<u8>) -> Result<(), Error> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFramePayloadSize);
        }
        if self.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }
        self.writer
            .lock()
            .await
            .write_frame(&Frame::new(true, OpCode::Ping, payload, false))
            .await
    }

    /// Starts a clean shutdown: sends a close frame, waits a bounded grace
    /// period for the peer's echo, then closes the transport. Calling it
    /// again (or calling it while the peer already closed) is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        if self.transition(ConnectionState::Open, ConnectionState::Closing) {
            let close_frame = Frame::new(true, OpCode::Close, Vec::new(), false);
            let _ = self.writer.lock().await.write_frame(&close_frame).await;
            sleep(CLOSE_GRACE_PERIOD).await;
            self.writer.lock().await.shutdown().await;
            self.set_state(ConnectionState::Closed);
        } else if self.transition(ConnectionState::Handshaking, ConnectionState::Closed) {
            self.writer.lock().await.shutdown().await;
        }
        Ok(())
    }
}

/// Builds the compressor/decompressor pair for one side of a negotiated
/// permessage-deflate connection.
///
/// Whoever compresses under a no-context-takeover constraint resets after
/// every message, and the opposite decompressor resets in lockstep. Window
/// sizes follow the negotiated caps: our server-side compressor always stays
/// at its own small window, while decompressors size themselves to whatever
/// the peer may use.
pub(crate) fn compression_pair(role: Role, extensions: &Extensions) -> (Encoder, Decoder) {
    match role {
        Role::Server => (
            Encoder::new(ENCODER_WINDOW_BITS, extensions.server_no_context_takeover),
            Decoder::new(
                extensions.client_max_window_bits.unwrap_or(DECODER_WINDOW_BITS),
                extensions.client_no_context_takeover,
            ),
        ),
        Role::Client => (
            Encoder::new(
                extensions.client_max_window_bits.unwrap_or(DECODER_WINDOW_BITS),
                extensions.client_no_context_takeover,
            ),
            Decoder::new(
                extensions.server_max_window_bits.unwrap_or(DECODER_WINDOW_BITS),
                extensions.server_no_context_takeover,
            ),
        ),
    }
}

/// Drives an open connection until it closes: decodes frames, answers
/// control frames, feeds data frames to the assembler and delivers complete
/// messages. Returns once the transport is gone, after firing `on_close`
/// exactly once.
pub(crate) async fn run_connection(
    conn: Arc<WSConnection>,
    mut read_half: ReadHalf<WsStream>,
    mut buffer: BytesMut,
    decoder: Option<Decoder>,
    handlers: Handlers,
    ping_pong: bool,
    config: WebSocketConfig,
) {
    let mut assembler = MessageAssembler::new(decoder, config.max_message_size);

    let outcome = drive(
        &conn,
        &mut read_half,
        &mut buffer,
        &mut assembler,
        &handlers,
        ping_pong,
        &config,
    )
    .await;

    if let Err(err) = &outcome {
        // Best effort: tell the peer why before dropping the transport.
        if conn.transition(ConnectionState::Open, ConnectionState::Closing) {
            let close_frame = Frame::close_with_code(err.close_code());
            let _ = conn.writer.lock().await.write_frame(&close_frame).await;
        }
        handlers.dispatch_error(err);
    }

    conn.set_state(ConnectionState::Closed);
    conn.writer.lock().await.shutdown().await;
    if conn.mark_closed() {
        handlers.dispatch_close(conn.id());
    }
}

async fn drive(
    conn: &Arc<WSConnection>,
    read_half: &mut ReadHalf<WsStream>,
    buffer: &mut BytesMut,
    assembler: &mut MessageAssembler,
    handlers: &Handlers,
    ping_pong: bool,
    config: &WebSocketConfig,
) -> Result<(), Error> {
    loop {
        // Drain every complete frame that is already buffered before going
        // back to the transport, so a ping or close never waits behind a
        // read call for frames that have in fact arrived.
        while let Some(frame) = codec::decode_frame(
            buffer,
            conn.role,
            conn.deflate_negotiated(),
            config.max_frame_size,
        )? {
            match frame.opcode {
                OpCode::Close => {
                    // Echo the close with an empty body, unless this side
                    // already sent its own close frame.
                    if conn.transition(ConnectionState::Open, ConnectionState::Closing) {
                        let close_frame = Frame::new(true, OpCode::Close, Vec::new(), false);
                        let _ = conn.writer.lock().await.write_frame(&close_frame).await;
                        sleep(CLOSE_GRACE_PERIOD).await;
                    }
                    return Ok(());
                }
                OpCode::Ping => {
                    // Pongs only make sense while the connection is still
                    // open; during our own close sequence the write half may
                    // already be gone.
                    if ping_pong && conn.state() == ConnectionState::Open {
                        let pong = Frame::new(true, OpCode::Pong, frame.payload, false);
                        conn.writer.lock().await.write_frame(&pong).await?;
                    }
                }
                OpCode::Pong => {
                    // Absorb; pongs confirm liveness and need no reaction.
                }
                OpCode::Text | OpCode::Binary | OpCode::Continue => {
                    if let Some(message) = assembler.push(frame)? {
                        handlers.dispatch_message(conn.clone(), message);
                    }
                }
            }
        }

        if read_half.read_buf(buffer).await? == 0 {
            // EOF: the peer dropped the transport.
            return Ok(());
        }
    }
}
