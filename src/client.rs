use crate::codec::Role;
use crate::compression::Decoder;
use crate::config::ClientConfig;
use crate::connection::{
    compression_pair, next_connection_id, run_connection, ConnectionState, Handlers, WSConnection,
};
use crate::error::Error;
use crate::handshake;
use crate::message::Message;
use crate::request::{self, ParsedUrl};
use crate::stream::WsStream;
use crate::write::Writer;
use bytes::BytesMut;
use pki_types::ServerName;
use socket2::SockRef;
use std::sync::{Arc, RwLock};
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::{TlsConnector, TlsStream};

/// A websocket client for one `ws://` or `wss://` endpoint.
///
/// The URL is validated at construction time; dialing, TLS setup and the
/// upgrade handshake all happen inside `connect`, bounded by the configured
/// handshake timeout. Once connected, a background task drives the read side
/// and the registered callbacks.
#[derive(Clone)]
pub struct WSClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: ParsedUrl,
    config: ClientConfig,
    handlers: RwLock<Handlers>,
    connection: RwLock<Option<Arc<WSConnection>>>,
}

impl WSClient {
    pub fn new(url: &str) -> Result<Self, Error> {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self, Error> {
        let parsed = request::parse_ws_url(url)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                url: parsed,
                config,
                handlers: RwLock::new(Handlers::default()),
                connection: RwLock::new(None),
            }),
        })
    }

    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn(Arc<WSConnection>) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_connect = Some(Arc::new(handler));
        }
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Arc<WSConnection>, Message) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_message = Some(Arc::new(handler));
        }
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_close = Some(Arc::new(handler));
        }
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.on_error = Some(Arc::new(handler));
        }
    }

    /// Dials the endpoint and performs the upgrade handshake. On success the
    /// read loop is spawned, `on_open` has fired and the connection handle is
    /// returned. On failure `on_error` and `on_close` fire, in that order,
    /// and the error is also returned to the caller.
    pub async fn connect(&self) -> Result<Arc<WSConnection>, Error> {
        let id = next_connection_id();
        let handlers = self
            .inner
            .handlers
            .read()
            .map(|handlers| handlers.clone())
            .unwrap_or_default();

        let dial = self.dial(id);
        let result = match timeout(self.inner.config.handshake_timeout, dial).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match result {
            Ok((conn, read_half, buffer, decoder)) => {
                if let Ok(mut slot) = self.inner.connection.write() {
                    *slot = Some(conn.clone());
                }
                handlers.dispatch_connect(conn.clone());
                tokio::spawn(run_connection(
                    conn.clone(),
                    read_half,
                    buffer,
                    decoder,
                    handlers,
                    self.inner.config.ping_pong,
                    self.inner.config.web_socket_config.clone(),
                ));
                Ok(conn)
            }
            Err(err) => {
                handlers.dispatch_error(&err);
                handlers.dispatch_close(id);
                Err(err)
            }
        }
    }

    async fn dial(
        &self,
        id: u64,
    ) -> Result<(Arc<WSConnection>, ReadHalf<WsStream>, BytesMut, Option<Decoder>), Error> {
        let config = &self.inner.config;
        let parsed = &self.inner.url;

        let tcp_stream = TcpStream::connect(&parsed.host_with_port).await?;
        let _ = SockRef::from(&tcp_stream).set_keepalive(true);
        let _ = tcp_stream.set_nodelay(true);

        let ws_stream = if parsed.use_tls {
            self.tls_connect(tcp_stream).await?
        } else {
            WsStream::Plain(tcp_stream)
        };

        let (mut read_half, write_half) = tokio::io::split(ws_stream);
        let writer = Arc::new(Mutex::new(Writer::new(
            write_half,
            Role::Client,
            config.web_socket_config.clone(),
        )));
        let conn = Arc::new(WSConnection::new(id, Role::Client, writer.clone()));

        let key = handshake::generate_websocket_key();
        let upgrade_request = request::construct_http_request(
            parsed,
            &key,
            config.offer_deflate,
            &config.extra_headers,
        );
        writer.lock().await.write_raw(upgrade_request.as_bytes()).await?;

        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let head = handshake::read_head(&mut read_half, &mut buffer).await?;
        let negotiated =
            handshake::verify_response(&head, &key)?.filter(|_| config.offer_deflate);

        let decoder = match negotiated {
            Some(extensions) => {
                let (encoder, decoder) = compression_pair(Role::Client, &extensions);
                writer.lock().await.set_encoder(encoder);
                conn.set_deflate(true);
                Some(decoder)
            }
            None => None,
        };

        conn.set_state(ConnectionState::Open);
        Ok((conn, read_half, buffer, decoder))
    }

    async fn tls_connect(&self, tcp_stream: TcpStream) -> Result<WsStream, Error> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_file) = &self.inner.config.ca_file {
            let file = std::fs::File::open(ca_file)?;
            let mut reader = std::io::BufReader::new(file);
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()?;
            root_store.add_parsable_certificates(certs);
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let domain = ServerName::try_from(self.inner.url.host.clone())?;

        let tls_stream = connector.connect(domain, tcp_stream).await?;
        Ok(WsStream::Secure(Box::new(TlsStream::Client(tls_stream))))
    }

    /// The live connection handle, if `connect` succeeded.
    pub fn connection(&self) -> Option<Arc<WSConnection>> {
        self.inner
            .connection
            .read()
            .ok()
            .and_then(|slot| slot.clone())
    }

    pub async fn send(&self, message: Message) -> Result<(), Error> {
        match self.connection() {
            Some(connection) => connection.send(message).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        match self.connection() {
            Some(connection) => connection.close().await,
            None => Err(Error::ConnectionClosed),
        }
    }
}
