//! JSON over WebSocket transport.
//!
//! Each [`WsClient`] spawns a tokio task that owns the socket and handles:
//!
//! - Outgoing calls from the pool
//! - Incoming responses, correlated to callers by request id
//! - Failing every outstanding call once the socket ends

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, from_str, to_string};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::{Request, Response};

use super::{Connector, RpcClient, is_valid_method_name};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for opening a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Types
// ============================================================================

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<Response>>>;

/// Internal commands for the event loop.
enum ClientCommand {
    /// Send a request and route its response back.
    Send {
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
    },
    /// Close the socket.
    Shutdown,
}

// ============================================================================
// WsClient
// ============================================================================

/// WebSocket connection to a server.
///
/// Several calls may be outstanding at once; responses are matched by id.
pub struct WsClient {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    /// Correlation map (shared with event loop).
    correlation: Arc<Mutex<CorrelationMap>>,
    /// Flips to `true` when the event loop exits.
    closed_rx: watch::Receiver<bool>,
    /// Why the event loop exited.
    close_reason: Arc<Mutex<Option<Error>>>,
}

impl WsClient {
    /// Creates a client from an open WebSocket stream.
    ///
    /// Spawns the event loop task internally.
    pub fn new<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let close_reason = Arc::new(Mutex::new(None));

        tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            Arc::clone(&correlation),
            Arc::clone(&close_reason),
            closed_tx,
        ));

        Self {
            command_tx,
            correlation,
            closed_rx,
            close_reason,
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the socket is closed before a response arrives
    /// - [`Error::Json`] if the request cannot be serialized
    pub async fn send(&self, request: Request) -> Result<Response> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(ClientCommand::Send {
                request,
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Returns the number of calls awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<ClientCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        close_reason: Arc<Mutex<Option<Error>>>,
        closed_tx: watch::Sender<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let reason = loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_incoming_message(&text, &correlation);
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break Error::ConnectionClosed;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break Error::WebSocket(e);
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break Error::ConnectionClosed;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(ClientCommand::Send { request, response_tx }) => {
                            Self::handle_send_command(
                                request,
                                response_tx,
                                &mut ws_write,
                                &correlation,
                            ).await;
                        }

                        Some(ClientCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break Error::ConnectionClosed;
                        }

                        None => {
                            debug!("Command channel closed");
                            break Error::ConnectionClosed;
                        }
                    }
                }
            }
        };

        Self::fail_pending_requests(&correlation);

        *close_reason.lock() = Some(reason);
        closed_tx.send_replace(true);

        debug!("Event loop terminated");
    }

    /// Routes an incoming text message to its waiting caller.
    fn handle_incoming_message(text: &str, correlation: &Arc<Mutex<CorrelationMap>>) {
        match from_str::<Response>(text) {
            Ok(response) => {
                let tx = correlation.lock().remove(&response.id);

                if let Some(tx) = tx {
                    let _ = tx.send(Ok(response));
                } else {
                    warn!(id = %response.id, "Response for unknown request");
                }
            }
            Err(e) => {
                warn!(error = %e, text = %text, "Failed to parse incoming message");
            }
        }
    }

    /// Serializes and writes one request.
    async fn handle_send_command<S>(
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
        ws_write: &mut SplitSink<WebSocketStream<S>, Message>,
        correlation: &Arc<Mutex<CorrelationMap>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request_id = request.id;

        let json = match to_string(&request) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(Error::Json(e)));
                return;
            }
        };

        // Store correlation before sending
        correlation.lock().insert(request_id, response_tx);

        if let Err(e) = ws_write.send(Message::Text(json.into())).await
            && let Some(tx) = correlation.lock().remove(&request_id)
        {
            let _ = tx.send(Err(Error::connection(e.to_string())));
        }

        trace!(%request_id, method = %request.method, "Request sent");
    }

    /// Fails all pending requests with ConnectionClosed error.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on close");
        }
    }
}

#[async_trait]
impl RpcClient for WsClient {
    fn supports(&self, method: &str) -> bool {
        is_valid_method_name(method)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.send(Request::new(method, params)).await?.into_result()
    }

    fn close(&self) {
        let _ = self.command_tx.send(ClientCommand::Shutdown);
    }

    fn is_connected(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    async fn closed(&self) -> Error {
        let mut closed_rx = self.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
        self.close_reason
            .lock()
            .take()
            .unwrap_or(Error::ConnectionClosed)
    }
}

// ============================================================================
// WsConnector
// ============================================================================

/// Opens [`WsClient`] connections to one endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Server endpoint.
    url: Url,
    /// Maximum time for TCP connect plus WebSocket upgrade.
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for a `ws://` or `wss://` endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if `url` does not parse
    /// - [`Error::Config`] if the scheme is not `ws` or `wss`
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported endpoint scheme {:?}, expected ws or wss",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn RpcClient>> {
        let (ws_stream, _) = timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| Error::connection_timeout(self.connect_timeout.as_millis() as u64))??;

        debug!(url = %self.url, "WebSocket connection opened");

        Ok(Arc::new(WsClient::new(ws_stream)))
    }
}

// ============================================================================
// Tests
// ============================================================================
