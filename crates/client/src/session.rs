//! Reconnecting duplex session to the coordinating server.
//!
//! One background task owns the socket. It writes queued frames, routes
//! replies to waiting requests and hands server-initiated events to the
//! caller. When the socket drops it reconnects with exponential backoff,
//! reusing the session id so the server recognises the client.

use crate::error::{ClientError, ClientResult};
use backon::{ExponentialBuilder, Retryable};
use ferry_core::{Event, Frame, FrameKind, PendingReplies, Reply};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

const SESSION_PATH: &str = "/v1/session";
const OUTBOUND_BUFFER: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An event sent by the server.
#[derive(Debug)]
pub struct Incoming {
    pub event: Event,
    /// Present when the server expects a reply.
    pub responder: Option<Responder>,
}

/// Answers one server request.
#[derive(Debug)]
pub struct Responder {
    id: u64,
    outbound: mpsc::Sender<Frame>,
}

impl Responder {
    pub async fn reply(self, reply: Reply) -> ClientResult<()> {
        self.outbound
            .send(Frame::reply(self.id, reply))
            .await
            .map_err(|_| ClientError::Session("session closed".to_string()))
    }
}

struct Shared {
    outbound: mpsc::Sender<Frame>,
    pending: PendingReplies,
    cancel: CancellationToken,
    fatal: Mutex<Option<String>>,
    tasks: TaskTracker,
    session_id: String,
}

impl Shared {
    fn closed_error(&self) -> ClientError {
        let fatal = self.fatal.lock().ok().and_then(|f| f.clone());
        ClientError::Session(fatal.unwrap_or_else(|| "session closed".to_string()))
    }

    fn fail(&self, reason: String) {
        if let Ok(mut fatal) = self.fatal.lock() {
            fatal.get_or_insert(reason);
        }
        self.cancel.cancel();
    }
}

/// Forgets a pending request id when the waiting future goes away.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

/// Handle to a live session. Clones share the connection.
#[derive(Clone)]
pub struct ClientSession {
    shared: Arc<Shared>,
}

impl ClientSession {
    /// Connect to `endpoint` and keep the session alive until `cancel` fires
    /// or [`ClientSession::close`] is called.
    ///
    /// Connection failures are retried with backoff; a handshake refused with
    /// a 4xx status is fatal. Returns the session and the stream of server
    /// events.
    pub async fn connect(
        endpoint: &str,
        token: &str,
        session_id: Option<String>,
        cancel: &CancellationToken,
    ) -> ClientResult<(Self, mpsc::UnboundedReceiver<Incoming>)> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let url = session_url(endpoint, &session_id);
        let cancel = cancel.child_token();
        let socket = connect_with_backoff(&url, token, &cancel).await?;
        tracing::info!(%url, "session established");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            pending: PendingReplies::new(),
            cancel,
            fatal: Mutex::new(None),
            tasks: TaskTracker::new(),
            session_id,
        });

        shared.tasks.spawn(maintain(
            shared.clone(),
            socket,
            url,
            token.to_string(),
            outbound_rx,
            incoming_tx,
        ));
        shared.tasks.close();

        Ok((Self { shared }, incoming_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// A request interrupted by a reconnect is sent again on the new
    /// connection; every request this client makes is safe to repeat.
    pub async fn request(&self, event: Event, timeout: Duration) -> ClientResult<Reply> {
        let name = event.name();
        let attempt = async {
            loop {
                if self.shared.cancel.is_cancelled() {
                    return Err(self.shared.closed_error());
                }
                let (id, rx) = self.shared.pending.register();
                let _guard = PendingGuard {
                    pending: &self.shared.pending,
                    id,
                };
                if self
                    .shared
                    .outbound
                    .send(Frame::request(id, event.clone()))
                    .await
                    .is_err()
                {
                    return Err(self.shared.closed_error());
                }
                match rx.await {
                    Ok(Reply::Rejected { reason }) => return Err(ClientError::Rejected(reason)),
                    Ok(reply) => return Ok(reply),
                    Err(_) => {
                        tracing::debug!(event = name, "connection lost before reply");
                    }
                }
            }
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    /// Send an event that expects no reply.
    pub async fn notify(&self, event: Event) -> ClientResult<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.closed_error());
        }
        self.shared
            .outbound
            .send(Frame::notify(event))
            .await
            .map_err(|_| self.shared.closed_error())
    }

    /// Why the session ended, if it ended on its own.
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().ok().and_then(|f| f.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Flush queued frames, close the socket and wait for the connection
    /// task to finish.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.tasks.wait().await;
    }
}

/// Build the session URL from a server endpoint, accepting `http(s)://`,
/// `ws(s)://` or a bare `host:port`.
pub fn session_url(endpoint: &str, session_id: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    let endpoint = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let base = if endpoint.ends_with(SESSION_PATH) {
        endpoint
    } else {
        format!("{endpoint}{SESSION_PATH}")
    };
    format!("{base}?session={session_id}")
}

async fn connect_once(url: &str, token: &str) -> ClientResult<Socket> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::Session(format!("invalid session url {url}: {e}")))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ClientError::Session("token is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(tungstenite::Error::Http(response)) if response.status().is_client_error() => {
            Err(ClientError::Rejected(format!(
                "session handshake refused with status {}",
                response.status()
            )))
        }
        Err(e) => Err(ClientError::Session(format!("connect failed: {e}"))),
    }
}

async fn connect_with_backoff(
    url: &str,
    token: &str,
    cancel: &CancellationToken,
) -> ClientResult<Socket> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(RECONNECT_MIN_DELAY)
        .with_max_delay(RECONNECT_MAX_DELAY)
        .with_factor(2.0)
        .without_max_times();
    let attempts = (|| connect_once(url, token))
        .retry(backoff)
        .when(|e| !matches!(e, ClientError::Rejected(_)))
        .notify(|e, delay| tracing::warn!(error = %e, ?delay, "session connect failed, retrying"));

    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Session("session closed".to_string())),
        result = attempts => result,
    }
}

async fn maintain(
    shared: Arc<Shared>,
    mut socket: Socket,
    url: String,
    token: String,
    mut outbound_rx: mpsc::Receiver<Frame>,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
) {
    loop {
        let reason = pump(&shared, socket, &mut outbound_rx, &incoming_tx).await;
        // Waiting requests resend themselves once the new connection is up.
        shared.pending.fail_all();
        if shared.cancel.is_cancelled() {
            break;
        }
        tracing::warn!(reason, "session lost, reconnecting");
        match connect_with_backoff(&url, &token, &shared.cancel).await {
            Ok(reconnected) => {
                tracing::info!("session re-established");
                socket = reconnected;
            }
            Err(e) => {
                if !shared.cancel.is_cancelled() {
                    tracing::error!(error = %e, "session cannot be re-established");
                    shared.fail(e.to_string());
                }
                break;
            }
        }
    }
    shared.pending.fail_all();
}

/// Run one connection until it drops. Returns why it ended.
async fn pump(
    shared: &Shared,
    socket: Socket,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    incoming_tx: &mpsc::UnboundedSender<Incoming>,
) -> String {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                while let Ok(frame) = outbound_rx.try_recv() {
                    let Ok(bytes) = frame.encode() else { continue };
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return "closed".to_string();
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return "outbound queue closed".to_string();
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    return format!("write failed: {e}");
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => dispatch(shared, &bytes, incoming_tx),
                Some(Ok(Message::Close(_))) | None => return "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("read failed: {e}"),
            }
        }
    }
}

fn dispatch(shared: &Shared, bytes: &[u8], incoming_tx: &mpsc::UnboundedSender<Incoming>) {
    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "dropping undecodable frame");
            return;
        }
    };
    match frame.kind {
        FrameKind::Reply(reply) => {
            if !shared.pending.resolve(frame.id, reply) {
                tracing::debug!(id = frame.id, "late reply dropped");
            }
        }
        FrameKind::Request(event) => {
            let responder = Responder {
                id: frame.id,
                outbound: shared.outbound.clone(),
            };
            if let Err(mpsc::error::SendError(incoming)) = incoming_tx.send(Incoming {
                event,
                responder: Some(responder),
            }) {
                let name = incoming.event.name();
                if let Some(responder) = incoming.responder {
                    let reason = format!("{name} is not handled by this client");
                    tokio::spawn(async move {
                        let _ = responder.reply(Reply::Rejected { reason }).await;
                    });
                }
            }
        }
        FrameKind::Notify(event) => {
            if incoming_tx
                .send(Incoming {
                    event,
                    responder: None,
                })
                .is_err()
            {
                tracing::trace!("notification ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url() {
        assert_eq!(
            session_url("http://localhost:8080/", "s1"),
            "ws://localhost:8080/v1/session?session=s1"
        );
        assert_eq!(
            session_url("https://ferry.example.com", "s1"),
            "wss://ferry.example.com/v1/session?session=s1"
        );
        assert_eq!(
            session_url("ws://10.0.0.1:9000/v1/session", "s2"),
            "ws://10.0.0.1:9000/v1/session?session=s2"
        );
        assert_eq!(
            session_url("localhost:8080", "s3"),
            "ws://localhost:8080/v1/session?session=s3"
        );
    }

    #[tokio::test]
    async fn test_connect_cancelled_while_retrying() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        // Nothing listens on port 1.
        let result = ClientSession::connect("ws://127.0.0.1:1", "t", None, &cancel).await;
        assert!(matches!(result, Err(ClientError::Session(_))));
    }
}
