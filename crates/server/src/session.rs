//! Duplex session over a WebSocket.
//!
//! Each socket gets a writer task fed by a bounded channel and a read loop in
//! the upgrade task. Requests from the peer run concurrently; their replies go
//! out through the same writer.

use crate::download::DownloadCoordinator;
use crate::metrics::ACTIVE_SESSIONS;
use crate::upload::UploadCoordinator;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use ferry_core::{Event, Frame, FrameKind, PendingReplies, Reply};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Frames buffered per session before senders wait for the writer.
pub const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("no reply to {event} within {timeout:?}")]
    Timeout {
        event: &'static str,
        timeout: Duration,
    },
}

/// Sending half of one session, shared by the handlers and the download hub.
#[derive(Clone)]
pub struct Connection {
    outbound: mpsc::Sender<Frame>,
    pending: PendingReplies,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            outbound,
            pending: PendingReplies::new(),
        }
    }

    /// Send a request and wait for the peer's reply.
    pub async fn request(&self, event: Event, timeout: Duration) -> Result<Reply, SessionError> {
        let name = event.name();
        let (id, rx) = self.pending.register();
        if self.outbound.send(Frame::request(id, event)).await.is_err() {
            self.pending.forget(id);
            return Err(SessionError::Closed);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.pending.forget(id);
                Err(SessionError::Timeout {
                    event: name,
                    timeout,
                })
            }
        }
    }

    pub async fn notify(&self, event: Event) -> Result<(), SessionError> {
        self.outbound
            .send(Frame::notify(event))
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn reply(&self, id: u64, reply: Reply) -> Result<(), SessionError> {
        self.outbound
            .send(Frame::reply(id, reply))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Hand a reply from the peer to the request waiting on `id`.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        self.pending.resolve(id, reply)
    }

    /// Fail every request still waiting on this session.
    pub fn close(&self) {
        self.pending.fail_all();
    }
}

/// Handlers bound to an authenticated session's role.
#[derive(Clone)]
pub enum SessionHandler {
    Upload(Arc<UploadCoordinator>),
    Download(Arc<DownloadCoordinator>),
}

impl SessionHandler {
    pub fn role(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload",
            Self::Download(_) => "download",
        }
    }

    fn rejected(&self, event: &Event) -> Reply {
        tracing::debug!(
            role = self.role(),
            event = event.name(),
            "rejecting event outside session role"
        );
        Reply::Rejected {
            reason: format!(
                "{} is not permitted on a {} session",
                event.name(),
                self.role()
            ),
        }
    }

    pub async fn handle_request(&self, event: Event) -> Reply {
        match (self, event) {
            (Self::Upload(upload), Event::UploadCreate(requests)) => {
                Reply::UploadCreate(upload.create(requests).await)
            }
            (Self::Upload(upload), Event::UploadComplete(job)) => {
                Reply::UploadComplete(upload.complete(job).await)
            }
            (Self::Upload(upload), Event::UploadChecksum(checksum)) => {
                Reply::UploadChecksum(upload.checksum(checksum).await)
            }
            (Self::Download(download), Event::DownloadComplete(jobs)) => {
                Reply::DownloadComplete(download.complete(jobs).await)
            }
            (Self::Download(download), Event::DownloadVerified(file)) => {
                download.verified(file).await;
                Reply::Received
            }
            (_, event) => self.rejected(&event),
        }
    }

    /// Handle a notification. Returns a rejection when the event is not
    /// permitted for this role.
    pub async fn handle_notify(&self, event: Event) -> Option<Reply> {
        match (self, event) {
            (Self::Download(download), Event::DownloadVerified(file)) => {
                download.verified(file).await;
                None
            }
            (_, event) => Some(self.rejected(&event)),
        }
    }

    async fn on_connect(&self, session_id: &str, connection: &Connection) -> Option<u64> {
        match self {
            Self::Upload(_) => None,
            Self::Download(download) => {
                Some(download.subscribe(session_id, connection.clone()).await)
            }
        }
    }

    fn on_disconnect(&self, subscription: Option<u64>) {
        if let (Self::Download(download), Some(id)) = (self, subscription) {
            download.unsubscribe(id);
        }
    }
}

/// Drive one upgraded socket until the peer goes away or `shutdown` fires.
/// On shutdown, queued frames are flushed and the socket is closed with
/// 1001 (going away).
pub async fn run(
    socket: WebSocket,
    handler: SessionHandler,
    session_id: String,
    shutdown: CancellationToken,
) {
    let role = handler.role();
    ACTIVE_SESSIONS.with_label_values(&[role]).inc();
    tracing::info!(role, %session_id, "session opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);

    let stopping = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = stopping.cancelled() => {
                    while let Ok(frame) = rx.try_recv() {
                        if write_frame(&mut sink, frame).await.is_err() {
                            break;
                        }
                    }
                    let close = CloseFrame {
                        code: close_code::AWAY,
                        reason: Utf8Bytes::from_static("server shutting down"),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
            };
            if let Err(e) = write_frame(&mut sink, frame).await {
                tracing::debug!(error = %e, "session write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connection = Connection::new(tx);
    let subscription = handler.on_connect(&session_id, &connection).await;
    let tracker = TaskTracker::new();

    loop {
        let message = tokio::select! {
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.cancelled() => {
                tracing::debug!(%session_id, "closing session for shutdown");
                break;
            }
        };
        let bytes = match message {
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(%session_id, error = %e, "session read failed");
                break;
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "dropping undecodable frame");
                continue;
            }
        };

        match frame.kind {
            FrameKind::Reply(reply) => {
                if !connection.resolve(frame.id, reply) {
                    tracing::debug!(id = frame.id, "reply for a request nobody is waiting on");
                }
            }
            FrameKind::Request(event) => {
                let handler = handler.clone();
                let connection = connection.clone();
                let id = frame.id;
                tracker.spawn(async move {
                    let reply = handler.handle_request(event).await;
                    if connection.reply(id, reply).await.is_err() {
                        tracing::debug!(id, "session closed before reply was sent");
                    }
                });
            }
            FrameKind::Notify(event) => {
                if let Some(reply) = handler.handle_notify(event).await {
                    let _ = connection.reply(frame.id, reply).await;
                }
            }
        }
    }

    handler.on_disconnect(subscription);
    tracker.close();
    tracker.wait().await;
    connection.close();
    drop(connection);
    let _ = writer.await;

    ACTIVE_SESSIONS.with_label_values(&[role]).dec();
    tracing::info!(role, %session_id, "session closed");
}

async fn write_frame<S>(sink: &mut S, frame: Frame) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    match frame.encode() {
        Ok(bytes) => sink.send(Message::Binary(bytes.into())).await,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode frame");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_resolves_with_reply() {
        let (tx, mut rx) = mpsc::channel(4);
        let connection = Connection::new(tx);

        let peer = connection.clone();
        let responder = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert!(matches!(frame.kind, FrameKind::Request(Event::DownloadCreate(_))));
            assert!(peer.resolve(frame.id, Reply::Received));
        });

        let reply = connection
            .request(Event::DownloadCreate(Vec::new()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Received);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (tx, _rx) = mpsc::channel(4);
        let connection = Connection::new(tx);
        let err = connection
            .request(Event::DownloadCreate(Vec::new()), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { event: "download:create", .. }));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let connection = Connection::new(tx);
        assert!(matches!(
            connection
                .request(Event::DownloadCreate(Vec::new()), Duration::from_secs(1))
                .await,
            Err(SessionError::Closed)
        ));
    }
}
