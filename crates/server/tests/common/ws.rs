//! Minimal WebSocket peer speaking the session frame codec.

use ferry_core::{Event, Frame, FrameKind, Reply};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(dead_code)]
pub struct WsPeer {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

#[allow(dead_code)]
impl WsPeer {
    pub async fn connect(
        url: &str,
        token: &str,
        session: Option<&str>,
    ) -> Result<Self, tungstenite::Error> {
        let url = match session {
            Some(session) => format!("{url}?session={session}"),
            None => url.to_string(),
        };
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { socket, next_id: 1 })
    }

    /// HTTP status of a refused upgrade.
    pub async fn refused_status(url: &str, token: &str) -> u16 {
        match Self::connect(url, token, None).await {
            Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
            Err(other) => panic!("unexpected handshake error: {other}"),
            Ok(_) => panic!("upgrade unexpectedly accepted"),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = frame.encode().unwrap();
        self.socket
            .send(Message::Binary(bytes.into()))
            .await
            .unwrap();
    }

    pub async fn next_frame(&mut self) -> Frame {
        loop {
            let message = tokio::time::timeout(READ_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Binary(bytes) = message {
                return Frame::decode(&bytes).unwrap();
            }
        }
    }

    /// Send a request and return its reply. Frames that are not the reply
    /// are dropped.
    pub async fn request(&mut self, event: Event) -> Reply {
        let id = self.next_id;
        self.next_id += 1;
        self.send(Frame::request(id, event)).await;
        loop {
            let frame = self.next_frame().await;
            if let FrameKind::Reply(reply) = frame.kind
                && frame.id == id
            {
                return reply;
            }
        }
    }

    /// Wait for a server request, acknowledge it with `Received` and return
    /// the event.
    pub async fn expect_request(&mut self) -> Event {
        loop {
            let frame = self.next_frame().await;
            if let FrameKind::Request(event) = frame.kind {
                self.send(Frame::reply(frame.id, Reply::Received)).await;
                return event;
            }
        }
    }

    pub async fn expect_notify(&mut self) -> Event {
        loop {
            let frame = self.next_frame().await;
            if let FrameKind::Notify(event) = frame.kind {
                return event;
            }
        }
    }

    /// Read until the server closes the socket and return the close code.
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            let message = tokio::time::timeout(READ_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for close");
            match message {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}
