//! Broadcast group of connected download sessions.

use crate::session::{Connection, SessionError};
use ferry_core::{Event, Reply};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

struct Subscriber {
    session_id: String,
    connection: Connection,
}

/// Download subscribers plus the session ids seen since start.
#[derive(Default)]
pub struct DownloadHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    seen_sessions: Mutex<HashSet<String>>,
}

impl DownloadHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Returns its id and whether the session id is new.
    pub fn subscribe(&self, session_id: &str, connection: Connection) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let is_new = self
            .seen_sessions
            .lock()
            .map(|mut seen| seen.insert(session_id.to_string()))
            .unwrap_or(true);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(
                id,
                Subscriber {
                    session_id: session_id.to_string(),
                    connection,
                },
            );
        }
        (id, is_new)
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(String, Connection)> {
        self.subscribers
            .lock()
            .map(|subscribers| {
                subscribers
                    .values()
                    .map(|s| (s.session_id.clone(), s.connection.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send `event` as a request to every subscriber and count the ones that
    /// acknowledged within `timeout`.
    pub async fn broadcast_with_ack(&self, event: Event, timeout: Duration) -> usize {
        let name = event.name();
        let requests = self.snapshot().into_iter().map(|(session_id, connection)| {
            let event = event.clone();
            async move {
                match connection.request(event, timeout).await {
                    Ok(Reply::Received) => true,
                    Ok(other) => {
                        tracing::warn!(%session_id, event = name, reply = ?other, "unexpected acknowledgement");
                        false
                    }
                    Err(SessionError::Closed) => false,
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "subscriber did not acknowledge");
                        false
                    }
                }
            }
        });
        join_all(requests).await.into_iter().filter(|acked| *acked).count()
    }

    /// Send `event` as a notification to every subscriber. Returns how many
    /// sessions it was handed to.
    pub async fn notify_all(&self, event: Event) -> usize {
        let sends = self.snapshot().into_iter().map(|(_, connection)| {
            let event = event.clone();
            async move { connection.notify(event).await.is_ok() }
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{FileRef, Frame, FrameKind};
    use tokio::sync::mpsc;

    fn connection() -> (Connection, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (Connection::new(tx), rx)
    }

    #[test]
    fn test_session_ids_are_new_once() {
        let hub = DownloadHub::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();

        let (first, new_first) = hub.subscribe("s1", a);
        let (second, new_second) = hub.subscribe("s1", b);
        assert!(new_first);
        assert!(!new_second);
        assert_ne!(first, second);
        assert_eq!(hub.subscriber_count(), 2);

        hub.unsubscribe(first);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_counts_acknowledgements() {
        let hub = DownloadHub::new();
        let (acking, mut acking_rx) = connection();
        let (silent, _silent_rx) = connection();
        hub.subscribe("acking", acking.clone());
        hub.subscribe("silent", silent);

        tokio::spawn(async move {
            while let Some(frame) = acking_rx.recv().await {
                if let FrameKind::Request(_) = frame.kind {
                    acking.resolve(frame.id, Reply::Received);
                }
            }
        });

        let acked = hub
            .broadcast_with_ack(Event::DownloadCreate(Vec::new()), Duration::from_millis(200))
            .await;
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn test_notify_all_skips_closed_sessions() {
        let hub = DownloadHub::new();
        let (open, mut open_rx) = connection();
        let (closed, closed_rx) = connection();
        drop(closed_rx);
        hub.subscribe("open", open);
        hub.subscribe("closed", closed);

        let event = Event::DownloadVerified(FileRef {
            n: "n".to_string(),
            path: "p".to_string(),
        });
        assert_eq!(hub.notify_all(event.clone()).await, 1);
        let frame = open_rx.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Notify(event));
    }
}
