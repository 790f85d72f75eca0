//! Newline-delimited JSON signaling over any byte stream
//!
//! Each line is one envelope:
//!
//! - client to server: `{"id": 7, "request": {...}}`, `id` omitted for posts
//! - server to client: `{"id": 7, "reply": {...}}` or `{"event": {...}}`
//!
//! Replies are matched to requests by id. A reader task owns the inbound
//! half and a writer task the outbound half; when the stream ends every
//! pending request fails with [`Error::ChannelClosed`] and the event stream
//! closes.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{ClientRequest, ServerEvent, ServerReply};
use crate::signaling::SignalingChannel;

/// Client to server line
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub request: ClientRequest,
}

/// Server to client line
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEnvelope {
    Reply { id: u64, reply: ServerReply },
    Event { event: ServerEvent },
}

/// Tuning for [`JsonLineChannel`]
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// How long a request waits for its reply
    pub request_timeout: Duration,
    /// Events buffered before the reader stops reading
    pub event_buffer: usize,
    /// Longest accepted line in bytes
    pub max_frame_len: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            event_buffer: 256,
            max_frame_len: 1024 * 1024,
        }
    }
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerReply>>>>;

pub struct JsonLineChannel {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingReplies,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl JsonLineChannel {
    /// Start the reader and writer tasks over `io`. Returns the channel and
    /// the stream of server events for [`crate::Session::run`].
    pub fn connect<T>(io: T, options: &ChannelOptions) -> (Self, mpsc::Receiver<ServerEvent>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(io, LinesCodec::new_with_max_length(options.max_frame_len));
        let (mut sink, mut stream) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::channel(options.event_buffer.max(1));
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_closed.cancelled() => break,
                    line = outbound_rx.recv() => {
                        let Some(line) = line else { break };
                        if let Err(e) = sink.send(line).await {
                            warn!(error = %e, "Signaling write failed");
                            break;
                        }
                    }
                }
            }
            writer_closed.cancel();
            debug!("Signaling writer stopped");
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = reader_closed.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(error = %e, "Signaling read failed");
                        break;
                    }
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ServerEnvelope>(&line) {
                    Ok(ServerEnvelope::Reply { id, reply }) => {
                        let waiter = reader_pending.lock().remove(&id);
                        match waiter {
                            Some(waiter) => {
                                // The requester may have timed out already
                                let _ = waiter.send(reply);
                            }
                            None => debug!(id, "Reply for unknown request"),
                        }
                    }
                    Ok(ServerEnvelope::Event { event }) => {
                        if events_tx.send(event).await.is_err() {
                            debug!("Event receiver dropped");
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed signaling message"),
                }
            }
            // Cancel before clearing so late requests see the closure
            reader_closed.cancel();
            reader_pending.lock().clear();
            debug!("Signaling reader stopped");
        });

        (
            Self {
                outbound,
                pending,
                next_id: AtomicU64::new(1),
                request_timeout: options.request_timeout,
                closed,
            },
            events_rx,
        )
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop both tasks; pending requests fail with [`Error::ChannelClosed`]
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn send_line(&self, envelope: &ClientEnvelope) -> Result<()> {
        let line = serde_json::to_string(envelope)?;
        self.outbound.send(line).map_err(|_| Error::ChannelClosed)
    }
}

impl Drop for JsonLineChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl SignalingChannel for JsonLineChannel {
    async fn request(&self, request: ClientRequest) -> Result<ServerReply> {
        let name = request.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(Error::ChannelClosed);
        }

        let envelope = ClientEnvelope {
            id: Some(id),
            request,
        };
        if let Err(e) = self.send_line(&envelope) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(request = name, id, "Signaling request timed out");
                Err(Error::Timeout(name))
            }
        }
    }

    fn post(&self, request: ClientRequest) {
        let name = request.name();
        let envelope = ClientEnvelope { id: None, request };
        if let Err(e) = self.send_line(&envelope) {
            debug!(request = name, error = %e, "Post dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProducerId;
    use tokio::io::DuplexStream;

    type ServerSide = Framed<DuplexStream, LinesCodec>;

    fn pair(timeout: Duration) -> (JsonLineChannel, mpsc::Receiver<ServerEvent>, ServerSide) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let options = ChannelOptions {
            request_timeout: timeout,
            ..Default::default()
        };
        let (channel, events) = JsonLineChannel::connect(client, &options);
        (channel, events, Framed::new(server, LinesCodec::new()))
    }

    async fn next_request(server: &mut ServerSide) -> ClientEnvelope {
        let line = server.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(server: &mut ServerSide, envelope: ServerEnvelope) {
        server
            .send(serde_json::to_string(&envelope).unwrap())
            .await
            .unwrap();
    }

    fn close_producer(id: &str) -> ClientRequest {
        ClientRequest::CloseProducer {
            producer_id: ProducerId::from(id),
        }
    }

    #[tokio::test]
    async fn test_replies_are_matched_by_id() {
        let (channel, _events, mut server) = pair(Duration::from_secs(5));
        let channel = Arc::new(channel);

        let first = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.request(close_producer("a")).await }
        });
        let a = next_request(&mut server).await;
        let second = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.request(close_producer("b")).await }
        });
        let b = next_request(&mut server).await;
        assert_ne!(a.id, b.id);

        // Answer out of order
        let rejected = ServerReply::Rejected {
            reason: "unknown producer".to_string(),
        };
        reply(&mut server, ServerEnvelope::Reply { id: b.id.unwrap(), reply: rejected.clone() }).await;
        reply(&mut server, ServerEnvelope::Reply { id: a.id.unwrap(), reply: ServerReply::Ack }).await;

        assert_eq!(first.await.unwrap().unwrap(), ServerReply::Ack);
        assert_eq!(second.await.unwrap().unwrap(), rejected);
    }

    #[tokio::test]
    async fn test_events_and_posts() {
        let (channel, mut events, mut server) = pair(Duration::from_secs(5));

        channel.post(close_producer("p1"));
        let posted = next_request(&mut server).await;
        assert!(posted.id.is_none());
        assert_eq!(posted.request, close_producer("p1"));

        server.send("not json".to_string()).await.unwrap();
        let event = ServerEvent::ProducerClosed {
            producer_id: ProducerId::from("r1"),
        };
        reply(&mut server, ServerEnvelope::Event { event: event.clone() }).await;
        assert_eq!(events.recv().await, Some(event));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (channel, _events, mut server) = pair(Duration::from_millis(200));

        let request = channel.request(close_producer("p1"));
        let (result, _) = tokio::join!(request, next_request(&mut server));
        assert!(matches!(result, Err(Error::Timeout("closeProducer"))));
        assert!(channel.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_link_drop_fails_pending_and_ends_events() {
        let (channel, mut events, mut server) = pair(Duration::from_secs(5));

        let (result, _) = tokio::join!(channel.request(close_producer("p1")), async {
            next_request(&mut server).await;
            drop(server);
        });
        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert!(events.recv().await.is_none());
        assert!(channel.is_closed());
        assert!(matches!(
            channel.request(close_producer("p2")).await,
            Err(Error::ChannelClosed)
        ));
    }
}
