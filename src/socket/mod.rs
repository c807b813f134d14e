//! WebSocket frame transport.
//!
//! Owns the raw socket: outbound frames are paced through a queue with a
//! minimum inter-send interval; inbound WebSocket messages are reassembled
//! into length-prefixed frame bodies. Encryption happens a layer above.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Socket errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("socket closed")]
    Closed,
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// A connected frame socket. Dropping it tears down both pump tasks.
pub struct FrameSocket {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    /// Signalled when a send hit a closed socket and wants a reconnect.
    pub reconnect_request: Arc<Notify>,
}

impl FrameSocket {
    /// Connect and spawn the reader/writer pumps. Returns the socket handle
    /// and the stream of reassembled incoming frame bodies.
    pub async fn connect(
        endpoint: &str,
        send_spacing: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>), SocketError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let closed = Arc::new(AtomicBool::new(false));
        let reconnect_request = Arc::new(Notify::new());
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Writer pump: paced sends; a failed send re-queues at the head and
        // requests reconnection.
        let writer_closed = closed.clone();
        let writer_reconnect = reconnect_request.clone();
        tokio::spawn(async move {
            let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
            let mut last_send = Instant::now() - send_spacing;
            loop {
                let frame = match pending.pop_front() {
                    Some(frame) => frame,
                    None => match outgoing_rx.recv().await {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let elapsed = last_send.elapsed();
                if elapsed < send_spacing {
                    tokio::time::sleep(send_spacing - elapsed).await;
                }
                if let Err(e) = sink.send(Message::Binary(frame.clone())).await {
                    warn!("socket send failed, re-queueing frame: {e}");
                    pending.push_front(frame);
                    writer_closed.store(true, Ordering::Release);
                    writer_reconnect.notify_one();
                    break;
                }
                last_send = Instant::now();
            }
        });

        // Reader pump: reassemble 3-byte length-prefixed frames across
        // WebSocket message boundaries.
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        buffer.extend_from_slice(&data);
                        for frame in drain_frames(&mut buffer) {
                            if incoming_tx.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("socket closed by peer: {frame:?}");
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(_) => {}
                    Err(e) => {
                        warn!("socket read error: {e}");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
        });

        Ok((
            Self {
                outgoing: outgoing_tx,
                closed,
                reconnect_request,
            },
            incoming_rx,
        ))
    }

    /// Queue a raw frame for sending.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), SocketError> {
        if self.is_closed() {
            self.reconnect_request.notify_one();
            return Err(SocketError::Closed);
        }
        self.outgoing
            .send(frame)
            .map_err(|_| SocketError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the socket dead; pumps will unwind on their own.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Split complete `len24 || body` frames off the front of the buffer.
fn drain_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        if buffer.len() < 3 {
            break;
        }
        let len = ((buffer[0] as usize) << 16) | ((buffer[1] as usize) << 8) | buffer[2] as usize;
        if buffer.len() < 3 + len {
            break;
        }
        let body = buffer[3..3 + len].to_vec();
        buffer.drain(..3 + len);
        frames.push(body);
    }
    frames
}
