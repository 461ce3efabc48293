//! TCP transport for the gateway: one session per connection, JSON lines in
//! both directions. Notifications and bridge messages share the connection
//! with responses; a single writer task owns the socket's write half.

use crate::bridge::PublishedMessage;
use crate::gateway::AccessGateway;
use crate::hub::{SubscriptionId, SubscriptionParams};
use crate::protocol::{
    ProtocolError, ProtocolHandler, Request, RequestType, Response, ResponsePayload, ServerMessage, MAX_REQUEST_SIZE,
};
use crate::signal::StatusCode;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const OUTBOUND_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    Line(String),
    /// The line exceeded the limit; its bytes were discarded.
    TooLong,
}

/// Newline-delimited reader that never buffers more than `limit + 1` bytes
/// of a single line. Cancel safe: partial reads stay in the buffer.
pub struct BoundedLines<R> {
    reader: R,
    buf: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> BoundedLines<R> {
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            limit,
            discarding: false,
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<InboundLine>> {
        loop {
            let budget = (self.limit + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.reader).take(budget).read_until(b'\n', &mut self.buf).await?;
            let terminated = self.buf.last() == Some(&b'\n');

            if terminated || read == 0 {
                if read == 0 && self.buf.is_empty() && !self.discarding {
                    return Ok(None);
                }
                let mut line = std::mem::take(&mut self.buf);
                if terminated {
                    line.pop();
                }
                if std::mem::replace(&mut self.discarding, false) || line.len() > self.limit {
                    return Ok(Some(InboundLine::TooLong));
                }
                return Ok(Some(InboundLine::Line(String::from_utf8_lossy(&line).into_owned())));
            }

            if self.buf.len() > self.limit {
                self.discarding = true;
                self.buf.clear();
            }
        }
    }
}

/// Per-connection state: owned subscriptions and the forwarding tasks feeding
/// the outbound channel.
pub struct Session {
    gateway: AccessGateway,
    protocol: ProtocolHandler,
    outbound: mpsc::Sender<ServerMessage>,
    bridge: broadcast::Sender<PublishedMessage>,
    subscriptions: HashMap<SubscriptionId, JoinHandle<()>>,
    bridge_task: Option<JoinHandle<()>>,
    default_queue_depth: usize,
}

impl Session {
    pub fn new(
        gateway: AccessGateway,
        outbound: mpsc::Sender<ServerMessage>,
        bridge: broadcast::Sender<PublishedMessage>,
        default_queue_depth: usize,
    ) -> Self {
        Self {
            gateway,
            protocol: ProtocolHandler::new(),
            outbound,
            bridge,
            subscriptions: HashMap::new(),
            bridge_task: None,
            default_queue_depth,
        }
    }

    fn now_ms(&self) -> u64 {
        self.gateway.store().clock().now_ms().unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Decodes one line and answers it. Decoding failures become a
    /// `BadDecodingError` response; the session stays usable.
    pub fn handle_line(&mut self, line: &str) -> Response {
        match self.protocol.parse_request(line) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                self.protocol.decoding_error(self.now_ms(), &e)
            }
        }
    }

    /// Answer for an inbound line longer than `MAX_REQUEST_SIZE`.
    pub fn reject_oversized(&mut self) -> Response {
        let error = ProtocolError::MessageTooLarge;
        warn!("Failed to parse request: {}", error);
        self.protocol.decoding_error(self.now_ms(), &error)
    }

    pub fn handle_request(&mut self, request: Request) -> Response {
        let id = request.id;
        let now = self.now_ms();
        debug!("Request {}: {:?}", id, request.request_type);

        match request.request_type {
            RequestType::Ping => Response::new(id, now, StatusCode::Good, Some(ResponsePayload::Pong)),
            RequestType::Browse => Response::new(
                id,
                now,
                StatusCode::Good,
                Some(ResponsePayload::Signals(self.gateway.browse())),
            ),
            RequestType::Read { signal } => {
                let sample = self.gateway.read(&signal);
                Response::new(id, now, sample.status, Some(ResponsePayload::Sample(sample)))
            }
            RequestType::Write { signal, value } => {
                let outcome = self.gateway.write(&signal, value);
                Response::new(id, now, outcome.status, None)
                    .with_message(outcome.message.clone())
                    .with_payload(ResponsePayload::Write(outcome))
            }
            RequestType::DashboardWrite { signal, value } => {
                let outcome = self.gateway.write_json(&signal, &value);
                Response::new(id, now, outcome.status, None)
                    .with_message(outcome.message.clone())
                    .with_payload(ResponsePayload::Write(outcome))
            }
            RequestType::HistoryRead {
                signal,
                start_time,
                end_time,
                max_count,
            } => {
                let result = self.gateway.query_history(&signal, start_time, end_time, max_count);
                Response::new(id, now, result.status, Some(ResponsePayload::History(result.samples)))
            }
            RequestType::HistoryAll {
                start_time,
                end_time,
                max_count,
            } => Response::new(
                id,
                now,
                StatusCode::Good,
                Some(ResponsePayload::HistoryAll(
                    self.gateway.query_all_history(start_time, end_time, max_count),
                )),
            ),
            RequestType::Subscribe {
                signal,
                sampling_interval_ms,
                queue_depth,
                discard_oldest,
            } => {
                let params = SubscriptionParams {
                    sampling_interval_ms: sampling_interval_ms.unwrap_or(0),
                    queue_depth: queue_depth.unwrap_or(self.default_queue_depth),
                    discard_oldest: discard_oldest.unwrap_or(true),
                };
                self.subscribe(id, now, &signal, params)
            }
            RequestType::Unsubscribe { subscription_id } => {
                // A subscription reaped by the hub is gone even if this
                // session still tracks its forwarder.
                let released = self
                    .subscriptions
                    .remove(&subscription_id)
                    .map(|task| {
                        task.abort();
                        self.gateway.unsubscribe(subscription_id)
                    })
                    .unwrap_or(false);
                let status = if released {
                    StatusCode::Good
                } else {
                    StatusCode::BadSubscriptionIdInvalid
                };
                Response::new(id, now, status, None)
            }
            RequestType::Snapshot => Response::new(
                id,
                now,
                StatusCode::Good,
                Some(ResponsePayload::Snapshot(self.gateway.publish_snapshot())),
            ),
            RequestType::Devices => Response::new(
                id,
                now,
                StatusCode::Good,
                Some(ResponsePayload::Devices(self.gateway.device_snapshot())),
            ),
            RequestType::ResetHistory => {
                self.gateway.reset_history();
                Response::new(id, now, StatusCode::Good, None).with_message("History cleared")
            }
            RequestType::MonitorBridge => {
                if self.bridge_task.is_none() {
                    self.bridge_task = Some(self.forward_bridge());
                }
                Response::new(id, now, StatusCode::Good, None).with_message("Streaming bridge messages")
            }
        }
    }

    fn subscribe(&mut self, id: u32, now: u64, signal: &str, params: SubscriptionParams) -> Response {
        let handle = match self.gateway.subscribe(signal, params) {
            Ok(handle) => handle,
            Err(e) => {
                return Response::new(id, now, StatusCode::BadNodeIdUnknown, None).with_message(e.to_string());
            }
        };
        let granted = handle.params();
        let subscription_id = handle.id();
        let signal = handle.signal();
        let outbound = self.outbound.clone();

        let task = tokio::spawn(async move {
            while let Some(notification) = handle.next().await {
                if outbound.send(ServerMessage::Notification(notification)).await.is_err() {
                    break;
                }
            }
        });
        self.subscriptions.insert(subscription_id, task);

        Response::new(
            id,
            now,
            StatusCode::Good,
            Some(ResponsePayload::Subscription {
                subscription_id,
                signal,
                sampling_interval_ms: granted.sampling_interval_ms,
                queue_depth: granted.queue_depth,
                discard_oldest: granted.discard_oldest,
            }),
        )
    }

    fn forward_bridge(&self) -> JoinHandle<()> {
        let mut messages = self.bridge.subscribe();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        if outbound.send(ServerMessage::Published(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Bridge listener lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Releases every subscription this connection owns.
    pub fn close(&mut self) {
        for (subscription_id, task) in self.subscriptions.drain() {
            self.gateway.unsubscribe(subscription_id);
            task.abort();
        }
        if let Some(task) = self.bridge_task.take() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

pub async fn serve(
    listener: TcpListener,
    gateway: AccessGateway,
    bridge: broadcast::Sender<PublishedMessage>,
    default_queue_depth: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("TCP server listening on {}", addr),
        Err(e) => warn!("TCP server listening on unknown address: {}", e),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New client connected: {}", addr);
                    let gateway = gateway.clone();
                    let bridge = bridge.clone();
                    let client_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let result =
                            handle_client(stream, addr, gateway, bridge, default_queue_depth, client_shutdown).await;
                        if let Err(e) = result {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("Client {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("TCP server stopped");
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: AccessGateway,
    bridge: broadcast::Sender<PublishedMessage>,
    default_queue_depth: usize,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BoundedLines::new(BufReader::new(reader), MAX_REQUEST_SIZE);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);
    let mut session = Session::new(gateway, outbound_tx.clone(), bridge, default_queue_depth);

    let encoder = ProtocolHandler::new();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let line = match encoder.encode(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode message for {}: {}", addr, e);
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() || writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(inbound)) => {
                    let response = match inbound {
                        InboundLine::Line(line) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            session.handle_line(trimmed)
                        }
                        InboundLine::TooLong => session.reject_oversized(),
                    };
                    if outbound_tx.send(ServerMessage::Response(response)).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
        }
    };

    // Dropping the session and our sender lets the writer drain and exit.
    drop(session);
    drop(outbound_tx);
    let _ = writer_task.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8], limit: usize) -> Vec<InboundLine> {
        let mut lines = BoundedLines::new(input, limit);
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_bounded_lines_split_and_limit() {
        let input = b"ping\r\n0123456789abcdef\nok\nlast";
        assert_eq!(
            collect(input, 8).await,
            vec![
                InboundLine::Line("ping\r".to_string()),
                InboundLine::TooLong,
                InboundLine::Line("ok".to_string()),
                InboundLine::Line("last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_bounded_lines_exact_limit_is_accepted() {
        assert_eq!(
            collect(b"12345678\n123456789\n", 8).await,
            vec![InboundLine::Line("12345678".to_string()), InboundLine::TooLong]
        );
    }

    #[tokio::test]
    async fn test_bounded_lines_unterminated_overflow_at_eof() {
        assert_eq!(collect(&[b'x'; 100], 8).await, vec![InboundLine::TooLong]);
        assert!(collect(b"", 8).await.is_empty());
    }
}
