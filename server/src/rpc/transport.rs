//! Transports carrying requests to the score database.

use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use shared::rpc::{encode_length_prefixed, Frame, Request, MAX_FRAME_LEN};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use super::client::RpcTransport;
use super::error::RpcError;
use super::future::{Reply, Resolver};

/// Reads one length-prefixed [`Frame`] from a stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes one length-prefixed [`Frame`] to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let body = serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encode_length_prefixed(&body)).await?;
    writer.flush().await
}

/// Settles every call immediately with a transport error. Used when the
/// server runs without a database; durable work ends up in the fallback log.
#[derive(Debug, Default)]
pub struct OfflineTransport;

impl RpcTransport for OfflineTransport {
    fn issue(&self, request: Request) -> oneshot::Receiver<Reply> {
        let (resolver, receiver) = oneshot::channel();
        debug!("Offline, failing {} call", request.verb());
        let _ = resolver.send(Err(RpcError::Transport("offline".to_string())));
        receiver
    }
}

type Call = (Request, Resolver);

enum Event {
    Call(Option<Call>),
    Reply(Option<Frame>),
}

/// Multiplexes calls over a single TCP connection to the database.
///
/// A background task owns the connection. It connects lazily on the first
/// call and again on the next call after the connection was lost. Calls
/// outstanding on a lost connection settle with a transport error; they are
/// never resent.
pub struct TcpTransport {
    calls: mpsc::UnboundedSender<Call>,
}

impl TcpTransport {
    /// Spawns the connection task. Must be called from within a tokio runtime.
    pub fn spawn(addr: &str) -> Self {
        let (calls, calls_rx) = mpsc::unbounded_channel();
        let addr = addr.to_string();
        tokio::spawn(async move {
            run_connection_loop(addr, calls_rx).await;
        });
        Self { calls }
    }
}

impl RpcTransport for TcpTransport {
    fn issue(&self, request: Request) -> oneshot::Receiver<Reply> {
        let (resolver, receiver) = oneshot::channel();
        if let Err(mpsc::error::SendError((request, _resolver))) =
            self.calls.send((request, resolver))
        {
            warn!("Database task is gone, dropping {} call", request.verb());
        }
        receiver
    }
}

async fn run_connection_loop(addr: String, mut calls_rx: mpsc::UnboundedReceiver<Call>) {
    let mut next_id = 0u64;

    while let Some((request, resolver)) = calls_rx.recv().await {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to database at {}: {}", addr, e);
                let _ = resolver.send(Err(RpcError::Transport(e.to_string())));
                continue;
            }
        };
        info!("Connected to database at {}", addr);

        let (mut reader, mut writer) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        if reply_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Database read loop ended: {}", e);
                        break;
                    }
                }
            }
        });

        let mut outstanding: HashMap<u64, Resolver> = HashMap::new();
        let mut next_call = Some((request, resolver));
        let mut shutting_down = false;

        let reason = loop {
            if let Some((request, resolver)) = next_call.take() {
                let id = next_id;
                next_id += 1;
                let verb = request.verb();
                match write_frame(&mut writer, &Frame::Call { id, request }).await {
                    Ok(()) => {
                        debug!("Sent {} call {}", verb, id);
                        outstanding.insert(id, resolver);
                    }
                    Err(e) => {
                        let _ = resolver.send(Err(RpcError::Transport(e.to_string())));
                        break e.to_string();
                    }
                }
            }

            let event = tokio::select! {
                call = calls_rx.recv(), if !shutting_down => Event::Call(call),
                reply = reply_rx.recv() => Event::Reply(reply),
            };

            match event {
                Event::Call(Some(call)) => next_call = Some(call),
                Event::Call(None) => {
                    shutting_down = true;
                    if outstanding.is_empty() {
                        break "transport dropped".to_string();
                    }
                }
                Event::Reply(Some(Frame::Reply { id, result })) => {
                    match outstanding.remove(&id) {
                        Some(resolver) => {
                            let _ = resolver.send(result.map_err(RpcError::from));
                        }
                        None => warn!("Reply for unknown call {}", id),
                    }
                    if shutting_down && outstanding.is_empty() {
                        break "transport dropped".to_string();
                    }
                }
                Event::Reply(Some(Frame::Call { id, .. })) => {
                    warn!("Database sent a call frame ({}), ignoring", id);
                }
                Event::Reply(None) => break "connection closed by database".to_string(),
            }
        };

        read_task.abort();
        if !outstanding.is_empty() {
            warn!(
                "Lost database connection ({}), failing {} outstanding calls",
                reason,
                outstanding.len()
            );
        }
        for (_, resolver) in outstanding.drain() {
            let _ = resolver.send(Err(RpcError::Transport(reason.clone())));
        }
        if shutting_down {
            break;
        }
    }
}
