//! TCP transport for the RPC surface.
//!
//! Each message is a 4-byte big-endian length followed by a JSON body. A
//! connection may carry any number of request/reply pairs. Every accepted
//! connection is served on its own task, so a slow client never holds up the
//! others.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::rpc::{Request, Response, RpcService};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<BytesMut>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }

    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Accept connections until `shutdown_rx` fires.
pub async fn serve(
    listener: TcpListener,
    service: Arc<RpcService>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "rpc server listening"),
        Err(e) => warn!(error = %e, "rpc server listening on unknown address"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, service).await {
                            warn!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            },
            _ = &mut shutdown_rx => {
                info!("rpc server received shutdown signal");
                break;
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    service: Arc<RpcService>,
) -> Result<(), RpcError> {
    while let Some(body) = read_frame(&mut stream).await? {
        let response = service.handle(peer.ip(), &body).await;
        let encoded =
            serde_json::to_vec(&response).map_err(|e| RpcError::Malformed(e.to_string()))?;
        write_frame(&mut stream, &encoded).await?;
    }
    debug!(%peer, "connection closed");
    Ok(())
}

/// Minimal client speaking the same framing.
pub struct RpcClient {
    stream: TcpStream,
}

impl RpcClient {
    /// Connect to a running daemon.
    pub async fn connect(addr: SocketAddr) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    /// Send one request and wait for its reply.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Response, RpcError> {
        let body = serde_json::to_vec(&Request::new(method, params))
            .map_err(|e| RpcError::Malformed(e.to_string()))?;
        write_frame(&mut self.stream, &body).await?;

        let reply = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| RpcError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
        serde_json::from_slice(&reply).map_err(|e| RpcError::Malformed(e.to_string()))
    }
}
