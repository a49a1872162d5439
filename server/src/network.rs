//! Server network layer: TCP accept loop plus one reader and one writer task
//! per connection.
//!
//! The reader cuts the byte stream into frames and dispatches each one
//! through the registry; it never runs game logic itself. The writer drains
//! the owner's outbound queue. A malformed frame closes the connection, since
//! a byte stream cannot be resynchronized after a bad length.

use crate::client_manager::Owner;
use crate::error::{Result, ServerError};
use crate::kernel::Context;
use crate::registry::MessageRegistry;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use shared::{Disconnected, FrameDecoder, WireMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accepts connections and spawns their reader/writer tasks.
pub struct NetworkServer {
    listener: TcpListener,
    ctx: Context,
    registry: Arc<MessageRegistry>,
}

impl NetworkServer {
    pub async fn bind(addr: &str, ctx: Context, registry: Arc<MessageRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            ctx,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr).await,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Network server no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    async fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        let admitted = self.ctx.clients().write().await.add_client(addr);

        match admitted {
            Some((owner, outbound)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle for {}: {}", addr, e);
                }
                tokio::spawn(serve_connection(
                    stream,
                    owner,
                    outbound,
                    self.ctx.clone(),
                    Arc::clone(&self.registry),
                ));
            }
            None => {
                self.ctx.monitor().connection_rejected();
                warn!("Rejecting connection from {}: server full", addr);
                let refusal = Disconnected {
                    reason: "server full".to_string(),
                };
                if let Ok(frame) = refusal.encode() {
                    let _ = stream.write_all(&frame).await;
                }
            }
        }
    }
}

/// Runs one connection to completion: reader on this task, writer on its own.
///
/// On return the owner is closed and removed from the connection table.
pub async fn serve_connection<S>(
    stream: S,
    owner: Owner,
    outbound: mpsc::Receiver<Bytes>,
    ctx: Context,
    registry: Arc<MessageRegistry>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    ctx.monitor().connection_opened();
    let (reader, writer) = tokio::io::split(stream);

    let writer_task = {
        let owner = owner.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = write_frames(writer, &owner, outbound, &ctx).await {
                debug!("Writer for client {} stopped: {}", owner.id(), e);
            }
            owner.close();
        })
    };

    match read_frames(reader, &owner, &ctx, &registry).await {
        Ok(()) => debug!("Client {} stream ended", owner.id()),
        Err(e) => warn!("Closing client {}: {}", owner.id(), e),
    }

    ctx.disconnect(owner.id()).await;
    owner.close();
    if let Err(e) = writer_task.await {
        error!("Writer task for client {} panicked: {}", owner.id(), e);
    }
    ctx.monitor().connection_closed();
}

/// Reads frames until end of stream, owner close, or a fatal error.
///
/// Unknown message types and full queues are logged and skipped; malformed
/// frames and I/O errors end the loop with an error.
pub async fn read_frames<R>(
    mut reader: R,
    owner: &Owner,
    ctx: &Context,
    registry: &MessageRegistry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            read = reader.read_buf(decoder.buffer_mut()) => {
                if read? == 0 {
                    if decoder.buffered() > 0 {
                        debug!(
                            "Client {} closed mid-frame with {} bytes buffered",
                            owner.id(),
                            decoder.buffered()
                        );
                    }
                    return Ok(());
                }

                loop {
                    let frame = match decoder.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            ctx.monitor().malformed_frame();
                            return Err(e.into());
                        }
                    };

                    owner.touch();
                    ctx.monitor().frame_received(frame.length() as usize);
                    trace!("Client {} sent type {}", owner.id(), frame.type_id);

                    match registry.dispatch_frame(&frame, owner, ctx).await {
                        Ok(_) | Err(ServerError::UnknownMessageType(_)) => {}
                        Err(e @ ServerError::MalformedFrame(_)) => {
                            ctx.monitor().malformed_frame();
                            return Err(e);
                        }
                        Err(e) if e.is_fatal_to_connection() => return Err(e),
                        Err(e) => debug!("Client {} frame not processed: {}", owner.id(), e),
                    }
                }
            }
            _ = owner.closed() => return Ok(()),
        }
    }
}

/// Drains the outbound queue to the stream. After the owner closes, frames
/// already queued are still written before the stream is shut down.
pub async fn write_frames<W>(
    mut writer: W,
    owner: &Owner,
    mut outbound: mpsc::Receiver<Bytes>,
    ctx: &Context,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    writer.write_all(&frame).await?;
                    ctx.monitor().frame_sent(frame.len());
                }
                None => break,
            },
            _ = owner.closed() => {
                while let Ok(frame) = outbound.try_recv() {
                    writer.write_all(&frame).await?;
                    ctx.monitor().frame_sent(frame.len());
                }
                break;
            }
        }
    }

    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}
