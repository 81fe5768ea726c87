//! Duplex bridging between one client connection and one backing process.
//!
//! TCP sockets and WebSockets expose the same three capabilities (send a
//! line, receive inbound data, close) behind the `Transport` trait, so the
//! bridging loop itself is transport-agnostic.
//!
//! The protocol is line-oriented: process stdout is consumed per line (the
//! served program is expected to flush after each newline; partial chunks
//! are held until the newline arrives), re-terminated `\r\n`, and written to
//! the client. Inbound client data is trimmed and re-terminated `\r\n` on
//! its way to process stdin. Stderr output is fatal for the process, as is
//! any transport write failure or client disconnect.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use axum::extract::ws::{Message, WebSocket};

use crate::process::{ProcessManager, SpawnedProcess};
use crate::service::ServiceDefinition;

/// One inbound event from a client connection.
pub enum InboundEvent {
    Data(String),
    Closed,
    Error(String),
}

/// The capabilities a transport must offer the bridge.
pub trait Transport {
    async fn send_line(&mut self, line: &str) -> Result<(), String>;
    async fn recv(&mut self) -> InboundEvent;
    async fn close(&mut self);
}

pub struct TcpTransport {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    buf: Vec<u8>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            read,
            write,
            buf: vec![0u8; 4096],
        }
    }
}

impl Transport for TcpTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), String> {
        self.write
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| e.to_string())
    }

    async fn recv(&mut self) -> InboundEvent {
        match self.read.read(&mut self.buf).await {
            Ok(0) => InboundEvent::Closed,
            Ok(n) => InboundEvent::Data(String::from_utf8_lossy(&self.buf[..n]).to_string()),
            Err(e) => InboundEvent::Error(e.to_string()),
        }
    }

    async fn close(&mut self) {
        let _ = self.write.shutdown().await;
    }
}

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WsTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), String> {
        self.socket
            .send(Message::Text(format!("{}\r\n", line).into()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn recv(&mut self) -> InboundEvent {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return InboundEvent::Data(text.to_string()),
                Some(Ok(Message::Binary(data))) => {
                    return InboundEvent::Data(String::from_utf8_lossy(&data).to_string())
                }
                Some(Ok(Message::Close(_))) | None => return InboundEvent::Closed,
                Some(Ok(_)) => continue, // ping/pong handled by axum
                Some(Err(e)) => return InboundEvent::Error(e.to_string()),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// Wire one client connection to one backing process for its lifetime.
pub async fn run_bridge<T: Transport>(
    mut transport: T,
    spawned: SpawnedProcess,
    manager: Arc<ProcessManager>,
) {
    let proc = spawned.proc;
    let mut stdout = LinesStream::new(BufReader::new(spawned.stdout).lines());
    let mut stderr = spawned.stderr;
    let mut stderr_open = true;
    let mut errbuf = [0u8; 4096];
    let mut exit_rx = proc.exit_rx();

    loop {
        tokio::select! {
            // process stdout -> client
            line = stdout.next() => match line {
                Some(Ok(line)) => {
                    proc.log_server(&line);
                    if let Err(e) = transport.send_line(&line).await {
                        manager.kill(&proc, Some(&format!("failed to write to socket: {}", e)));
                        transport.close().await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    manager.kill(&proc, Some(&e.to_string()));
                    transport.close().await;
                    break;
                }
                // stdout closed: the process is gone
                None => {
                    transport.close().await;
                    manager.teardown(&proc, None);
                    break;
                }
            },
            // any stderr output is fatal for the process
            n = stderr.read(&mut errbuf), if stderr_open => match n {
                Ok(0) | Err(_) => stderr_open = false,
                Ok(n) => {
                    let msg = String::from_utf8_lossy(&errbuf[..n]).to_string();
                    manager.kill(&proc, Some(&msg));
                    transport.close().await;
                    break;
                }
            },
            // client -> process stdin
            event = transport.recv() => match event {
                InboundEvent::Data(data) => {
                    let data = data.trim();
                    if !data.is_empty() {
                        if let Err(e) = proc.write_line(data).await {
                            manager.kill(&proc, Some(&e));
                            transport.close().await;
                            break;
                        }
                    }
                }
                InboundEvent::Closed => {
                    manager.kill(&proc, None);
                    break;
                }
                InboundEvent::Error(e) => {
                    transport.close().await;
                    manager.kill(&proc, Some(&e));
                    break;
                }
            },
            _ = exit_rx.changed() => {
                transport.close().await;
                manager.teardown(&proc, None);
                break;
            }
        }
    }
}

/// Accept loop for one TCP service: each connection gets its own process.
pub async fn serve_tcp(
    listener: TcpListener,
    def: Arc<ServiceDefinition>,
    manager: Arc<ProcessManager>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(port = def.port, "tcp accept failed: {}", e);
                continue;
            }
        };
        let def = def.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            match manager.spawn(&def, &peer.ip().to_string()) {
                Ok(spawned) => run_bridge(TcpTransport::new(stream), spawned, manager).await,
                Err(e) => {
                    tracing::error!(route = %def.route, port = def.port, "{}", e);
                }
            }
        });
    }
}
