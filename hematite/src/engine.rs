//! The I/O driver for one peer: owns the socket, the transport, and a
//! connection, and pushes bytes between them. The protocol engine
//! itself never blocks and never reads the clock; this loop feeds it,
//! flushes it after every event, and sends heartbeat frames when the
//! peer asked for an idle timeout.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::connection::{Connection, ConnectionError, ConnectionOptions};
use crate::sasl::{SaslClient, SaslError, SaslProfile};
use crate::trace::Trace;
use crate::transport::{Transport, TransportError};

/// Engine-level failures: the protocol errors underneath plus the
/// socket itself
#[derive(Debug, Error)]
pub enum EngineError {
    /// Socket failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Transport or protocol failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Connection-level failure outside the transport path
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// SASL exchange failure
    #[error(transparent)]
    Sasl(#[from] SaslError),

    /// The connection reached Closed while waiting for something else
    #[error("connection closed")]
    Closed,

    /// The peer hung up without a Close
    #[error("peer disconnected")]
    Disconnected,
}

/// A connected client engine
#[derive(Debug)]
pub struct Engine {
    stream: TcpStream,
    transport: Transport,
    /// The protocol state machine this engine drives
    pub connection: Connection,
    buf: Vec<u8>,
}

impl Engine {
    /// Connects, exchanges headers and Opens, and returns once the
    /// connection is fully opened
    pub async fn connect(
        addr: impl ToSocketAddrs,
        options: ConnectionOptions,
    ) -> Result<Self, EngineError> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, options).await
    }

    /// Connects through a SASL exchange first; an outcome other than
    /// ok surfaces as `authentication failed: N`
    pub async fn connect_with_sasl(
        addr: impl ToSocketAddrs,
        options: ConnectionOptions,
        profile: SaslProfile,
    ) -> Result<Self, EngineError> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut sasl = SaslClient::new(profile);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let bytes = sasl.take_output();
            if !bytes.is_empty() {
                stream.write_all(&bytes).await?;
            }
            if sasl.is_done() {
                break;
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(EngineError::Disconnected);
            }
            sasl.feed(&buf[..n])?;
        }
        Self::handshake(stream, options).await
    }

    async fn handshake(
        stream: TcpStream,
        options: ConnectionOptions,
    ) -> Result<Self, EngineError> {
        let _ = stream.set_nodelay(true);
        let id = format!("cli-{}", &options.container_id);
        let mut engine = Self {
            stream,
            transport: Transport::new(id, Trace::from_env()),
            connection: Connection::new(options),
            buf: vec![0u8; 64 * 1024],
        };
        engine.connection.open()?;
        engine.wait(|conn| conn.opened()).await?;
        Ok(engine)
    }

    /// Flushes pending output to the socket
    pub async fn flush(&mut self) -> Result<(), EngineError> {
        let bytes = self.transport.flush(&mut self.connection);
        if !bytes.is_empty() {
            self.stream.write_all(&bytes).await?;
        }
        Ok(())
    }

    /// Flushes, then reads and processes socket input until `pred`
    /// holds on the connection
    pub async fn wait<F>(&mut self, pred: F) -> Result<(), EngineError>
    where
        F: Fn(&Connection) -> bool,
    {
        let keepalive = self
            .connection
            .remote_open
            .as_ref()
            .and_then(|open| open.idle_time_out)
            .map(|ms| Duration::from_millis(u64::from(ms) / 2).max(Duration::from_millis(1)));

        loop {
            self.flush().await?;
            if pred(&self.connection) {
                return Ok(());
            }
            if self.connection.closed() {
                return Err(EngineError::Closed);
            }

            let n = match keepalive {
                Some(period) => {
                    match tokio::time::timeout(period, self.stream.read(&mut self.buf)).await {
                        Ok(read) => read?,
                        Err(_elapsed) => {
                            // keep the peer's idle timer from firing
                            self.connection.post_empty();
                            continue;
                        }
                    }
                }
                None => self.stream.read(&mut self.buf).await?,
            };
            if n == 0 {
                return Err(EngineError::Disconnected);
            }
            let chunk = self.buf[..n].to_vec();
            self.transport.feed(&chunk, &mut self.connection)?;
        }
    }

    /// One flush-read-feed cycle, for callers pumping by hand
    pub async fn step(&mut self) -> Result<(), EngineError> {
        self.flush().await?;
        let n = self.stream.read(&mut self.buf).await?;
        if n == 0 {
            return Err(EngineError::Disconnected);
        }
        let chunk = self.buf[..n].to_vec();
        self.transport.feed(&chunk, &mut self.connection)?;
        self.flush().await
    }

    /// Runs the close handshake to completion
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if !self.connection.closed() {
            self.connection.close(None)?;
            match self.wait(|conn| conn.closed()).await {
                Ok(()) | Err(EngineError::Closed) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}
