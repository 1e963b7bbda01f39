//! The buffered TCP sink.
//!
//! The [`Sink`] accumulates newline terminated records into a byte buffer and
//! writes that buffer to its connection when it grows past a threshold or a
//! flush period elapses. Failed connects and failed writes spend a shared
//! retry budget. Once the budget is gone the sink stops with
//! [`Error::RetriesExhausted`].
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes sent successfully
//! `request_failure`: Number of failed writes; each occurrence causes a reconnect
//! `connection_failure`: Number of connection failures
//!

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use byte_unit::Byte;
use bytes::BytesMut;
use datagen_signal::Watcher;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::{TcpSocket, TcpStream, lookup_host},
    sync::{mpsc, watch},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

fn default_server() -> String {
    "telegraf".to_string()
}

fn default_port() -> u16 {
    8094
}

fn default_connection_max_retries() -> u32 {
    3
}

fn default_retry_delay_millis() -> u64 {
    1_000
}

fn default_sender_buffer_size() -> usize {
    1_000
}

fn default_connection_buffer_size() -> Byte {
    Byte::from_u64(1_000)
}

fn default_connection_flush_period_millis() -> u64 {
    1_000
}

fn default_debug() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the [`Sink`].
pub struct Config {
    /// Host name or address of the collector
    #[serde(default = "default_server")]
    pub server: String,
    /// TCP port of the collector
    #[serde(default = "default_port")]
    pub port: u16,
    /// Failed connects and writes tolerated over the life of the sink
    #[serde(default = "default_connection_max_retries")]
    pub connection_max_retries: u32,
    /// Pause between two connection attempts
    #[serde(default = "default_retry_delay_millis")]
    pub retry_delay_millis: u64,
    /// Capacity of the sink's input queue, in records
    #[serde(default = "default_sender_buffer_size")]
    pub sender_buffer_size: usize,
    /// Buffered bytes that trigger an immediate flush
    #[serde(default = "default_connection_buffer_size")]
    pub connection_buffer_size: Byte,
    /// Period of the flush timer
    #[serde(default = "default_connection_flush_period_millis")]
    pub connection_flush_period_millis: u64,
    /// Print records locally instead of sending them
    #[serde(default = "default_debug")]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
            connection_max_retries: default_connection_max_retries(),
            retry_delay_millis: default_retry_delay_millis(),
            sender_buffer_size: default_sender_buffer_size(),
            connection_buffer_size: default_connection_buffer_size(),
            connection_flush_period_millis: default_connection_flush_period_millis(),
            debug: default_debug(),
        }
    }
}

impl Config {
    /// The `host:port` address of the collector.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Check the configuration for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the input queue has no capacity, the flush period
    /// is zero or the buffer threshold does not fit in memory.
    pub fn valid(&self) -> Result<(), Error> {
        if self.sender_buffer_size == 0 || self.connection_flush_period_millis == 0 {
            return Err(Error::Zero);
        }
        self.threshold()?;
        Ok(())
    }

    fn threshold(&self) -> Result<usize, Error> {
        usize::try_from(self.connection_buffer_size.as_u64())
            .map_err(|_| Error::Threshold(self.connection_buffer_size))
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Sink`].
pub enum Error {
    /// The retry budget is spent
    #[error("Connection retries exhausted after {retries} attempts")]
    RetriesExhausted {
        /// Retries spent, connects and writes combined
        retries: u32,
    },
    /// Zero value error
    #[error("sender_buffer_size and connection_flush_period_millis cannot be zero")]
    Zero,
    /// Threshold does not fit in memory
    #[error("connection_buffer_size {0} is too large")]
    Threshold(Byte),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of the sink's connection.
pub enum State {
    /// No connection, either not yet opened or closed on shutdown
    Stopped,
    /// A connection attempt is in flight
    Connecting,
    /// The connection is open
    Connected,
}

/// Opens the connection a [`Sink`] writes to.
#[async_trait]
pub trait Connect: fmt::Display + fmt::Debug + Send {
    /// The stream produced by a successful connect
    type Stream: AsyncWrite + Unpin + Send + fmt::Debug;

    /// Attempt a single connection.
    async fn connect(&mut self) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone)]
/// Connects to a TCP collector with keep-alive enabled.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Create a new [`TcpConnector`] for a `host:port` address.
    #[must_use]
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

impl fmt::Display for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

#[async_trait]
impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(self.addr.as_str()).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(true)?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {}", self.addr),
            )
        }))
    }
}

/// Buffer, connection and retry budget of a [`Sink`].
#[derive(Debug)]
struct Writer<C>
where
    C: Connect,
{
    connector: C,
    connection: Option<C::Stream>,
    retries: u32,
    max_retries: u32,
    retry_delay: Duration,
    buffer: BytesMut,
    threshold: usize,
    bytes_sent: Arc<AtomicU64>,
    state: watch::Sender<State>,
    closed: bool,
}

impl<C> Writer<C>
where
    C: Connect,
{
    fn new(connector: C, config: &Config, threshold: usize) -> Self {
        let (state, _) = watch::channel(State::Stopped);
        Self {
            connector,
            connection: None,
            retries: 0,
            max_retries: config.connection_max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_millis),
            buffer: BytesMut::with_capacity(threshold),
            threshold,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            state,
            closed: false,
        }
    }

    /// Count one failure against the retry budget.
    fn spend(&mut self) -> Result<(), Error> {
        self.retries = self.retries.saturating_add(1);
        if self.retries >= self.max_retries {
            error!(
                "Giving up on {} after {} retries.",
                self.connector, self.retries
            );
            self.connection = None;
            self.state.send_replace(State::Stopped);
            return Err(Error::RetriesExhausted {
                retries: self.retries,
            });
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.state.send_replace(State::Connecting);
        loop {
            match self.connector.connect().await {
                Ok(stream) => {
                    info!("Connected to {}.", self.connector);
                    self.connection = Some(stream);
                    self.state.send_replace(State::Connected);
                    return Ok(());
                }
                Err(source) => {
                    warn!("Failed to connect to {}: {source}", self.connector);
                    counter!("connection_failure").increment(1);
                    self.spend()?;
                    time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Write the whole buffer, reconnecting on failure. An empty buffer is
    /// not written.
    async fn send(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        loop {
            if self.connection.is_none() {
                self.connect().await?;
            }
            let Some(stream) = self.connection.as_mut() else {
                continue;
            };
            match write(stream, &self.buffer).await {
                Ok(()) => {
                    let sent = self.buffer.len() as u64;
                    trace!("Flushed {sent} bytes.");
                    self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
                    counter!("bytes_written").increment(sent);
                    self.buffer.clear();
                    return Ok(());
                }
                Err(err) => {
                    warn!("Write to {} failed, reconnecting: {err}", self.connector);
                    counter!("request_failure").increment(1);
                    self.connection = None;
                    self.spend()?;
                }
            }
        }
    }

    async fn push(&mut self, record: &str) -> Result<(), Error> {
        self.buffer.extend_from_slice(record.as_bytes());
        self.buffer.extend_from_slice(b"\n");
        if self.buffer.len() >= self.threshold {
            self.send().await?;
        }
        Ok(())
    }

    /// Flush, close the connection and move to [`State::Stopped`]. A second
    /// call does nothing.
    async fn shutdown(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.send().await?;
        if let Some(mut stream) = self.connection.take() {
            if let Err(err) = stream.shutdown().await {
                debug!("Closing connection to {} failed: {err}", self.connector);
            }
        }
        self.closed = true;
        self.state.send_replace(State::Stopped);
        info!(
            "Sink stopped, {} bytes sent.",
            self.bytes_sent.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

async fn write<S>(stream: &mut S, buf: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(buf).await?;
    stream.flush().await
}

#[derive(Debug)]
/// The buffered sink.
pub struct Sink<C = TcpConnector>
where
    C: Connect,
{
    writer: Writer<C>,
    input: mpsc::Receiver<String>,
    shutdown: Watcher,
    flush_period: Duration,
}

impl Sink<TcpConnector> {
    /// Create a new TCP [`Sink`] and the sending end of its input queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: &Config,
        shutdown: Watcher,
    ) -> Result<(Self, mpsc::Sender<String>), Error> {
        Self::with_connector(TcpConnector::new(config.addr()), config, shutdown)
    }
}

impl<C> Sink<C>
where
    C: Connect,
{
    /// Create a new [`Sink`] writing to connections opened by `connector`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_connector(
        connector: C,
        config: &Config,
        shutdown: Watcher,
    ) -> Result<(Self, mpsc::Sender<String>), Error> {
        config.valid()?;
        let threshold = config.threshold()?;
        let (input_tx, input) = mpsc::channel(config.sender_buffer_size);
        let sink = Self {
            writer: Writer::new(connector, config, threshold),
            input,
            shutdown,
            flush_period: Duration::from_millis(config.connection_flush_period_millis),
        };
        Ok((sink, input_tx))
    }

    /// Open the connection, retrying until the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] if no connection could be made.
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.writer.connect().await
    }

    /// Observe the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<State> {
        self.writer.state.subscribe()
    }

    /// Shared counter of bytes flushed to the connection.
    #[must_use]
    pub fn bytes_sent(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.writer.bytes_sent)
    }

    /// Retries spent so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.writer.retries
    }

    /// Run [`Sink`] until a shutdown signal is received.
    ///
    /// On shutdown every record still queued is written before the connection
    /// is closed. If the input queue closes first the buffer is flushed and the
    /// sink idles until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] when the retry budget is spent.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            mut writer,
            mut input,
            mut shutdown,
            flush_period,
        } = self;

        let mut flush = time::interval_at(Instant::now() + flush_period, flush_period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut input_open = true;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    input.close();
                    while let Some(record) = input.recv().await {
                        writer.push(&record).await?;
                    }
                    return writer.shutdown().await;
                }
                _ = flush.tick() => writer.send().await?,
                record = input.recv(), if input_open => match record {
                    Some(record) => writer.push(&record).await?,
                    None => {
                        debug!("Input queue closed, flushing.");
                        input_open = false;
                        writer.send().await?;
                    }
                },
            }
        }
    }
}
