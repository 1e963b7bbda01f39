//! Wiring between the producer and the sink.
//!
//! The [`Coordinator`] starts the [`Producer`] and, unless records are only
//! printed, the [`Sink`] as independent tasks. It forwards records between
//! their queues, reports throughput on a timer and stops both tasks in order:
//! the producer first, then whatever it left in the queue is handed over, then
//! the sink is told to flush and close.
//!
//! ## Metrics
//!
//! `queue_depth`: Records waiting in the producer's output queue
//!

use std::{
    fmt,
    future::Future,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use datagen_signal::Broadcaster;
use metrics::gauge;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    clock, config,
    producer::{self, Producer, Progress},
    sink::{self, Sink, State},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Coordinator`].
pub enum Error {
    /// Producer construction failed
    #[error("Producer error: {0}")]
    Producer(#[from] producer::Error),
    /// Sink construction or operation failed
    #[error("Sink error: {0}")]
    Sink(#[from] sink::Error),
    /// A task could not be joined
    #[error("Child join error: {0}")]
    Join(#[from] JoinError),
    /// Configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    /// Printing records failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit status reporting this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Sink(sink::Error::RetriesExhausted { .. }) => 127,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a [`Coordinator`] run ended.
pub enum Outcome {
    /// The producer exhausted its interval and everything was delivered
    Completed,
    /// Termination was requested by the operator
    Interrupted,
}

impl Outcome {
    /// Process exit status reporting this outcome.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Completed => 0,
            Outcome::Interrupted => 1,
        }
    }
}

/// Writes records to a local stream, one per line.
struct Printer {
    out: Box<dyn AsyncWrite + Unpin + Send>,
}

impl fmt::Debug for Printer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Printer").finish_non_exhaustive()
    }
}

impl Printer {
    async fn print(&mut self, record: &str) -> io::Result<()> {
        self.out.write_all(record.as_bytes()).await?;
        self.out.write_all(b"\n").await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.out.flush().await
    }
}

#[derive(Debug)]
enum Route {
    Forward {
        sink: Sink,
        input: mpsc::Sender<String>,
        shutdown: Broadcaster,
    },
    Print(Printer),
}

/// A running sink as seen from the coordinator.
struct SinkTask {
    handle: JoinHandle<Result<(), sink::Error>>,
    state: watch::Receiver<State>,
    shutdown: Broadcaster,
}

/// Throughput report, computed as deltas between two samples.
struct Stats {
    progress: Arc<Progress>,
    bytes_sent: Option<Arc<AtomicU64>>,
    produced: u64,
    sent: u64,
    at: Instant,
}

impl Stats {
    fn new(progress: Arc<Progress>, bytes_sent: Option<Arc<AtomicU64>>) -> Self {
        Self {
            produced: progress.produced(),
            sent: 0,
            progress,
            bytes_sent,
            at: Instant::now(),
        }
    }

    fn report(&mut self, queue_depth: usize) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.at).as_secs_f64().max(f64::EPSILON);
        let produced = self.progress.produced();
        let sent = self
            .bytes_sent
            .as_ref()
            .map_or(0, |bytes| bytes.load(Ordering::Relaxed));

        info!(
            "Produced: {produced} ({rate:.2}K/s), Sent: {sent_rate:.2}KB/s, Queue: {queue_depth}, timestamp: {timestamp}",
            rate = (produced - self.produced) as f64 / elapsed / 1000.0,
            sent_rate = kib_per_sec(sent - self.sent, elapsed),
            timestamp = clock::display(self.progress.timestamp()),
        );
        gauge!("queue_depth").set(queue_depth as f64);

        self.produced = produced;
        self.sent = sent;
        self.at = now;
    }
}

/// Bytes per second over `elapsed` seconds, in units of 1024 bytes.
fn kib_per_sec(bytes: u64, elapsed: f64) -> f64 {
    bytes as f64 / elapsed / 1024.0
}

/// Why the forwarding loop ended
enum Exit {
    Done(Outcome),
    SinkStopped(Result<Result<(), sink::Error>, JoinError>),
}

#[derive(Debug)]
/// Runs a [`Producer`] into a [`Sink`] or a local printer.
pub struct Coordinator {
    producer: Producer,
    records: mpsc::Receiver<String>,
    producer_shutdown: Broadcaster,
    route: Route,
    stats_period: Duration,
}

impl Coordinator {
    /// Create a new [`Coordinator`]. Records are printed to standard output
    /// when `sender.debug` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the producer or
    /// the sink cannot be built.
    pub fn new(config: &config::Config) -> Result<Self, Error> {
        let stdout = Box::new(BufWriter::new(tokio::io::stdout()));
        Self::with_output(config, stdout)
    }

    /// Create a new [`Coordinator`] printing to `out` in debug mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the producer or
    /// the sink cannot be built.
    pub fn with_output(
        config: &config::Config,
        out: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (producer_watcher, producer_shutdown) = datagen_signal::signal();
        let (producer, records) = Producer::new(&config.generator, producer_watcher)?;

        let route = if config.sender.debug {
            info!("Debug mode, records are printed locally.");
            Route::Print(Printer { out })
        } else {
            let (sink_watcher, shutdown) = datagen_signal::signal();
            let (sink, input) = Sink::new(&config.sender, sink_watcher)?;
            Route::Forward {
                sink,
                input,
                shutdown,
            }
        };

        Ok(Self {
            producer,
            records,
            producer_shutdown,
            route,
            stats_period: config.stats_period(),
        })
    }

    /// A shared handle on the producer's counters.
    #[must_use]
    pub fn progress(&self) -> Arc<Progress> {
        self.producer.progress()
    }

    /// Run until the producer completes or `termination` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot connect, fails while running or
    /// records cannot be printed.
    pub async fn run<F>(self, termination: F) -> Result<Outcome, Error>
    where
        F: Future<Output = ()>,
    {
        let Self {
            producer,
            mut records,
            producer_shutdown,
            route,
            stats_period,
        } = self;

        let (mut printer, input, mut sink_task, bytes_sent) = match route {
            Route::Print(printer) => (Some(printer), None, None, None),
            Route::Forward {
                mut sink,
                input,
                shutdown,
            } => {
                sink.connect().await?;
                let state = sink.state();
                let bytes_sent = sink.bytes_sent();
                let handle = tokio::spawn(sink.spin());
                let task = SinkTask {
                    handle,
                    state,
                    shutdown,
                };
                (None, Some(input), Some(task), Some(bytes_sent))
            }
        };

        let mut stats = Stats::new(producer.progress(), bytes_sent);
        let producer_handle = tokio::spawn(producer.spin());

        let mut ticker = time::interval_at(Instant::now() + stats_period, stats_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Option<String> = None;

        tokio::pin!(termination);
        let exit = loop {
            tokio::select! {
                biased;

                () = &mut termination => {
                    info!("Termination requested.");
                    break Exit::Done(Outcome::Interrupted);
                }
                res = join_sink(sink_task.as_mut()) => break Exit::SinkStopped(res),
                _ = ticker.tick() => stats.report(records.len()),
                permit = reserve(input.as_ref()), if pending.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(record) = pending.take() {
                            permit.send(record);
                        }
                    }
                    Err(_) => {
                        warn!("Sink input closed while forwarding.");
                        let res = match sink_task.take() {
                            Some(task) => task.handle.await,
                            None => Ok(Ok(())),
                        };
                        break Exit::SinkStopped(res);
                    }
                },
                record = records.recv(), if pending.is_none() => match record {
                    Some(record) => match printer.as_mut() {
                        Some(printer) => printer.print(&record).await?,
                        None => pending = Some(record),
                    },
                    None => {
                        info!("Producer finished.");
                        break Exit::Done(Outcome::Completed);
                    }
                },
            }
        };

        // Producer first: once it is stopped its queue closes and every
        // record it pushed is handed over before the sink is stopped.
        producer_shutdown.signal();

        let outcome = match exit {
            Exit::Done(outcome) => outcome,
            Exit::SinkStopped(res) => {
                drop(records);
                producer_handle.await?;
                res?.inspect_err(|err| error!("Sink stopped unexpectedly: {err}"))?;
                warn!("Sink stopped without a shutdown signal.");
                return Ok(Outcome::Interrupted);
            }
        };

        if let Some(record) = pending.take() {
            forward(input.as_ref(), record).await;
        }
        while let Some(record) = records.recv().await {
            match printer.as_mut() {
                Some(printer) => printer.print(&record).await?,
                None => {
                    if !forward(input.as_ref(), record).await {
                        break;
                    }
                }
            }
        }
        producer_handle.await?;
        stats.report(records.len());

        if let Some(mut printer) = printer {
            printer.flush().await?;
        }
        drop(input);
        if let Some(SinkTask {
            handle,
            mut state,
            shutdown,
        }) = sink_task
        {
            // The sink's watcher drops when its spin returns, after the final
            // flush and close.
            shutdown.signal_and_wait().await;
            if *state.borrow_and_update() != State::Stopped {
                debug!("Sink exited before reporting stopped.");
            }
            handle.await??;
        }

        info!("Run finished: {outcome:?}.");
        Ok(outcome)
    }
}

/// Send `record` to the sink, false if the sink is gone.
async fn forward(input: Option<&mpsc::Sender<String>>, record: String) -> bool {
    match input {
        Some(input) => input.send(record).await.is_ok(),
        None => false,
    }
}

async fn reserve(
    input: Option<&mpsc::Sender<String>>,
) -> Result<mpsc::Permit<'_, String>, mpsc::error::SendError<()>> {
    match input {
        Some(input) => input.reserve().await,
        None => std::future::pending().await,
    }
}

async fn join_sink(
    task: Option<&mut SinkTask>,
) -> Result<Result<(), sink::Error>, JoinError> {
    match task {
        Some(task) => (&mut task.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use datagen_payload::catalog;
    use tokio::{
        io::{AsyncReadExt, DuplexStream},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::{Coordinator, Error, Outcome, kib_per_sec};
    use crate::{config::Config, producer, sink};

    const JAN_1_2024: i64 = 1_704_067_200_000_000_000;
    const MINUTE: i64 = 60_000_000_000;

    fn generator(start: Option<&str>, end: Option<&str>, continuous: bool) -> producer::Config {
        producer::Config {
            seed: Some([11; 32]),
            catalog: catalog::Config {
                num_metrics: 3,
                int_ratio: 100,
                float_ratio: 0,
                ..catalog::Config::default()
            },
            metric_buffer_size: 4,
            start: start.map(str::to_string),
            end: end.map(str::to_string),
            step_millis: 60_000,
            continuous,
        }
    }

    fn debug_config(generator: producer::Config) -> Config {
        Config {
            generator,
            sender: sink::Config {
                debug: true,
                ..sink::Config::default()
            },
            stats_period_seconds: 60,
        }
    }

    fn tcp_config(generator: producer::Config, port: u16) -> Config {
        Config {
            generator,
            sender: sink::Config {
                server: "127.0.0.1".to_string(),
                port,
                retry_delay_millis: 1,
                sender_buffer_size: 2,
                debug: false,
                ..sink::Config::default()
            },
            stats_period_seconds: 60,
        }
    }

    async fn printed(config: &Config) -> (Result<Outcome, Error>, String) {
        let (out, mut read): (DuplexStream, DuplexStream) = tokio::io::duplex(1 << 20);
        let coordinator =
            Coordinator::with_output(config, Box::new(out)).expect("valid coordinator config");
        let res = coordinator.run(std::future::pending()).await;
        let mut text = String::new();
        read.read_to_string(&mut text)
            .await
            .expect("printer output is readable");
        (res, text)
    }

    /// Accept a single connection and read it until the peer closes.
    async fn collector() -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let port = listener.local_addr().expect("bound address").port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept sink");
            let mut text = String::new();
            stream
                .read_to_string(&mut text)
                .await
                .expect("read sink stream");
            text
        });
        (port, handle)
    }

    #[tokio::test]
    async fn batch_prints_every_record() {
        let config = debug_config(generator(
            Some("2024-01-01 00:00:00"),
            Some("2024-01-01 00:02:00"),
            false,
        ));
        let (res, text) = printed(&config).await;

        assert_eq!(res.expect("run succeeds"), Outcome::Completed);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|l| l.starts_with("int.")));
        assert!(lines[..3].iter().all(|l| l.ends_with(&format!(" {JAN_1_2024}"))));
        assert!(
            lines[3..]
                .iter()
                .all(|l| l.ends_with(&format!(" {}", JAN_1_2024 + MINUTE)))
        );
    }

    #[tokio::test]
    async fn empty_interval_completes_without_records() {
        let config = debug_config(generator(Some("2024-01-01"), Some("2024-01-01"), false));
        let (res, text) = printed(&config).await;

        assert_eq!(res.expect("run succeeds"), Outcome::Completed);
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn batch_delivers_every_record_over_tcp() {
        let (port, server) = collector().await;
        let config = tcp_config(
            generator(
                Some("2024-01-01 00:00:00"),
                Some("2024-01-01 01:00:00"),
                false,
            ),
            port,
        );
        let coordinator = Coordinator::new(&config).expect("valid coordinator config");
        let progress = coordinator.progress();

        let outcome = coordinator
            .run(std::future::pending())
            .await
            .expect("run succeeds");
        let text = server.await.expect("collector task panicked");

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(progress.produced(), 60 * 3);
        assert_eq!(text.lines().count(), 60 * 3);
    }

    #[tokio::test]
    async fn interrupted_run_loses_nothing() {
        let (port, server) = collector().await;
        let mut generator = generator(None, None, true);
        generator.step_millis = 10;
        let config = tcp_config(generator, port);
        let coordinator = Coordinator::new(&config).expect("valid coordinator config");
        let progress = coordinator.progress();

        let outcome = coordinator
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .expect("run succeeds");
        let text = server.await.expect("collector task panicked");

        assert_eq!(outcome, Outcome::Interrupted);
        assert_eq!(outcome.exit_code(), 1);
        assert!(progress.produced() > 0);
        assert_eq!(text.lines().count() as u64, progress.produced());
    }

    #[tokio::test]
    async fn unreachable_collector_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let port = listener.local_addr().expect("bound address").port();
        drop(listener);

        let config = tcp_config(generator(Some("2024-01-01"), None, false), port);
        let coordinator = Coordinator::new(&config).expect("valid coordinator config");
        let err = coordinator
            .run(std::future::pending())
            .await
            .expect_err("nothing listens on the port");

        assert!(matches!(
            err,
            Error::Sink(sink::Error::RetriesExhausted { retries: 3 })
        ));
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn sent_rate_counts_kibibytes() {
        assert!((kib_per_sec(2048, 1.0) - 2.0).abs() < f64::EPSILON);
        assert!((kib_per_sec(10 * 1024, 5.0) - 2.0).abs() < f64::EPSILON);
        assert!(kib_per_sec(1000, 1.0) < 1.0);
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = debug_config(generator(None, None, false));
        config.stats_period_seconds = 0;
        assert!(matches!(Coordinator::new(&config), Err(Error::Config(_))));
    }
}
