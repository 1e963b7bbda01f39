//! The record producer.
//!
//! The [`Producer`] owns the [`Catalog`] and the production [`Clock`]. Each
//! round it renders every measurement at the current timestamp, pushes the
//! record into a bounded queue and mutates the measurement. Rounds run back to
//! back over the configured interval and, in continuous mode, once per step on
//! the wall clock after that.
//!
//! ## Metrics
//!
//! `records_produced`: Records pushed into the output queue
//!

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use datagen_payload::{Catalog, catalog};
use datagen_signal::Watcher;
use metrics::counter;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::clock::{self, Clock};

fn default_metric_buffer_size() -> usize {
    100_000
}

fn default_step_millis() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the [`Producer`].
pub struct Config {
    /// The seed for random operations. Drawn at random, and logged, when
    /// absent.
    #[serde(default)]
    pub seed: Option<[u8; 32]>,
    /// The measurements to produce
    #[serde(default)]
    pub catalog: catalog::Config,
    /// Capacity of the output queue, in records
    #[serde(default = "default_metric_buffer_size")]
    pub metric_buffer_size: usize,
    /// First timestamp, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`. Defaults to one
    /// day ago.
    #[serde(default)]
    pub start: Option<String>,
    /// End of the interval, exclusive. Defaults to now.
    #[serde(default)]
    pub end: Option<String>,
    /// Milliseconds between two rounds
    #[serde(default = "default_step_millis")]
    pub step_millis: u64,
    /// Keep producing on the wall clock once the interval has caught up
    #[serde(default)]
    pub continuous: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: None,
            catalog: catalog::Config::default(),
            metric_buffer_size: default_metric_buffer_size(),
            start: None,
            end: None,
            step_millis: default_step_millis(),
            continuous: false,
        }
    }
}

impl Config {
    /// Build the production clock described by this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `start` or `end` are malformed or the step is zero.
    pub fn clock(&self, now: i64) -> Result<Clock, clock::Error> {
        Clock::from_config(
            self.start.as_deref(),
            self.end.as_deref(),
            Duration::from_millis(self.step_millis),
            self.continuous,
            now,
        )
    }

    /// Check the configuration for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog configuration is invalid, the queue has
    /// no capacity or the clock cannot be built.
    pub fn valid(&self) -> Result<(), Error> {
        self.catalog.valid()?;
        if self.metric_buffer_size == 0 {
            return Err(Error::Zero);
        }
        self.clock(clock::now())?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Producer`].
pub enum Error {
    /// Catalog construction failed
    #[error("Catalog error: {0}")]
    Catalog(#[from] datagen_payload::Error),
    /// Clock construction failed
    #[error("Clock error: {0}")]
    Clock(#[from] clock::Error),
    /// Zero value error
    #[error("metric_buffer_size cannot be zero")]
    Zero,
}

#[derive(Debug, Default)]
/// Progress of a [`Producer`], readable from other tasks.
pub struct Progress {
    produced: AtomicU64,
    timestamp: AtomicI64,
}

impl Progress {
    /// Total records pushed into the output queue.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Timestamp of the round in progress, or of the last round.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp.load(Ordering::Relaxed)
    }
}

/// Result of a single production round
enum Flow {
    Continue,
    Stop,
    Closed,
}

#[derive(Debug)]
/// The record producer.
pub struct Producer {
    catalog: Catalog,
    clock: Clock,
    rng: StdRng,
    output: mpsc::Sender<String>,
    shutdown: Watcher,
    progress: Arc<Progress>,
}

impl Producer {
    /// Create a new [`Producer`] and the receiving end of its output queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &Config, shutdown: Watcher) -> Result<(Self, mpsc::Receiver<String>), Error> {
        if config.metric_buffer_size == 0 {
            return Err(Error::Zero);
        }
        let clock = config.clock(clock::now())?;

        let seed = config.seed.unwrap_or_else(rand::random);
        info!("Producer seed: {seed:?}");
        let mut rng = StdRng::from_seed(seed);
        let catalog = Catalog::new(&config.catalog, &mut rng)?;

        Ok(Self::from_parts(
            catalog,
            clock,
            rng,
            config.metric_buffer_size,
            shutdown,
        ))
    }

    /// Create a new [`Producer`] from an already built catalog and clock.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn from_parts(
        catalog: Catalog,
        clock: Clock,
        rng: StdRng,
        capacity: usize,
        shutdown: Watcher,
    ) -> (Self, mpsc::Receiver<String>) {
        let (output, records) = mpsc::channel(capacity);
        let progress = Arc::new(Progress::default());
        progress.timestamp.store(clock.timestamp(), Ordering::Relaxed);
        let producer = Self {
            catalog,
            clock,
            rng,
            output,
            shutdown,
            progress,
        };
        (producer, records)
    }

    /// A shared handle on this producer's counters.
    #[must_use]
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Run [`Producer`] to completion or until a shutdown signal is received.
    ///
    /// The output queue is closed on return, whatever the reason.
    pub async fn spin(self) {
        let Self {
            mut catalog,
            mut clock,
            mut rng,
            output,
            mut shutdown,
            progress,
        } = self;

        loop {
            if clock.caught_up(clock::now()) {
                info!(
                    "Caught up with the wall clock at {}, producing live.",
                    clock::display(clock.timestamp())
                );
                break;
            }
            if clock.exhausted() {
                info!(
                    "Interval exhausted at {}, {} records produced.",
                    clock::display(clock.timestamp()),
                    progress.produced()
                );
                return;
            }
            let flow = round(
                &mut catalog,
                &mut rng,
                clock.timestamp(),
                &output,
                &mut shutdown,
                &progress,
            )
            .await;
            if !matches!(flow, Flow::Continue) {
                return;
            }
            clock.advance();
        }

        let step = clock.step();
        let mut ticker = time::interval_at(Instant::now() + step, step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    return;
                }
                _ = ticker.tick() => {}
            }
            clock.set(clock::now());
            if clock.exhausted() {
                info!(
                    "Configured end reached at {}, {} records produced.",
                    clock::display(clock.timestamp()),
                    progress.produced()
                );
                return;
            }
            let flow = round(
                &mut catalog,
                &mut rng,
                clock.timestamp(),
                &output,
                &mut shutdown,
                &progress,
            )
            .await;
            if !matches!(flow, Flow::Continue) {
                return;
            }
        }
    }
}

/// Push one record per measurement, in catalog order, stamped `timestamp`.
async fn round(
    catalog: &mut Catalog,
    rng: &mut StdRng,
    timestamp: i64,
    output: &mpsc::Sender<String>,
    shutdown: &mut Watcher,
    progress: &Progress,
) -> Flow {
    progress.timestamp.store(timestamp, Ordering::Relaxed);
    for measurement in catalog.iter_mut() {
        let record = measurement.record(timestamp);
        tokio::select! {
            biased;

            () = shutdown.recv() => {
                info!("shutdown signal received");
                return Flow::Stop;
            }
            res = output.send(record) => {
                if res.is_err() {
                    debug!("Output queue closed by the consumer.");
                    return Flow::Closed;
                }
            }
        }
        progress.produced.fetch_add(1, Ordering::Relaxed);
        counter!("records_produced").increment(1);
        measurement.mutate(rng);
    }
    Flow::Continue
}
