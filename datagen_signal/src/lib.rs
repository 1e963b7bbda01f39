//! One-shot stop signal for datagen.
//!
//! datagen runs two long-lived tasks, the producer and the sink, next to the
//! coordinator's own event loop. The coordinator must tell both tasks to stop
//! exactly once and may want to wait for them to let go of their end of the
//! signal.
//!
//! The mechanism has two components, a `Broadcaster` and a `Watcher`. The
//! `Broadcaster` is consumed when it signals, so the stop can never be sent
//! twice. Each `Watcher` observes the signal and, once dropped, lets
//! `Broadcaster::signal_and_wait` make progress.
//!
//! There is only one `Broadcaster` and potentially many `Watcher` instances.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::watch;
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);

    let w = Watcher {
        receiver,
        signal_received: false,
    };
    let b = Broadcaster { sender };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that they must stop.
pub struct Broadcaster {
    /// Transmission point for the signal. Flipped to `true` exactly once.
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have dropped their `Watcher`.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal through any `Watcher` instances.
    ///
    /// Function WILL block until every `Watcher` derived from this
    /// `Broadcaster` has been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for the stop signal.
pub struct Watcher {
    /// Transmission point for the signal from `Broadcaster`.
    receiver: watch::Receiver<bool>,
    /// Set once the signal has been observed through this instance.
    signal_received: bool,
}

impl Watcher {
    /// Receive the stop notice. This function will block if a notice has not
    /// already been sent.
    ///
    /// If `recv` is called multiple times after the signal has been received
    /// this function will return immediately. A `Broadcaster` dropped without
    /// signaling counts as a signal.
    pub async fn recv(&mut self) {
        if self.signal_received {
            // Yield so that a completed watcher inside a `select!` does not
            // starve every other arm.
            tokio::task::yield_now().await;
            return;
        }

        // An error here means the `Broadcaster` is gone, which is a stop all
        // the same.
        let _ = self.receiver.wait_for(|stop| *stop).await;
        self.signal_received = true;
    }
}
