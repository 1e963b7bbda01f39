//! The datagen synthetic time-series generator.
//!
//! This library supports the datagen binary found elsewhere in this project.
//! A [`producer::Producer`] walks a catalog of measurements through time and
//! emits line records into a bounded queue, a [`sink::Sink`] batches those
//! records onto a TCP connection and the [`coordinator::Coordinator`] wires
//! the two together and stops them in order.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod producer;
pub mod sink;
