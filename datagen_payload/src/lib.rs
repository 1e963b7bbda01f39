//! The datagen payloads
//!
//! This library builds the catalog of synthetic measurements that datagen
//! drives through time, and renders each measurement as a line record of the
//! form `name,tag=value,... value=V timestamp`.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub use catalog::Catalog;
pub use measurement::{Kind, Measurement, Value};

pub mod catalog;
pub mod measurement;
mod strings;
mod tags;

/// Errors related to catalog construction
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The integer and float ratios exceed the whole
    #[error("int_ratio ({int}) plus float_ratio ({float}) must not exceed 100")]
    Ratio {
        /// Configured integer ratio
        int: u8,
        /// Configured float ratio
        float: u8,
    },
    /// A mandatory tag was configured without any values to choose from
    #[error("Mandatory tag '{0}' must have at least one value")]
    EmptyMandatoryTag(String),
    /// Optional tags are requested but no values may be generated for them
    #[error("Optional tags requested but max_num_value_per_tag is zero")]
    NoTagValues,
}
