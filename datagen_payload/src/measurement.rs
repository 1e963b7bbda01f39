//! A single synthetic time series.
//!
//! A [`Measurement`] is identified by its name and tag string, both fixed at
//! creation. Only its [`Value`] changes, once per production round, following
//! a random walk specific to its [`Kind`].

use std::{fmt, sync::Arc};

use rand::Rng;
use rand_distr::StandardNormal;

/// The type of a measurement's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Signed integer values
    Int,
    /// Floating point values, rendered with four decimals
    Float,
    /// `true` / `false` values
    Bool,
}

impl Kind {
    /// Prefix applied to the generated names of this kind.
    #[must_use]
    pub fn name_prefix(self) -> &'static str {
        match self {
            Kind::Int => "int.",
            Kind::Float => "float.",
            Kind::Bool => "bool.",
        }
    }

    /// Draw the first value of a new measurement of this kind.
    pub fn initial<R>(self, rng: &mut R) -> Value
    where
        R: Rng + ?Sized,
    {
        match self {
            Kind::Int => Value::Int(rng.random_range(0..1000)),
            Kind::Float => Value::Float(rng.sample::<f64, _>(StandardNormal) * 100.0),
            Kind::Bool => Value::Bool(true),
        }
    }
}

/// The current value of a measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// See [`Kind::Int`]
    Int(i64),
    /// See [`Kind::Float`]
    Float(f64),
    /// See [`Kind::Bool`]
    Bool(bool),
}

impl Value {
    /// The [`Kind`] of this value.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::Bool(_) => Kind::Bool,
        }
    }

    /// Advance the value to its next sample.
    ///
    /// Integers drift by a step in `[-4, 5]`, floats by a normal step of
    /// deviation 10 and booleans are `true` with probability 0.8.
    pub fn mutate<R>(&mut self, rng: &mut R)
    where
        R: Rng + ?Sized,
    {
        match self {
            Value::Int(v) => *v = v.saturating_add(rng.random_range(0..10) - 4),
            Value::Float(v) => *v += rng.sample::<f64, _>(StandardNormal) * 10.0,
            Value::Bool(v) => *v = rng.random_range(0..20) < 16,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:.4}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A named, tagged, typed value generator
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Shared by every measurement in the same name group
    name: Arc<str>,
    /// Comma separated `key=value` pairs, possibly empty
    tags: String,
    value: Value,
}

impl Measurement {
    /// Create a new [`Measurement`]
    #[must_use]
    pub fn new(name: Arc<str>, tags: String, value: Value) -> Self {
        Self { name, tags, value }
    }

    /// The metric name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tag string, without the leading comma
    #[must_use]
    pub fn tags(&self) -> &str {
        &self.tags
    }

    /// The current value
    #[must_use]
    pub fn value(&self) -> Value {
        self.value
    }

    /// The kind of the current value
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.value.kind()
    }

    /// Advance the value to its next sample. Identity is untouched.
    pub fn mutate<R>(&mut self, rng: &mut R)
    where
        R: Rng + ?Sized,
    {
        self.value.mutate(rng);
    }

    /// Render the current value as a record stamped with `timestamp`, in
    /// nanoseconds since the Unix epoch. The record carries no trailing
    /// newline.
    #[must_use]
    pub fn record(&self, timestamp: i64) -> String {
        format!("{self} {timestamp}")
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            write!(f, "{name} value={value}", name = self.name, value = self.value)
        } else {
            write!(
                f,
                "{name},{tags} value={value}",
                name = self.name,
                tags = self.tags,
                value = self.value
            )
        }
    }
}
