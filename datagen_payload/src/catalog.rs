//! The fixed set of measurements driven by datagen.
//!
//! A [`Catalog`] is built once, at start-up, from a [`Config`]. The requested
//! number of measurements is partitioned into integer, float and boolean bands
//! by the configured ratios. Inside each band consecutive measurements share a
//! generated name in runs, simulating several series per metric name. Every
//! measurement's tag string holds one value for each mandatory tag key
//! followed by a sampled subset of optional tags.

use std::{collections::BTreeMap, sync::Arc};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Kind, Measurement, strings, tags};

fn default_num_metrics() -> usize {
    100
}

fn default_int_ratio() -> u8 {
    90
}

fn default_float_ratio() -> u8 {
    10
}

fn default_tag_size() -> usize {
    6
}

fn default_metric_per_metricname_ratio() -> u8 {
    2
}

fn default_tags_per_metric() -> usize {
    4
}

fn default_max_num_value_per_tag() -> usize {
    10
}

fn default_metric_name_size() -> usize {
    20
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the [`Catalog`].
pub struct Config {
    /// Total number of measurements in the catalog
    #[serde(default = "default_num_metrics")]
    pub num_metrics: usize,
    /// Percentage of measurements with integer values
    #[serde(default = "default_int_ratio")]
    pub int_ratio: u8,
    /// Percentage of measurements with float values. The remainder after the
    /// integer and float ratios are boolean.
    #[serde(default = "default_float_ratio")]
    pub float_ratio: u8,
    /// Length in characters of generated tag keys and values
    #[serde(default = "default_tag_size")]
    pub tag_size: usize,
    /// Percentage of `num_metrics` sharing a single metric name
    #[serde(default = "default_metric_per_metricname_ratio")]
    pub metric_per_metricname_ratio: u8,
    /// Number of tags carried by each measurement, mandatory tags included
    #[serde(default = "default_tags_per_metric")]
    pub tags_per_metric: usize,
    /// Number of distinct values generated for each optional tag key
    #[serde(default = "default_max_num_value_per_tag")]
    pub max_num_value_per_tag: usize,
    /// Length in characters of the random part of metric names
    #[serde(default = "default_metric_name_size")]
    pub metric_name_size: usize,
    /// Number of optional tag keys to choose from. Raised to the number of
    /// optional tags per measurement when lower.
    #[serde(default)]
    pub num_tags: usize,
    /// Tag keys present on every measurement, mapped to their number of
    /// distinct values
    #[serde(default)]
    pub mandatory_tags: BTreeMap<String, u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_metrics: default_num_metrics(),
            int_ratio: default_int_ratio(),
            float_ratio: default_float_ratio(),
            tag_size: default_tag_size(),
            metric_per_metricname_ratio: default_metric_per_metricname_ratio(),
            tags_per_metric: default_tags_per_metric(),
            max_num_value_per_tag: default_max_num_value_per_tag(),
            metric_name_size: default_metric_name_size(),
            num_tags: 0,
            mandatory_tags: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Number of optional tags on each measurement. Never negative: a
    /// mandatory set larger than `tags_per_metric` leaves no room.
    #[must_use]
    pub fn optional_tags_per_metric(&self) -> usize {
        self.tags_per_metric
            .saturating_sub(self.mandatory_tags.len())
    }

    /// Index below which measurements are integers.
    #[must_use]
    pub fn int_limit(&self) -> usize {
        percent_of(self.num_metrics, self.int_ratio)
    }

    /// Index below which measurements are floats, when not integers.
    #[must_use]
    pub fn float_limit(&self) -> usize {
        percent_of(
            self.num_metrics,
            self.int_ratio.saturating_add(self.float_ratio),
        )
    }

    /// Length of the runs of measurements sharing one name, at least 1.
    #[must_use]
    pub fn run_length(&self) -> usize {
        percent_of(self.num_metrics, self.metric_per_metricname_ratio).max(1)
    }

    /// Check the configuration for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the ratios exceed 100, a mandatory tag has no
    /// values, or optional tags are requested without values.
    pub fn valid(&self) -> Result<(), Error> {
        if u16::from(self.int_ratio) + u16::from(self.float_ratio) > 100 {
            return Err(Error::Ratio {
                int: self.int_ratio,
                float: self.float_ratio,
            });
        }
        if let Some((name, _)) = self.mandatory_tags.iter().find(|(_, n)| **n == 0) {
            return Err(Error::EmptyMandatoryTag(name.clone()));
        }
        if self.optional_tags_per_metric() > 0 && self.max_num_value_per_tag == 0 {
            return Err(Error::NoTagValues);
        }
        Ok(())
    }
}

fn percent_of(count: usize, ratio: u8) -> usize {
    count.saturating_mul(usize::from(ratio)) / 100
}

/// The [`Kind`] of the measurement at `index` given the band limits.
fn kind_for(index: usize, int_limit: usize, float_limit: usize) -> Kind {
    if index < int_limit {
        Kind::Int
    } else if index < float_limit {
        Kind::Float
    } else {
        Kind::Bool
    }
}

#[derive(Debug, Clone, PartialEq)]
/// An ordered, fixed collection of [`Measurement`] instances.
pub struct Catalog {
    measurements: Vec<Measurement>,
}

impl Catalog {
    /// Build a new [`Catalog`] from `config`, drawing every random choice
    /// from `rng`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is not valid, see [`Config::valid`].
    pub fn new<R>(config: &Config, rng: &mut R) -> Result<Self, Error>
    where
        R: Rng + ?Sized,
    {
        config.valid()?;

        let mandatory = tags::Generator::mandatory(rng, &config.mandatory_tags, config.tag_size)?;
        let optional_per_metric = config.optional_tags_per_metric();
        let optional = tags::Generator::optional(
            rng,
            config.num_tags.max(optional_per_metric),
            config.max_num_value_per_tag,
            config.tag_size,
        );

        let int_limit = config.int_limit();
        let float_limit = config.float_limit();
        let run_length = config.run_length();

        info!(
            "Generating {total} measurements: {ints} int, {floats} float, {bools} bool, {run_length} per name.",
            total = config.num_metrics,
            ints = int_limit,
            floats = float_limit - int_limit,
            bools = config.num_metrics - float_limit,
        );

        let mut measurements = Vec::with_capacity(config.num_metrics);
        let mut current: Option<(Kind, Arc<str>)> = None;
        let mut run = 0;
        for index in 0..config.num_metrics {
            let kind = kind_for(index, int_limit, float_limit);
            let name = match current {
                Some((current_kind, ref name)) if current_kind == kind && run < run_length => {
                    Arc::clone(name)
                }
                _ => {
                    let name: Arc<str> =
                        strings::prefixed(rng, kind.name_prefix(), config.metric_name_size).into();
                    current = Some((kind, Arc::clone(&name)));
                    run = 0;
                    name
                }
            };
            run += 1;

            let mut pairs = mandatory.all(rng);
            pairs.extend(optional.some(rng, optional_per_metric));
            let value = kind.initial(rng);
            measurements.push(Measurement::new(name, pairs.join(","), value));
        }

        Ok(Self { measurements })
    }

    /// Number of measurements in the catalog
    #[must_use]
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether the catalog holds no measurement
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Measurements in stable catalog order
    pub fn iter(&self) -> std::slice::Iter<'_, Measurement> {
        self.measurements.iter()
    }

    /// Mutable access to the measurements in stable catalog order
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Measurement> {
        self.measurements.iter_mut()
    }
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, HashSet};

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::{Catalog, Config};
    use crate::{Error, Kind};

    fn count_kinds(catalog: &Catalog) -> (usize, usize, usize) {
        catalog.iter().fold((0, 0, 0), |(i, f, b), m| match m.kind() {
            Kind::Int => (i + 1, f, b),
            Kind::Float => (i, f + 1, b),
            Kind::Bool => (i, f, b + 1),
        })
    }

    #[test]
    fn all_integer_catalog() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Config {
            num_metrics: 3,
            int_ratio: 100,
            float_ratio: 0,
            ..Config::default()
        };
        let catalog = Catalog::new(&config, &mut rng).expect("valid config");

        assert_eq!(catalog.len(), 3);
        assert!(catalog.iter().all(|m| m.kind() == Kind::Int));
        assert!(catalog.iter().all(|m| m.name().starts_with("int.")));
    }

    #[test]
    fn ratios_above_whole_rejected() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Config {
            int_ratio: 60,
            float_ratio: 50,
            ..Config::default()
        };
        assert_eq!(
            Catalog::new(&config, &mut rng),
            Err(Error::Ratio { int: 60, float: 50 })
        );
    }

    #[test]
    fn optional_tags_without_values_rejected() {
        let mut rng = SmallRng::seed_from_u64(0);
        let config = Config {
            max_num_value_per_tag: 0,
            ..Config::default()
        };
        assert_eq!(Catalog::new(&config, &mut rng), Err(Error::NoTagValues));
    }

    #[test]
    fn names_run_in_groups() {
        let mut rng = SmallRng::seed_from_u64(1);
        let config = Config {
            num_metrics: 10,
            int_ratio: 100,
            float_ratio: 0,
            metric_per_metricname_ratio: 20,
            ..Config::default()
        };
        let catalog = Catalog::new(&config, &mut rng).expect("valid config");
        let names: Vec<&str> = catalog.iter().map(|m| m.name()).collect();

        for pair in names.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
        let distinct: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn zero_grouping_ratio_forces_single_runs() {
        let mut rng = SmallRng::seed_from_u64(1);
        let config = Config {
            num_metrics: 10,
            metric_per_metricname_ratio: 0,
            ..Config::default()
        };
        let catalog = Catalog::new(&config, &mut rng).expect("valid config");
        let distinct: HashSet<&str> = catalog.iter().map(|m| m.name()).collect();
        assert_eq!(distinct.len(), 10);
    }

    #[test]
    fn type_boundary_starts_new_name() {
        let mut rng = SmallRng::seed_from_u64(2);
        // 5 ints, 5 floats in runs of 4: the fifth int must not share its
        // name with the first float.
        let config = Config {
            num_metrics: 10,
            int_ratio: 50,
            float_ratio: 50,
            metric_per_metricname_ratio: 40,
            ..Config::default()
        };
        let catalog = Catalog::new(&config, &mut rng).expect("valid config");
        let measurements: Vec<_> = catalog.iter().collect();

        assert_eq!(measurements[4].kind(), Kind::Int);
        assert_eq!(measurements[5].kind(), Kind::Float);
        assert_ne!(measurements[4].name(), measurements[5].name());
        assert_eq!(measurements[3].name(), measurements[0].name());
        assert_ne!(measurements[4].name(), measurements[3].name());
    }

    #[test]
    fn same_seed_same_catalog() {
        let config = Config::default();
        let a = Catalog::new(&config, &mut SmallRng::seed_from_u64(9)).expect("valid config");
        let b = Catalog::new(&config, &mut SmallRng::seed_from_u64(9)).expect("valid config");
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn partition_is_exact(seed: u64, num_metrics in 0..2_000_usize, int_ratio in 0..=100_u8, float_ratio in 0..=100_u8) {
            prop_assume!(u16::from(int_ratio) + u16::from(float_ratio) <= 100);
            let mut rng = SmallRng::seed_from_u64(seed);
            let config = Config {
                num_metrics,
                int_ratio,
                float_ratio,
                tags_per_metric: 0,
                ..Config::default()
            };
            let catalog = Catalog::new(&config, &mut rng).expect("valid config");

            let int_limit = num_metrics * usize::from(int_ratio) / 100;
            let float_limit = num_metrics * usize::from(int_ratio + float_ratio) / 100;
            let (ints, floats, bools) = count_kinds(&catalog);

            prop_assert_eq!(catalog.len(), num_metrics);
            prop_assert_eq!(ints, int_limit);
            prop_assert_eq!(floats, float_limit - int_limit);
            prop_assert_eq!(bools, num_metrics - float_limit);
        }

        #[test]
        fn tag_budget_respected(seed: u64, num_mandatory in 0..6_usize, tags_per_metric in 0..10_usize, num_tags in 0..12_usize) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mandatory_tags: BTreeMap<String, u16> = (0..num_mandatory)
                .map(|i| (format!("m{i}"), 3))
                .collect();
            let config = Config {
                num_metrics: 20,
                tags_per_metric,
                num_tags,
                mandatory_tags,
                ..Config::default()
            };
            let catalog = Catalog::new(&config, &mut rng).expect("valid config");
            let budget = tags_per_metric.saturating_sub(num_mandatory);

            for m in catalog.iter() {
                let keys: Vec<&str> = m
                    .tags()
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .filter_map(|p| p.split_once('=').map(|(k, _)| k))
                    .collect();
                for i in 0..num_mandatory {
                    let key = format!("m{i}");
                    prop_assert_eq!(keys.iter().filter(|k| **k == key).count(), 1);
                }
                let optional = keys.iter().filter(|k| k.starts_with("tag_")).count();
                prop_assert!(optional <= budget);
                prop_assert_eq!(keys.len(), num_mandatory + optional);
            }
        }
    }
}
