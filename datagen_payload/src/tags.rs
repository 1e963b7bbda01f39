//! Tag generation for catalog measurements
//!
//! A [`Generator`] holds a fixed population of tag keys, each with a fixed
//! list of candidate values. Mandatory generators contribute every key to a
//! measurement, optional generators a sampled subset of keys.

use std::collections::BTreeMap;

use rand::seq::{IndexedRandom, index};

use crate::{Error, strings};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Key {
    name: String,
    values: Vec<String>,
}

impl Key {
    fn choose<R>(&self, rng: &mut R) -> Option<String>
    where
        R: rand::Rng + ?Sized,
    {
        self.values
            .choose(rng)
            .map(|value| format!("{name}={value}", name = self.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Generator {
    keys: Vec<Key>,
}

impl Generator {
    /// Creates a generator from user-named keys, each with the given number of
    /// random values of `tag_size` characters. Keys keep their sorted order.
    ///
    /// # Errors
    ///
    /// Returns an error if any key is configured with zero values.
    pub(crate) fn mandatory<R>(
        rng: &mut R,
        counts: &BTreeMap<String, u16>,
        tag_size: usize,
    ) -> Result<Self, Error>
    where
        R: rand::Rng + ?Sized,
    {
        let mut keys = Vec::with_capacity(counts.len());
        for (name, &num_values) in counts {
            if num_values == 0 {
                return Err(Error::EmptyMandatoryTag(name.clone()));
            }
            let values = (0..num_values)
                .map(|_| strings::random_string(rng, tag_size))
                .collect();
            keys.push(Key {
                name: name.clone(),
                values,
            });
        }
        Ok(Self { keys })
    }

    /// Creates a generator of `num_keys` random keys named `tag_<random>`,
    /// each with `values_per_key` values named `_<random>`.
    pub(crate) fn optional<R>(
        rng: &mut R,
        num_keys: usize,
        values_per_key: usize,
        tag_size: usize,
    ) -> Self
    where
        R: rand::Rng + ?Sized,
    {
        let keys = (0..num_keys)
            .map(|_| {
                let name = strings::prefixed(rng, "tag_", tag_size);
                let values = (0..values_per_key)
                    .map(|_| strings::prefixed(rng, "_", tag_size))
                    .collect();
                Key { name, values }
            })
            .collect();
        Self { keys }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// One `key=value` pair for every key in the population.
    pub(crate) fn all<R>(&self, rng: &mut R) -> Vec<String>
    where
        R: rand::Rng + ?Sized,
    {
        self.keys.iter().filter_map(|key| key.choose(rng)).collect()
    }

    /// One `key=value` pair for each of `amount` distinct keys, sampled without
    /// replacement. `amount` is clamped to the population size. Pairs come out
    /// in population order.
    pub(crate) fn some<R>(&self, rng: &mut R, amount: usize) -> Vec<String>
    where
        R: rand::Rng + ?Sized,
    {
        let amount = amount.min(self.keys.len());
        let mut picked = index::sample(rng, self.keys.len(), amount).into_vec();
        picked.sort_unstable();
        picked
            .into_iter()
            .filter_map(|idx| self.keys[idx].choose(rng))
            .collect()
    }
}
