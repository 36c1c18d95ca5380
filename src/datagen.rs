//! Seeded relation generators for benchmarks and tests.
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::row::{Key, Row, Table};

/// Deterministic generator; the same seed always yields the same tables.
pub struct DataGen {
    rng: ChaCha8Rng,
    sort: bool,
}

impl DataGen {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            sort: false,
        }
    }

    /// Sort every generated table by key.
    pub fn sorted(mut self, sort: bool) -> Self {
        self.sort = sort;
        self
    }

    fn finish(&self, rows: Vec<Row>) -> Table {
        let mut table = Table::new(rows);
        if self.sort {
            table.sort();
        }
        table
    }

    /// Unique keys `1..=n` in random order, payload = position.
    pub fn primary_keys(&mut self, n: usize) -> Table {
        let mut keys: Vec<Key> = (1..=n as Key).collect();
        keys.shuffle(&mut self.rng);
        let rows = keys
            .into_iter()
            .enumerate()
            .map(|(i, k)| Row::new(k, i as u32))
            .collect();
        self.finish(rows)
    }

    /// `n` keys drawn from `1..=max_key` so that every key appears
    /// `n / max_key` or one more times, in random order.
    pub fn foreign_keys(&mut self, n: usize, max_key: usize) -> Table {
        let max_key = max_key.max(1);
        let mut keys: Vec<Key> = (0..n).map(|i| (i % max_key) as Key + 1).collect();
        keys.shuffle(&mut self.rng);
        let rows = keys
            .into_iter()
            .enumerate()
            .map(|(i, k)| Row::new(k, i as u32))
            .collect();
        self.finish(rows)
    }

    /// Keys uniform in `1..=100 * r_size / selectivity`, so about
    /// `selectivity` percent of them hit a primary key relation of `r_size`.
    /// Selectivity 0 yields keys no such relation contains.
    pub fn foreign_keys_selectivity(&mut self, n: usize, r_size: usize, selectivity: u32) -> Table {
        let rows = if selectivity == 0 {
            (0..n)
                .map(|i| Row::new((r_size + 1 + i) as Key, i as u32))
                .collect()
        } else {
            let max_key = (100 * r_size / selectivity as usize).max(1) as Key;
            (0..n)
                .map(|i| Row::new(self.rng.random_range(1..=max_key), i as u32))
                .collect()
        };
        self.finish(rows)
    }

    /// `n` keys with Zipf distribution over an alphabet of `1..=alphabet`.
    /// The rank-to-key assignment is a random permutation.
    pub fn zipf_keys(&mut self, n: usize, alphabet: usize, factor: f64) -> Table {
        let alphabet = alphabet.max(1);
        let mut symbols: Vec<Key> = (1..=alphabet as Key).collect();
        symbols.shuffle(&mut self.rng);
        let lut = zipf_lut(factor, alphabet);

        let rows = (0..n)
            .map(|i| {
                let u: f64 = self.rng.random();
                let pos = lut.partition_point(|p| *p < u).min(alphabet - 1);
                Row::new(symbols[pos], i as u32)
            })
            .collect();
        self.finish(rows)
    }
}

/// Cumulative Zipf distribution, `lut[i] = P(rank <= i + 1)`.
fn zipf_lut(factor: f64, alphabet: usize) -> Vec<f64> {
    let scale: f64 = (1..=alphabet).map(|i| 1.0 / (i as f64).powf(factor)).sum();
    let mut sum = 0.0;
    (1..=alphabet)
        .map(|i| {
            sum += 1.0 / (i as f64).powf(factor);
            sum / scale
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn primary_keys_are_a_permutation() {
        let t = DataGen::new(1).primary_keys(1000);
        let mut keys: Vec<_> = t.rows.iter().map(|r| r.key).collect();
        keys.sort_unstable();
        assert!(keys.iter().copied().eq(1..=1000));
        assert!(t.rows.iter().enumerate().all(|(i, r)| r.payload == i as u32));
        assert!(!t.sorted);
    }

    #[test]
    fn generation_is_deterministic() {
        let a = DataGen::new(42).foreign_keys(500, 100);
        let b = DataGen::new(42).foreign_keys(500, 100);
        assert_eq!(a, b);
        assert_ne!(a, DataGen::new(43).foreign_keys(500, 100));
    }

    #[test]
    fn foreign_keys_cover_the_range_evenly() {
        let t = DataGen::new(2).foreign_keys(1000, 100);
        let mut counts = HashMap::new();
        for r in &t.rows {
            *counts.entry(r.key).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 100);
        assert!(counts.values().all(|c| *c == 10));
    }

    #[test]
    fn sorted_flag() {
        let t = DataGen::new(3).sorted(true).foreign_keys(100, 7);
        assert!(t.sorted);
        assert!(t.rows.windows(2).all(|w| w[0].key <= w[1].key));
    }

    #[test]
    fn selectivity_bounds_keys() {
        let t = DataGen::new(4).foreign_keys_selectivity(10_000, 1000, 50);
        assert!(t.rows.iter().all(|r| (1..=2000).contains(&r.key)));
        let hits = t.rows.iter().filter(|r| r.key <= 1000).count();
        assert!((4000..6000).contains(&hits));

        let none = DataGen::new(4).foreign_keys_selectivity(10, 1000, 0);
        assert!(none.rows.iter().all(|r| r.key > 1000));
    }

    #[test]
    fn zipf_is_skewed() {
        let t = DataGen::new(5).zipf_keys(20_000, 1000, 1.0);
        assert!(t.rows.iter().all(|r| (1..=1000).contains(&r.key)));
        let mut counts = HashMap::new();
        for r in &t.rows {
            *counts.entry(r.key).or_insert(0usize) += 1;
        }
        let top = counts.values().copied().max().unwrap_or(0);
        // Rank 1 takes about 13% of a 1000-symbol alphabet at factor 1.
        assert!(top > 1500, "top key only {top} times");
    }

    #[test]
    fn zipf_lut_ends_at_one() {
        let lut = zipf_lut(0.5, 10);
        assert_eq!(lut.len(), 10);
        assert!((lut[9] - 1.0).abs() < 1e-12);
        assert!(lut.windows(2).all(|w| w[0] < w[1]));
    }
}
