//! Search term generation from weighted categories.
//!
//! Categories are sampled in proportion to their weight; within a category
//! terms come out in a shuffled order. Once a category's own terms are used
//! up it keeps producing compounds of its terms with every configured term
//! ("Smith Trust", "Garcia Oak"). Emitted terms are remembered (case
//! insensitively) so repeated batches trend toward novel terms.

pub mod categories;
pub mod feeder;

use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::CategoryConfig;
use crate::error::ConfigError;
use crate::queue::MAX_TERM_CHARS;

pub use categories::default_categories;
pub use feeder::{FeederAction, FeederSettings, QueueFeeder};

struct CategoryPool {
    name: String,
    weight: u32,
    /// Not-yet-drawn terms; drawn from the back.
    pending: Vec<String>,
    /// The category's terms, leading each compound.
    stems: Vec<String>,
    /// Next index into `stems x partners`.
    cursor: usize,
}

impl CategoryPool {
    fn remaining(&self, partners: usize) -> usize {
        self.pending.len() + (self.stems.len() * partners).saturating_sub(self.cursor)
    }
}

pub struct SearchTermGenerator {
    pools: Vec<CategoryPool>,
    /// Every term of every weighted category, trailing each compound.
    partners: Vec<String>,
    emitted: HashSet<String>,
    rng: StdRng,
}

impl SearchTermGenerator {
    pub fn new(categories: &[CategoryConfig]) -> Result<Self, ConfigError> {
        Self::with_rng(categories, StdRng::from_entropy())
    }

    /// Deterministic generator for reproducible runs.
    pub fn with_seed(categories: &[CategoryConfig], seed: u64) -> Result<Self, ConfigError> {
        Self::with_rng(categories, StdRng::seed_from_u64(seed))
    }

    fn with_rng(categories: &[CategoryConfig], mut rng: StdRng) -> Result<Self, ConfigError> {
        if !categories.iter().any(|c| c.weight > 0 && !c.terms.is_empty()) {
            return Err(ConfigError::Validation {
                message: "generator needs at least one weighted category with terms".to_string(),
            });
        }

        let pools: Vec<CategoryPool> = categories
            .iter()
            .map(|c| {
                let mut pending: Vec<String> = c
                    .terms
                    .iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                pending.shuffle(&mut rng);
                let mut stems = pending.clone();
                stems.shuffle(&mut rng);
                CategoryPool {
                    name: c.name.clone(),
                    weight: c.weight,
                    pending,
                    stems,
                    cursor: 0,
                }
            })
            .collect();

        let mut seen = HashSet::new();
        let mut partners: Vec<String> = pools
            .iter()
            .filter(|p| p.weight > 0)
            .flat_map(|p| p.stems.iter())
            .filter(|t| seen.insert(t.to_lowercase()))
            .cloned()
            .collect();
        partners.shuffle(&mut rng);

        Ok(Self {
            pools,
            partners,
            emitted: HashSet::new(),
            rng,
        })
    }

    /// Draws up to `size` terms not emitted before. Returns fewer once every
    /// term and compound has been emitted.
    pub fn next_batch(&mut self, size: usize) -> Vec<String> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match self.draw() {
                Some(term) => batch.push(term),
                None => break,
            }
        }
        batch
    }

    fn draw(&mut self) -> Option<String> {
        let partners = self.partners.len();
        loop {
            let weights: Vec<u32> = self
                .pools
                .iter()
                .map(|p| if p.remaining(partners) == 0 { 0 } else { p.weight })
                .collect();
            // Errors once every weight is zero: nothing left to draw.
            let index = WeightedIndex::new(&weights).ok()?;
            let pick = index.sample(&mut self.rng);

            let pool = &mut self.pools[pick];
            while let Some(term) = pool.pending.pop() {
                if self.emitted.insert(term.to_lowercase()) {
                    log::trace!("Drew '{}' from {}", term, pool.name);
                    return Some(term);
                }
            }
            while pool.cursor < pool.stems.len() * partners {
                let stem = &pool.stems[pool.cursor % pool.stems.len()];
                let partner = &self.partners[pool.cursor / pool.stems.len()];
                pool.cursor += 1;
                if stem.eq_ignore_ascii_case(partner) {
                    continue;
                }
                let term = format!("{} {}", stem, partner);
                if term.chars().count() <= MAX_TERM_CHARS && self.emitted.insert(term.to_lowercase())
                {
                    log::trace!("Compounded '{}' from {}", term, pool.name);
                    return Some(term);
                }
            }
        }
    }

    /// Records terms as already covered so they are not drawn again.
    pub fn mark_emitted<I, S>(&mut self, terms: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for term in terms {
            self.emitted.insert(term.as_ref().trim().to_lowercase());
        }
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }

    /// Undrawn terms and compounds left, before filtering against the
    /// emitted set.
    pub fn remaining(&self) -> usize {
        self.pools
            .iter()
            .filter(|p| p.weight > 0)
            .map(|p| p.remaining(self.partners.len()))
            .sum()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
