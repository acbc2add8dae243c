// Copyright 2025 Oxide Computer Company
use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

pub const HISTOGRAM_BUCKETS: usize = 64;

/// Additive block accounting for a set of dedup entries.
///
/// The plain fields count each physical copy once. The `ref_` fields weight
/// each copy by the number of logical references to it.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Stat {
    pub blocks: u64,
    pub lsize: u64,
    pub psize: u64,
    pub dsize: u64,
    pub ref_blocks: u64,
    pub ref_lsize: u64,
    pub ref_psize: u64,
    pub ref_dsize: u64,
}

impl Stat {
    fn fields_mut(&mut self) -> [&mut u64; 8] {
        let Stat {
            blocks,
            lsize,
            psize,
            dsize,
            ref_blocks,
            ref_lsize,
            ref_psize,
            ref_dsize,
        } = self;
        [
            blocks, lsize, psize, dsize, ref_blocks, ref_lsize, ref_psize,
            ref_dsize,
        ]
    }

    fn fields(&self) -> [u64; 8] {
        let mut copy = *self;
        copy.fields_mut().map(|f| *f)
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|f| *f == 0)
    }

    /// Histogram bucket this stat belongs in: floor(log2(ref_blocks)).
    pub fn bucket(&self) -> usize {
        assert_ne!(self.ref_blocks, 0, "bucket of an unreferenced stat");
        (u64::BITS - 1 - self.ref_blocks.leading_zeros()) as usize
    }
}

impl AddAssign<&Stat> for Stat {
    fn add_assign(&mut self, other: &Stat) {
        for (d, s) in self.fields_mut().into_iter().zip(other.fields()) {
            *d = d.wrapping_add(s);
        }
    }
}

impl SubAssign<&Stat> for Stat {
    fn sub_assign(&mut self, other: &Stat) {
        for (d, s) in self.fields_mut().into_iter().zip(other.fields()) {
            *d = d.wrapping_sub(s);
        }
    }
}

/// Whether a stat is being added to, or taken out of, a histogram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatSign {
    Add,
    Sub,
}

/// Stats bucketed by log2 of their reference count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Stat>", into = "Vec<Stat>")]
pub struct Histogram {
    stat: [Stat; HISTOGRAM_BUCKETS],
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram {
            stat: [Stat::default(); HISTOGRAM_BUCKETS],
        }
    }
}

impl TryFrom<Vec<Stat>> for Histogram {
    type Error = String;

    fn try_from(v: Vec<Stat>) -> Result<Self, Self::Error> {
        let stat: [Stat; HISTOGRAM_BUCKETS] = v.try_into().map_err(
            |v: Vec<Stat>| {
                format!(
                    "histogram has {} buckets, expected {}",
                    v.len(),
                    HISTOGRAM_BUCKETS
                )
            },
        )?;
        Ok(Histogram { stat })
    }
}

impl From<Histogram> for Vec<Stat> {
    fn from(h: Histogram) -> Self {
        h.stat.to_vec()
    }
}

impl Histogram {
    pub fn bucket(&self, i: usize) -> &Stat {
        &self.stat[i]
    }

    pub fn buckets(&self) -> &[Stat] {
        &self.stat
    }

    pub fn apply(&mut self, stat: &Stat, sign: StatSign) {
        let b = &mut self.stat[stat.bucket()];
        match sign {
            StatSign::Add => *b += stat,
            StatSign::Sub => *b -= stat,
        }
    }

    pub fn add(&mut self, other: &Histogram) {
        for (d, s) in self.stat.iter_mut().zip(other.stat.iter()) {
            *d += s;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stat.iter().all(Stat::is_empty)
    }

    /// Every bucket summed into one stat.
    pub fn total(&self) -> Stat {
        let mut total = Stat::default();
        for s in self.stat.iter() {
            total += s;
        }
        total
    }
}

/// Cached size of one backing object, refreshed on load and sync.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ObjectStats {
    pub count: u64,
    pub dspace: u64,
    pub mspace: u64,
}
