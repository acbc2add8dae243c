// Copyright 2025 Oxide Computer Company
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::*;

pub const MIN_HASH_BITS: u32 = 1;
pub const MAX_HASH_BITS: u32 = 16;

/// Pool-wide dedup tunables.
///
/// The engine takes a copy of this at the start of every sync pass, so a
/// change made with `set_config` only takes effect on the next pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Reference count at which an extra ditto copy is kept. Zero disables
    /// ditto copies.
    pub ditto_threshold: u64,

    /// Entries are never persisted in a class outside of this range.
    pub class_min: TableClass,
    pub class_max: TableClass,

    /// Prefetch dedup table records for blocks about to be freed.
    pub prefetch: bool,

    /// Width of the bucket selector taken from the top of checksum word 0.
    /// Only read when the engine is opened.
    pub hash_bits: u32,

    /// Limit on entries resident in memory per checksum algorithm. Zero
    /// means no limit.
    pub max_resident_entries: usize,

    /// Whether the pool accepts writes. Repairs are dropped otherwise.
    pub writeable: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            ditto_threshold: 0,
            class_min: TableClass::Ditto,
            class_max: TableClass::Unique,
            prefetch: true,
            hash_bits: 8,
            max_resident_entries: 0,
            writeable: true,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.class_min > self.class_max {
            bail!(
                "class_min {} is hotter than class_max {}",
                self.class_min,
                self.class_max
            );
        }

        if !(MIN_HASH_BITS..=MAX_HASH_BITS).contains(&self.hash_bits) {
            bail!(
                "hash_bits must be between {} and {}, not {}",
                MIN_HASH_BITS,
                MAX_HASH_BITS,
                self.hash_bits
            );
        }

        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<DedupConfig> {
        let config: DedupConfig =
            toml::from_str(s).context("parse dedup config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<DedupConfig> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read {:?}", path))?;
        Self::from_toml_str(&s)
    }

    /// The ditto threshold as the copy policy uses it: zero, or anything
    /// past `u32::MAX`, becomes `u32::MAX`.
    pub fn ditto_limit(&self) -> u64 {
        if self.ditto_threshold == 0 || self.ditto_threshold > u32::MAX as u64
        {
            u32::MAX as u64
        } else {
            self.ditto_threshold
        }
    }

    pub fn clamp_class(&self, class: TableClass) -> TableClass {
        class.clamp(self.class_min, self.class_max)
    }

    pub fn classes(&self) -> impl Iterator<Item = TableClass> + Clone {
        TableClass::range(self.class_min, self.class_max)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    use proptest::prelude::*;
    use strum::IntoEnumIterator;
    use test_strategy::proptest;

    fn class(i: usize) -> TableClass {
        TableClass::iter().nth(i).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let c = DedupConfig::default();
        c.validate().unwrap();
        assert_eq!(c.classes().count(), DDT_CLASSES);
        assert_eq!(c.ditto_limit(), u32::MAX as u64);
    }

    #[test]
    fn ditto_limit_clamps() {
        let mut c = DedupConfig {
            ditto_threshold: 100,
            ..Default::default()
        };
        assert_eq!(c.ditto_limit(), 100);
        c.ditto_threshold = u32::MAX as u64 + 1;
        assert_eq!(c.ditto_limit(), u32::MAX as u64);
    }

    #[test]
    fn clamp_into_range() {
        let c = DedupConfig {
            class_min: TableClass::Duplicate,
            class_max: TableClass::Duplicate,
            ..Default::default()
        };
        assert_eq!(c.clamp_class(TableClass::Ditto), TableClass::Duplicate);
        assert_eq!(c.clamp_class(TableClass::Unique), TableClass::Duplicate);
        assert_eq!(c.classes().collect::<Vec<_>>(), vec![TableClass::Duplicate]);
    }

    #[test]
    fn reject_inverted_class_range() {
        let c = DedupConfig {
            class_min: TableClass::Unique,
            class_max: TableClass::Ditto,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn reject_bad_hash_bits() {
        for bits in [0, 17, 64] {
            let c = DedupConfig {
                hash_bits: bits,
                ..Default::default()
            };
            assert!(c.validate().is_err(), "{} bits accepted", bits);
        }
    }

    #[test]
    fn toml_partial_uses_defaults() {
        let c = DedupConfig::from_toml_str(
            "ditto_threshold = 50\nclass_min = \"duplicate\"\n",
        )
        .unwrap();
        assert_eq!(c.ditto_threshold, 50);
        assert_eq!(c.class_min, TableClass::Duplicate);
        assert_eq!(c.class_max, TableClass::Unique);
        assert!(c.prefetch);
        assert_eq!(c.hash_bits, 8);
    }

    #[test]
    fn toml_invalid_rejected() {
        assert!(DedupConfig::from_toml_str("hash_bits = 0\n").is_err());
        assert!(DedupConfig::from_toml_str("class_min = \"warm\"\n").is_err());
    }

    #[test]
    fn toml_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "prefetch = false").unwrap();
        writeln!(f, "max_resident_entries = 1024").unwrap();
        f.flush().unwrap();

        let c = DedupConfig::from_toml_file(f.path()).unwrap();
        assert!(!c.prefetch);
        assert_eq!(c.max_resident_entries, 1024);

        assert!(DedupConfig::from_toml_file("/nonexistent/ddt.toml").is_err());
    }

    /// Clamping always lands in the configured range, and the range lists
    /// exactly the classes clamping leaves alone.
    #[proptest]
    fn clamp_stays_in_range(
        #[strategy(0usize..DDT_CLASSES)] lo: usize,
        #[strategy(0usize..DDT_CLASSES)] hi: usize,
        #[strategy(0usize..DDT_CLASSES)] c: usize,
    ) {
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let cfg = DedupConfig {
            class_min: class(lo),
            class_max: class(hi),
            ..Default::default()
        };
        let clamped = cfg.clamp_class(class(c));
        prop_assert!(cfg.classes().any(|k| k == clamped));
        prop_assert_eq!(
            cfg.classes().any(|k| k == class(c)),
            clamped == class(c)
        );
    }
}
