// Copyright 2025 Oxide Computer Company
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Checksum functions a block pointer can name. The discriminant is the
/// on-disk id, so the order here is fixed.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgo {
    Inherit,
    On,
    Off,
    Label,
    GangHeader,
    Zilog,
    Fletcher2,
    Fletcher4,
    Sha256,
    Zilog2,
    Sha1Crc32,
    NoParity,
}

pub const CHECKSUM_FUNCTIONS: usize = 12;

#[derive(Debug)]
pub struct ChecksumInfo {
    pub name: &'static str,
    /// Strong enough to repair a damaged copy from.
    pub correctable: bool,
    /// Checksum is stored in the block itself, not the block pointer.
    pub embedded: bool,
    /// Strong enough to address content by, without verifying the data.
    pub dedup: bool,
}

const fn info(
    name: &'static str,
    correctable: bool,
    embedded: bool,
    dedup: bool,
) -> ChecksumInfo {
    ChecksumInfo {
        name,
        correctable,
        embedded,
        dedup,
    }
}

static CHECKSUM_TABLE: [ChecksumInfo; CHECKSUM_FUNCTIONS] = [
    info("inherit", false, false, false),
    info("on", false, false, false),
    info("off", false, false, false),
    info("label", true, true, false),
    info("gang_header", true, true, false),
    info("zilog", false, true, false),
    info("fletcher2", false, false, false),
    info("fletcher4", true, false, false),
    info("sha256", true, false, true),
    info("zilog2", false, true, false),
    info("sha1crc32", false, false, true),
    info("noparity", false, false, false),
];

impl ChecksumAlgo {
    pub fn id(self) -> usize {
        self as usize
    }

    pub fn from_id(id: usize) -> Option<ChecksumAlgo> {
        ChecksumAlgo::iter().nth(id)
    }

    pub fn info(self) -> &'static ChecksumInfo {
        &CHECKSUM_TABLE[self.id()]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn dedup(self) -> bool {
        self.info().dedup
    }

    pub fn next(self) -> Option<ChecksumAlgo> {
        Self::from_id(self.id() + 1)
    }
}

impl fmt::Display for ChecksumAlgo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
