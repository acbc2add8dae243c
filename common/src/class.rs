// Copyright 2025 Oxide Computer Company
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Backing object format for a dedup class. Only one format exists today.
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
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Zap,
}

pub const DDT_TYPES: usize = 1;

impl TableType {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TableType::Zap => "zap",
        }
    }

    /// The next type in iteration order, or `None` after the last one.
    pub fn next(self) -> Option<TableType> {
        TableType::iter().nth(self.index() + 1)
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How "hot" a dedup entry is. Lower classes are visited first by a scrub,
/// so the ordering of the variants matters.
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
#[serde(rename_all = "lowercase")]
pub enum TableClass {
    Ditto,
    Duplicate,
    Unique,
}

pub const DDT_CLASSES: usize = 3;

impl TableClass {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TableClass::Ditto => "ditto",
            TableClass::Duplicate => "duplicate",
            TableClass::Unique => "unique",
        }
    }

    pub fn next(self) -> Option<TableClass> {
        TableClass::iter().nth(self.index() + 1)
    }

    /// Every class from `min` to `max`, inclusive.
    pub fn range(
        min: TableClass,
        max: TableClass,
    ) -> impl Iterator<Item = TableClass> + Clone {
        TableClass::iter().filter(move |c| *c >= min && *c <= max)
    }
}

impl fmt::Display for TableClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
