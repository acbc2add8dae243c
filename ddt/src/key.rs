// Copyright 2025 Oxide Computer Company
use std::fmt;

use serde::{Deserialize, Serialize};

use ddt_common::ddt_bail;

use crate::{ChecksumAlgo, DdtError, Phys};

pub const SPA_DVAS_PER_BP: usize = 3;
pub const SPA_MINBLOCKSHIFT: u32 = 9;
pub const SPA_MINBLOCKSIZE: u64 = 1 << SPA_MINBLOCKSHIFT;
/// Largest block size a key can encode: 16 bits worth of sectors.
pub const SPA_MAXBLOCKSIZE: u64 = (1 << 16) << SPA_MINBLOCKSHIFT;

pub const DDT_KEY_WORDS: usize = 5;
pub const DDT_KEY_BYTES: usize = DDT_KEY_WORDS * 8;

/// A device virtual address: where one copy of a block lives.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Dva {
    pub vdev: u32,
    pub offset: u64,
    /// Allocated size in bytes. Zero marks an unused address.
    pub asize: u64,
    pub gang: bool,
}

impl Dva {
    pub fn is_valid(&self) -> bool {
        self.asize != 0
    }
}

/// A 256-bit content checksum. Ordering is lexicographic over the words.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Checksum(pub [u64; 4]);

impl Checksum {
    pub fn word(&self, i: usize) -> u64 {
        self.0[i]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:016x}:{:016x}:{:016x}:{:016x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// The parts of a block pointer the dedup table reads or reconstructs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    pub dva: [Dva; SPA_DVAS_PER_BP],
    pub checksum_algo: ChecksumAlgo,
    pub checksum: Checksum,
    /// Logical and physical (post-compression) size in bytes.
    pub lsize: u64,
    pub psize: u64,
    pub compress: u8,
    pub birth: u64,
    /// Zero when the block was born in the same txg as `birth`.
    pub phys_birth: u64,
    pub dedup: bool,
}

impl BlockPointer {
    /// The address that identifies this block: the first copy.
    pub fn identity(&self) -> &Dva {
        &self.dva[0]
    }

    pub fn physical_birth(&self) -> u64 {
        if self.phys_birth != 0 {
            self.phys_birth
        } else {
            self.birth
        }
    }

    pub fn ndvas(&self) -> usize {
        self.dva.iter().filter(|d| d.is_valid()).count()
    }

    pub fn is_gang(&self) -> bool {
        self.dva[0].gang
    }
}

/// Content fingerprint of a dedup table entry: the checksum plus the
/// encoded sizes and compression, packed into `prop`.
///
/// ```text
///  63       40 39  32 31      16 15       0
/// +-----------+------+----------+----------+
/// |  unused   | comp |  psize   |  lsize   |
/// +-----------+------+----------+----------+
/// ```
/// Sizes are stored in 512-byte sectors, minus one.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub struct Key {
    pub cksum: Checksum,
    pub prop: u64,
}

fn encode_size(size: u64) -> u64 {
    debug_assert!(size >= SPA_MINBLOCKSIZE && size <= SPA_MAXBLOCKSIZE);
    debug_assert_eq!(size % SPA_MINBLOCKSIZE, 0);
    ((size >> SPA_MINBLOCKSHIFT) - 1) & 0xffff
}

fn decode_size(bits: u64) -> u64 {
    ((bits & 0xffff) + 1) << SPA_MINBLOCKSHIFT
}

impl Key {
    pub fn new(cksum: Checksum, lsize: u64, psize: u64, compress: u8) -> Key {
        let prop = encode_size(lsize)
            | encode_size(psize) << 16
            | (compress as u64) << 32;
        Key { cksum, prop }
    }

    pub fn from_block_pointer(bp: &BlockPointer) -> Key {
        Key::new(bp.checksum, bp.lsize, bp.psize, bp.compress)
    }

    pub fn lsize(&self) -> u64 {
        decode_size(self.prop)
    }

    pub fn psize(&self) -> u64 {
        decode_size(self.prop >> 16)
    }

    pub fn compress(&self) -> u8 {
        (self.prop >> 32) as u8
    }

    /// The top `bits` bits of checksum word 0. The checksum is already
    /// uniform, so no further mixing is done.
    pub fn hash(&self, bits: u32) -> usize {
        assert!(bits > 0 && bits < usize::BITS);
        (self.cksum.word(0) >> (u64::BITS - bits)) as usize
    }

    /// Build a block pointer for one physical copy of this key, or for the
    /// content alone when `phys` is `None`.
    pub fn to_block_pointer(
        &self,
        checksum_algo: ChecksumAlgo,
        phys: Option<&Phys>,
    ) -> BlockPointer {
        let (dva, birth) = match phys {
            Some(p) => (p.dva, p.phys_birth),
            None => ([Dva::default(); SPA_DVAS_PER_BP], 0),
        };

        BlockPointer {
            dva,
            checksum_algo,
            checksum: self.cksum,
            lsize: self.lsize(),
            psize: self.psize(),
            compress: self.compress(),
            birth,
            phys_birth: birth,
            dedup: false,
        }
    }

    /// Big-endian words, so byte order and key order agree.
    pub fn to_bytes(&self) -> [u8; DDT_KEY_BYTES] {
        let mut out = [0u8; DDT_KEY_BYTES];
        let words = self.cksum.0.iter().chain(std::iter::once(&self.prop));
        for (chunk, w) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&w.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Key, DdtError> {
        if buf.len() != DDT_KEY_BYTES {
            ddt_bail!(
                RecordDecode,
                "key is {} bytes, expected {}",
                buf.len(),
                DDT_KEY_BYTES
            );
        }

        let mut words = [0u64; DDT_KEY_WORDS];
        for (w, chunk) in words.iter_mut().zip(buf.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            *w = u64::from_be_bytes(b);
        }

        Ok(Key {
            cksum: Checksum([words[0], words[1], words[2], words[3]]),
            prop: words[4],
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{:x}", self.cksum, self.prop)
    }
}
