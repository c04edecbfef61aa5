//! Persisted bitstream database records: the solved bit patterns for words,
//! enums, routing muxes and fixed connections, grouped per tile type.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// One configuration memory cell within a tile window, plus the polarity
/// the setting drives it to.  `invert` means the cell is *cleared* when the
/// setting is active.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ConfigBit {
    pub frame: usize,
    pub bit: usize,
    pub invert: bool,
}

impl fmt::Debug for ConfigBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}F{}B{}",
            if self.invert { "!" } else { "" },
            self.frame,
            self.bit
        )
    }
}

/// One arc of a routing mux: the bits selecting `from_wire` as the driver
/// of the mux's sink wire.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipData {
    pub from_wire: String,
    pub bits: BTreeSet<ConfigBit>,
}

fn is_false(x: &bool) -> bool {
    !(*x)
}

/// All known arcs feeding one sink wire.  `full_mux` records that the mux
/// encoding is exhaustive: every legal selection has an explicit pattern,
/// including a possibly all-inverted one for the "no bits set" input.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
pub struct MuxData {
    pub arcs: Vec<PipData>,
    #[serde(default)]
    #[serde(skip_serializing_if = "is_false")]
    pub full_mux: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct WordData {
    pub bits: Vec<BTreeSet<ConfigBit>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub desc: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnumData {
    pub options: BTreeMap<String, BTreeSet<ConfigBit>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub desc: String,
}

/// A permanent connection: `from_wire` always drives the sink, with no
/// configuration bits involved.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub from_wire: String,
}

/// The full solved table for one tile type (or one IP type, in which case
/// only `words` and `enums` may be populated).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
pub struct TileBitsTable {
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pips: BTreeMap<String, MuxData>,
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub words: BTreeMap<String, WordData>,
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub enums: BTreeMap<String, EnumData>,
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub conns: BTreeMap<String, Vec<ConnectionData>>,
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub always_on: BTreeSet<ConfigBit>,
}

impl TileBitsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every bit claimed by any word or enum record in this table, without
    /// polarity.  Used for cross-setting overlap checks and for always-on
    /// harvesting.
    pub fn claimed_setting_bits(&self) -> BTreeSet<(usize, usize)> {
        let word_bits = self
            .words
            .values()
            .flat_map(|w| w.bits.iter())
            .flatten()
            .map(|cb| (cb.frame, cb.bit));
        let enum_bits = self
            .enums
            .values()
            .flat_map(|e| e.options.values())
            .flatten()
            .map(|cb| (cb.frame, cb.bit));
        word_bits.chain(enum_bits).collect()
    }

    /// Every bit claimed by any routing arc in this table, without polarity.
    pub fn claimed_pip_bits(&self) -> BTreeSet<(usize, usize)> {
        self.pips
            .values()
            .flat_map(|m| m.arcs.iter())
            .flat_map(|p| p.bits.iter())
            .map(|cb| (cb.frame, cb.bit))
            .collect()
    }
}
