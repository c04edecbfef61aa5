//! Differential solvers: given a baseline bitstream and variants produced
//! by toggling one configuration dimension at a time, recover the bit
//! patterns encoding words, enums, routing muxes and IP parameters, and
//! commit them to the database.
//!
//! Solving is pure and validate-before-commit: a job-local failure
//! (ambiguous word bit, colliding enum options, conflicting mux arcs, a
//! nonlinear IP address space) returns an error without writing anything
//! for that setting, and never disturbs sibling jobs.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::{debug, warn};
use prjdelta_re_bitstream::{BitImage, ImageDelta, IpDelta};
use prjdelta_re_bsdb::{Database, DbError};
use prjdelta_types::bsdata::ConfigBit;

pub mod gf2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceErrorKind {
    /// A physical bit's flip vector matches no logical bit's signature.
    UnmatchedFlip { addr: u32, bit: u8 },
    /// A physical bit flips as the XOR of several logical bits.
    CompositeFlip { addr: u32, bit: u8 },
    /// Two logical bits are toggled identically in every sample.
    DuplicateSignature { bit_a: usize, bit_b: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    #[error("setting {setting}: logical bit {index} resolves to several bits in {tile}: {bits:?}")]
    Ambiguity {
        setting: String,
        tile: String,
        index: usize,
        bits: Vec<ConfigBit>,
    },
    #[error("setting {setting}: options {option_a} and {option_b} solve to the same pattern in {tile}")]
    EnumCollision {
        setting: String,
        tile: String,
        option_a: String,
        option_b: String,
    },
    #[error("mux {sink}: arcs from {from_a} and {from_b} solve to the same pattern in {tile}")]
    PipConflict {
        sink: String,
        tile: String,
        from_a: String,
        from_b: String,
    },
    #[error("setting {setting}: IP address space is not one-to-one: {kind:?}")]
    AddressSpace {
        setting: String,
        kind: AddressSpaceErrorKind,
    },
    #[error("setting {setting}: not enough sampled values to solve")]
    TooFewValues { setting: String },
    #[error("no tile named {0} in the baseline image")]
    UnknownTile(String),
    #[error("no IP region named {0} in the base address table")]
    MissingRegion(String),
    #[error("setting {setting}: sample does not fit width {width} (got {found})")]
    WidthMismatch {
        setting: String,
        width: usize,
        found: usize,
    },
    #[error("always-on bits of {tile} disagree with earlier tiles of type {tiletype}")]
    AlwaysOnMismatch { tile: String, tiletype: String },
    #[error(transparent)]
    Db(#[from] DbError),
}

impl FuzzError {
    /// Database failures abort the whole run; everything else is local to
    /// one setting or sink.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FuzzError::Db(_))
    }
}

/// Intersection of two deltas, dropping tiles left with no entries.  Used
/// when one logical key is probed by several variants: bits not common to
/// every probe are incidental.
fn intersect_delta(a: &ImageDelta, b: &ImageDelta) -> ImageDelta {
    a.iter()
        .filter_map(|(tile, td)| {
            b.get(tile).map(|d2| {
                let dv: Vec<(usize, usize, bool)> =
                    td.iter().filter(|x| d2.contains(x)).copied().collect();
                (tile.clone(), dv)
            })
        })
        .filter(|(_, dv)| !dv.is_empty())
        .collect()
}

fn merge_sample(deltas: &mut BTreeMap<String, ImageDelta>, key: &str, delta: ImageDelta) {
    match deltas.get_mut(key) {
        Some(d) => *d = intersect_delta(d, &delta),
        None => {
            deltas.insert(key.to_string(), delta);
        }
    }
}

/// Tiles inside the fuzz scope touched by any stored delta.
fn changed_tiles<'a>(
    deltas: impl IntoIterator<Item = &'a ImageDelta>,
    scope: &BTreeSet<String>,
) -> BTreeSet<String> {
    deltas
        .into_iter()
        .flat_map(|d| d.keys())
        .filter(|t| scope.contains(*t))
        .cloned()
        .collect()
}

/// Solves a fixed-width bit-vector setting from one-hot samples.  Each
/// logical bit must map to at most one configuration bit per tile.
pub struct WordFuzzer {
    name: String,
    desc: String,
    width: usize,
    tiles: BTreeSet<String>,
    base: BitImage,
    deltas: BTreeMap<usize, ImageDelta>,
}

impl WordFuzzer {
    pub fn new(
        base: &BitImage,
        fuzz_tiles: &BTreeSet<String>,
        name: &str,
        desc: &str,
        width: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            width,
            tiles: fuzz_tiles.clone(),
            base: base.clone(),
            deltas: BTreeMap::new(),
        }
    }

    /// Store the diff for the variant with logical bit `index` set.
    /// Repeated samples for one index intersect.
    pub fn add_word_sample(&mut self, index: usize, image: &BitImage) -> Result<(), FuzzError> {
        if index >= self.width {
            return Err(FuzzError::WidthMismatch {
                setting: self.name.clone(),
                width: self.width,
                found: index,
            });
        }
        let delta = image.delta(&self.base);
        match self.deltas.get_mut(&index) {
            Some(d) => *d = intersect_delta(d, &delta),
            None => {
                self.deltas.insert(index, delta);
            }
        }
        Ok(())
    }

    pub fn solve(&self, db: &Database) -> Result<(), FuzzError> {
        let changed = changed_tiles(self.deltas.values(), &self.tiles);
        let mut solved: Vec<(String, String, Vec<BTreeSet<ConfigBit>>)> = Vec::new();
        for tile in &changed {
            let mut cbits = Vec::new();
            for i in 0..self.width {
                let bits: Vec<ConfigBit> = self
                    .deltas
                    .get(&i)
                    .and_then(|d| d.get(tile))
                    .into_iter()
                    .flatten()
                    .map(|&(f, b, v)| ConfigBit {
                        frame: f,
                        bit: b,
                        invert: !v,
                    })
                    .collect();
                if bits.len() > 1 {
                    return Err(FuzzError::Ambiguity {
                        setting: self.name.clone(),
                        tile: tile.clone(),
                        index: i,
                        bits,
                    });
                }
                // an empty set records the bit as constant zero
                cbits.push(bits.into_iter().collect());
            }
            let tiletype = self
                .base
                .tile(tile)
                .ok_or_else(|| FuzzError::UnknownTile(tile.clone()))?
                .tiletype
                .clone();
            solved.push((tiletype, tile.clone(), cbits));
        }
        for (tiletype, _tile, cbits) in solved {
            db.add_word(&self.base.family, &tiletype, &self.name, &self.desc, cbits)?;
        }
        db.flush()?;
        Ok(())
    }
}

/// Solves a choice-valued setting from one sample per value.
pub struct EnumFuzzer {
    name: String,
    desc: String,
    tiles: BTreeSet<String>,
    base: BitImage,
    include_zeros: bool,
    assume_zero_base: bool,
    deltas: BTreeMap<String, ImageDelta>,
}

impl EnumFuzzer {
    pub fn new(
        base: &BitImage,
        fuzz_tiles: &BTreeSet<String>,
        name: &str,
        desc: &str,
        include_zeros: bool,
        assume_zero_base: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            tiles: fuzz_tiles.clone(),
            base: base.clone(),
            include_zeros,
            assume_zero_base,
            deltas: BTreeMap::new(),
        }
    }

    pub fn add_enum_sample(&mut self, option: &str, image: &BitImage) {
        let delta = image.delta(&self.base);
        merge_sample(&mut self.deltas, option, delta);
    }

    fn solve_tile(&self, tile: &str) -> Option<BTreeMap<String, BTreeSet<ConfigBit>>> {
        // Bits taking the same value in every sampled option carry no
        // information about this setting and are dropped.
        let all_changed: BTreeSet<(usize, usize, bool)> = self
            .deltas
            .values()
            .filter_map(|d| d.get(tile))
            .flatten()
            .copied()
            .collect();
        let mut bit_sets = self.deltas.values().map(|d| match d.get(tile) {
            Some(td) => td.iter().copied().collect::<BTreeSet<_>>(),
            None => BTreeSet::new(),
        });
        let set0 = bit_sets.next()?;
        let unchanged = bit_sets.fold(set0, |a, b| &a & &b);
        let changed: BTreeSet<(usize, usize, bool)> =
            all_changed.difference(&unchanged).copied().collect();
        if changed.is_empty() {
            return None;
        }
        let mut options = BTreeMap::new();
        for (option, delta) in &self.deltas {
            let bits: BTreeSet<ConfigBit> = match delta.get(tile) {
                None if self.include_zeros => changed
                    .iter()
                    .map(|&(f, b, v)| ConfigBit {
                        frame: f,
                        bit: b,
                        invert: v,
                    })
                    .collect(),
                None if self.assume_zero_base => changed
                    .iter()
                    .filter(|&&(_, _, v)| !v)
                    .map(|&(f, b, v)| ConfigBit {
                        frame: f,
                        bit: b,
                        invert: v,
                    })
                    .collect(),
                None => BTreeSet::new(),
                Some(td) => changed
                    .iter()
                    .filter(|&&(f, b, v)| self.include_zeros || !v || td.contains(&(f, b, v)))
                    .filter(|&&(f, b, v)| {
                        !self.assume_zero_base || v || !td.contains(&(f, b, v))
                    })
                    .map(|&(f, b, v)| ConfigBit {
                        frame: f,
                        bit: b,
                        invert: if td.contains(&(f, b, v)) { !v } else { v },
                    })
                    .collect(),
            };
            options.insert(option.clone(), bits);
        }
        Some(options)
    }

    pub fn solve(&self, db: &Database) -> Result<(), FuzzError> {
        if self.deltas.len() < 2 {
            return Err(FuzzError::TooFewValues {
                setting: self.name.clone(),
            });
        }
        let changed = changed_tiles(self.deltas.values(), &self.tiles);
        let mut solved: Vec<(String, BTreeMap<String, BTreeSet<ConfigBit>>)> = Vec::new();
        for tile in &changed {
            let Some(options) = self.solve_tile(tile) else {
                continue;
            };
            for ((opt_a, bits_a), (opt_b, bits_b)) in options.iter().tuple_combinations() {
                if !bits_a.is_empty() && bits_a == bits_b {
                    return Err(FuzzError::EnumCollision {
                        setting: self.name.clone(),
                        tile: tile.clone(),
                        option_a: opt_a.clone(),
                        option_b: opt_b.clone(),
                    });
                }
            }
            let tiletype = self
                .base
                .tile(tile)
                .ok_or_else(|| FuzzError::UnknownTile(tile.clone()))?
                .tiletype
                .clone();
            solved.push((tiletype, options));
        }
        for (tiletype, options) in solved {
            for (option, bits) in options {
                db.add_enum_option(
                    &self.base.family,
                    &tiletype,
                    &self.name,
                    &option,
                    &self.desc,
                    bits,
                )?;
            }
        }
        db.flush()?;
        Ok(())
    }
}

/// Solves the configuration of one routing mux from one sample per
/// candidate driving wire.
pub struct PipFuzzer {
    to_wire: String,
    tiles: BTreeSet<String>,
    base: BitImage,
    full_mux: bool,
    skip_fixed: bool,
    fixed_conn_tile: String,
    ignore_tiles: BTreeSet<String>,
    deltas: BTreeMap<String, ImageDelta>,
}

impl PipFuzzer {
    pub fn new(
        base: &BitImage,
        fuzz_tiles: &BTreeSet<String>,
        to_wire: &str,
        fixed_conn_tile: &str,
        ignore_tiles: &BTreeSet<String>,
        full_mux: bool,
        skip_fixed: bool,
    ) -> Self {
        Self {
            to_wire: to_wire.to_string(),
            tiles: fuzz_tiles.clone(),
            base: base.clone(),
            full_mux,
            skip_fixed,
            fixed_conn_tile: fixed_conn_tile.to_string(),
            ignore_tiles: ignore_tiles.clone(),
            deltas: BTreeMap::new(),
        }
    }

    pub fn add_pip_sample(&mut self, from_wire: &str, image: &BitImage) {
        let delta = image.delta(&self.base);
        merge_sample(&mut self.deltas, from_wire, delta);
    }

    /// Full-mux pattern over the tile's coverage set: every covered bit
    /// appears, inverted where the sample leaves the cell cleared.
    fn coverage_bits(
        &self,
        tile: &str,
        coverage: &BTreeSet<(usize, usize)>,
        delta: Option<&Vec<(usize, usize, bool)>>,
    ) -> Result<BTreeSet<ConfigBit>, FuzzError> {
        let tile_data = self
            .base
            .tile(tile)
            .ok_or_else(|| FuzzError::UnknownTile(tile.to_string()))?;
        Ok(coverage
            .iter()
            .map(|&(f, b)| {
                let base_val = tile_data.cram.get(f, b);
                let changed = delta
                    .iter()
                    .any(|d| d.contains(&(f, b, !base_val)));
                ConfigBit {
                    frame: f,
                    bit: b,
                    invert: !(base_val ^ changed),
                }
            })
            .collect())
    }

    pub fn solve(&self, db: &Database) -> Result<(), FuzzError> {
        // Arcs whose sample touched tiles outside the fuzz scope are
        // vendor noise and dropped up front.
        let accepted: BTreeMap<&String, &ImageDelta> = self
            .deltas
            .iter()
            .filter(|(from, delta)| {
                let ok = delta
                    .keys()
                    .all(|t| self.tiles.contains(t) || self.ignore_tiles.contains(t));
                if !ok {
                    debug!(
                        "mux {to}: rejecting arc from {from}: out-of-scope changes",
                        to = self.to_wire
                    );
                }
                ok
            })
            .collect();
        let changed = changed_tiles(accepted.values().copied(), &self.tiles);

        if changed.is_empty() {
            // no sample moved any bit: these are permanent connections
            if !self.skip_fixed {
                let conn_tile = self
                    .base
                    .tile(&self.fixed_conn_tile)
                    .ok_or_else(|| FuzzError::UnknownTile(self.fixed_conn_tile.clone()))?;
                for from_wire in accepted.keys() {
                    db.add_conn(
                        &self.base.family,
                        &conn_tile.tiletype,
                        from_wire,
                        &self.to_wire,
                    )?;
                }
                db.flush()?;
            }
            return Ok(());
        }

        let mut solved: Vec<(String, String, BTreeSet<ConfigBit>)> = Vec::new();
        for tile in &changed {
            let coverage: BTreeSet<(usize, usize)> = if self.full_mux {
                accepted
                    .values()
                    .filter_map(|d| d.get(tile))
                    .flatten()
                    .map(|&(f, b, _)| (f, b))
                    .collect()
            } else {
                BTreeSet::new()
            };
            let mut tile_arcs: Vec<(&str, BTreeSet<ConfigBit>)> = Vec::new();
            for (from_wire, delta) in &accepted {
                let bits = if self.full_mux {
                    self.coverage_bits(tile, &coverage, delta.get(tile))?
                } else {
                    delta
                        .get(tile)
                        .into_iter()
                        .flatten()
                        .map(|&(f, b, v)| ConfigBit {
                            frame: f,
                            bit: b,
                            invert: !v,
                        })
                        .collect()
                };
                if bits.is_empty() && self.skip_fixed {
                    continue;
                }
                tile_arcs.push((from_wire.as_str(), bits));
            }
            for ((from_a, bits_a), (from_b, bits_b)) in tile_arcs.iter().tuple_combinations() {
                if !bits_a.is_empty() && bits_a == bits_b {
                    return Err(FuzzError::PipConflict {
                        sink: self.to_wire.clone(),
                        tile: tile.clone(),
                        from_a: (*from_a).to_string(),
                        from_b: (*from_b).to_string(),
                    });
                }
                let pos_a: BTreeSet<_> = bits_a.iter().filter(|cb| !cb.invert).collect();
                let pos_b: BTreeSet<_> = bits_b.iter().filter(|cb| !cb.invert).collect();
                if !pos_a.is_empty() && pos_a != pos_b {
                    if pos_a.is_subset(&pos_b) {
                        warn!(
                            "mux {to}: pattern of arc {from_b} is a superset of {from_a}, check manually",
                            to = self.to_wire
                        );
                    } else if pos_b.is_subset(&pos_a) {
                        warn!(
                            "mux {to}: pattern of arc {from_a} is a superset of {from_b}, check manually",
                            to = self.to_wire
                        );
                    }
                }
            }
            let tiletype = self
                .base
                .tile(tile)
                .ok_or_else(|| FuzzError::UnknownTile(tile.clone()))?
                .tiletype
                .clone();
            for (from_wire, bits) in tile_arcs {
                solved.push((tiletype.clone(), from_wire.to_string(), bits));
            }
        }
        for (tiletype, from_wire, bits) in solved {
            db.add_pip(
                &self.base.family,
                &tiletype,
                &from_wire,
                &self.to_wire,
                bits,
                self.full_mux,
            )?;
        }
        db.flush()?;
        Ok(())
    }
}

/// Diff of an IP region's bytes between a baseline and a variant.
fn ip_region_delta(
    db: &Database,
    ipcore: &str,
    base: &BitImage,
    image: &BitImage,
) -> Result<IpDelta, FuzzError> {
    let baseaddr = db.baseaddr(&image.family, &image.device)?;
    let region = baseaddr
        .regions
        .get(ipcore)
        .ok_or_else(|| FuzzError::MissingRegion(ipcore.to_string()))?;
    Ok(image.ip_delta(base, region.addr, region.addr + (1 << region.abits)))
}

/// Sampling plan for an IP word of `width` logical bits: instead of one
/// sample per bit, `ceil(log2(width + 1))` samples where sample `j`
/// toggles the bits whose Gray-coded index has bit `j` set.  Every logical
/// bit then has a distinct nonzero toggle signature across the samples.
pub fn gray_masks(width: usize) -> Vec<Vec<bool>> {
    let gray = |x: usize| x ^ (x >> 1);
    let samples = usize::BITS as usize - width.leading_zeros() as usize;
    (0..samples)
        .map(|j| (0..width).map(|i| gray(i + 1) >> j & 1 != 0).collect())
        .collect()
}

/// Solves a bit-vector setting living in an IP block's own address space.
/// Samples are keyed by the toggle mask applied to the logical bits; the
/// flip vector of each physical bit across the samples is matched against
/// the logical-bit signatures by GF(2) elimination.
pub struct IpWordFuzzer {
    name: String,
    desc: String,
    ipcore: String,
    iptype: String,
    width: usize,
    base: BitImage,
    deltas: BTreeMap<Vec<bool>, IpDelta>,
}

impl IpWordFuzzer {
    pub fn new(
        base: &BitImage,
        ipcore: &str,
        iptype: &str,
        name: &str,
        desc: &str,
        width: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            ipcore: ipcore.to_string(),
            iptype: iptype.to_string(),
            width,
            base: base.clone(),
            deltas: BTreeMap::new(),
        }
    }

    pub fn add_word_sample(
        &mut self,
        db: &Database,
        set_bits: Vec<bool>,
        image: &BitImage,
    ) -> Result<(), FuzzError> {
        if set_bits.len() != self.width {
            return Err(FuzzError::WidthMismatch {
                setting: self.name.clone(),
                width: self.width,
                found: set_bits.len(),
            });
        }
        let delta = ip_region_delta(db, &self.ipcore, &self.base, image)?;
        self.deltas.insert(set_bits, delta);
        Ok(())
    }

    fn address_space_err(&self, kind: AddressSpaceErrorKind) -> FuzzError {
        FuzzError::AddressSpace {
            setting: self.name.clone(),
            kind,
        }
    }

    pub fn solve(&self, db: &Database) -> Result<(), FuzzError> {
        // signature of logical bit i: the set of samples that toggle it
        let mut signatures = vec![0u64; self.width];
        for (j, mask) in self.deltas.keys().enumerate() {
            for (i, sig) in signatures.iter_mut().enumerate() {
                if mask[i] {
                    *sig |= 1 << j;
                }
            }
        }
        for (i, &sig) in signatures.iter().enumerate() {
            if sig == 0 {
                return Err(FuzzError::TooFewValues {
                    setting: self.name.clone(),
                });
            }
            if let Some(k) = signatures[..i].iter().position(|&s| s == sig) {
                return Err(self.address_space_err(AddressSpaceErrorKind::DuplicateSignature {
                    bit_a: k,
                    bit_b: i,
                }));
            }
        }

        // flip vector and settled polarity of each touched physical bit
        let mut flips: BTreeMap<(u32, u8), (u64, bool)> = BTreeMap::new();
        for (j, delta) in self.deltas.values().enumerate() {
            for &(addr, bit, v) in delta {
                let entry = flips.entry((addr, bit)).or_insert((0, v));
                entry.0 |= 1 << j;
                if entry.1 != v {
                    return Err(self
                        .address_space_err(AddressSpaceErrorKind::UnmatchedFlip { addr, bit }));
                }
            }
        }

        let basis = gf2::Gf2Basis::from_vectors(signatures.iter().copied());
        let mut cbits: Vec<BTreeSet<ConfigBit>> = vec![BTreeSet::new(); self.width];
        for (&(addr, bit), &(mask, v)) in &flips {
            match signatures.iter().position(|&s| s == mask) {
                Some(i) => {
                    cbits[i].insert(ConfigBit {
                        frame: addr as usize,
                        bit: bit as usize,
                        invert: !v,
                    });
                }
                None if basis.contains(mask) => {
                    return Err(
                        self.address_space_err(AddressSpaceErrorKind::CompositeFlip { addr, bit })
                    );
                }
                None => {
                    return Err(
                        self.address_space_err(AddressSpaceErrorKind::UnmatchedFlip { addr, bit })
                    );
                }
            }
        }
        db.ip_add_word(&self.base.family, &self.iptype, &self.name, &self.desc, cbits)?;
        db.flush()?;
        Ok(())
    }
}

/// Choice-valued setting in an IP block's address space.
pub struct IpEnumFuzzer {
    name: String,
    desc: String,
    ipcore: String,
    iptype: String,
    base: BitImage,
    deltas: BTreeMap<String, IpDelta>,
}

impl IpEnumFuzzer {
    pub fn new(base: &BitImage, ipcore: &str, iptype: &str, name: &str, desc: &str) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            ipcore: ipcore.to_string(),
            iptype: iptype.to_string(),
            base: base.clone(),
            deltas: BTreeMap::new(),
        }
    }

    pub fn add_enum_sample(
        &mut self,
        db: &Database,
        option: &str,
        image: &BitImage,
    ) -> Result<(), FuzzError> {
        let delta = ip_region_delta(db, &self.ipcore, &self.base, image)?;
        match self.deltas.get_mut(option) {
            Some(d) => {
                let new: BTreeSet<_> = delta.into_iter().collect();
                d.retain(|x| new.contains(x));
            }
            None => {
                self.deltas.insert(option.to_string(), delta);
            }
        }
        Ok(())
    }

    pub fn solve(&self, db: &Database) -> Result<(), FuzzError> {
        if self.deltas.len() < 2 {
            return Err(FuzzError::TooFewValues {
                setting: self.name.clone(),
            });
        }
        let all_changed: BTreeSet<(u32, u8, bool)> =
            self.deltas.values().flatten().copied().collect();
        let mut bit_sets = self
            .deltas
            .values()
            .map(|d| d.iter().copied().collect::<BTreeSet<_>>());
        let Some(set0) = bit_sets.next() else {
            return Ok(());
        };
        let unchanged = bit_sets.fold(set0, |a, b| &a & &b);
        let changed: BTreeSet<(u32, u8, bool)> =
            all_changed.difference(&unchanged).copied().collect();
        if changed.is_empty() {
            return Ok(());
        }
        let mut solved: Vec<(String, BTreeSet<ConfigBit>)> = Vec::new();
        for (option, delta) in &self.deltas {
            let bits: BTreeSet<ConfigBit> = changed
                .iter()
                .map(|&(addr, bit, v)| ConfigBit {
                    frame: addr as usize,
                    bit: bit as usize,
                    invert: if delta.contains(&(addr, bit, v)) { !v } else { v },
                })
                .collect();
            solved.push((option.clone(), bits));
        }
        for ((opt_a, bits_a), (opt_b, bits_b)) in solved.iter().tuple_combinations() {
            if !bits_a.is_empty() && bits_a == bits_b {
                return Err(FuzzError::EnumCollision {
                    setting: self.name.clone(),
                    tile: self.ipcore.clone(),
                    option_a: opt_a.clone(),
                    option_b: opt_b.clone(),
                });
            }
        }
        for (option, bits) in solved {
            db.ip_add_enum_option(
                &self.base.family,
                &self.iptype,
                &self.name,
                &option,
                &self.desc,
                bits,
            )?;
        }
        db.flush()?;
        Ok(())
    }
}

/// Harvest the always-on bits of every tile type from an empty-design
/// image: whatever is set and not claimed by a known pip, word or enum
/// record belongs to the tile type itself.  Same-type tiles must agree.
pub fn always_on_bits(db: &Database, image: &BitImage) -> Result<(), FuzzError> {
    let mut per_type: BTreeMap<&str, BTreeSet<ConfigBit>> = BTreeMap::new();
    for (name, tile) in &image.tiles {
        let table = db.tile_table(&image.family, &tile.tiletype)?;
        let mut set_bits = tile.cram.set_bits();
        for (f, b) in table.claimed_pip_bits() {
            set_bits.remove(&(f, b));
        }
        for (f, b) in table.claimed_setting_bits() {
            set_bits.remove(&(f, b));
        }
        let always_on: BTreeSet<ConfigBit> = set_bits
            .iter()
            .map(|&(f, b)| ConfigBit {
                frame: f,
                bit: b,
                invert: false,
            })
            .collect();
        match per_type.get(tile.tiletype.as_str()) {
            Some(seen) if *seen != always_on => {
                return Err(FuzzError::AlwaysOnMismatch {
                    tile: name.clone(),
                    tiletype: tile.tiletype.clone(),
                });
            }
            Some(_) => {}
            None => {
                per_type.insert(&tile.tiletype, always_on);
            }
        }
    }
    for (tiletype, always_on) in per_type {
        db.set_always_on(&image.family, tiletype, &always_on)?;
    }
    db.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;

    use assert_matches::assert_matches;
    use prjdelta_types::grid::{
        AddrRegion, BaseAddrs, DeviceData, DevicesFile, FamilyData, TileData, TileGrid,
    };

    use super::*;

    fn cbit(frame: usize, bit: usize) -> ConfigBit {
        ConfigBit {
            frame,
            bit,
            invert: false,
        }
    }

    fn icbit(frame: usize, bit: usize) -> ConfigBit {
        ConfigBit {
            frame,
            bit,
            invert: true,
        }
    }

    fn device() -> DeviceData {
        DeviceData {
            idcode: 0x012B_C043,
            frames: 8,
            bits_per_frame: 16,
            pad_bits_after_frame: 2,
            frame_ecc_bits: 14,
        }
    }

    fn tile(tiletype: &str, x: u32, y: u32, start_frame: usize, start_bit: usize) -> TileData {
        TileData {
            tiletype: tiletype.to_string(),
            x,
            y,
            start_bit,
            start_frame,
            bits: 8,
            frames: 4,
        }
    }

    fn grid() -> TileGrid {
        TileGrid {
            tiles: BTreeMap::from([
                ("R1C1:PLC".to_string(), tile("PLC", 1, 1, 0, 0)),
                ("R2C1:PLC".to_string(), tile("PLC", 1, 2, 0, 8)),
                ("R1C2:CIB".to_string(), tile("CIB", 2, 1, 4, 0)),
            ]),
        }
    }

    fn scratch_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let devices = DevicesFile {
            families: BTreeMap::from([(
                "delta".to_string(),
                FamilyData {
                    devices: BTreeMap::from([("dt-8".to_string(), device())]),
                },
            )]),
        };
        fs::write(
            dir.path().join("devices.json"),
            serde_json::to_string_pretty(&devices).unwrap(),
        )
        .unwrap();
        let baseaddr = BaseAddrs {
            regions: BTreeMap::from([(
                "PLL_0".to_string(),
                AddrRegion {
                    addr: 0x0E00_0000,
                    abits: 8,
                },
            )]),
        };
        fs::create_dir_all(dir.path().join("delta/dt-8")).unwrap();
        fs::write(
            dir.path().join("delta/dt-8/baseaddr.json"),
            serde_json::to_string_pretty(&baseaddr).unwrap(),
        )
        .unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, db)
    }

    fn base_image() -> BitImage {
        BitImage::new("delta", "dt-8", &device(), &grid()).unwrap()
    }

    fn with_bits(base: &BitImage, bits: &[(usize, usize)]) -> BitImage {
        let mut im = base.clone();
        for &(f, b) in bits {
            im.cram.set(f, b, true);
        }
        im.cram_to_tiles();
        im
    }

    fn with_ip(base: &BitImage, writes: &[(u32, u8)]) -> BitImage {
        let mut im = base.clone();
        for &(addr, data) in writes {
            im.ipconfig.insert(addr, data);
        }
        im
    }

    fn plc_scope() -> BTreeSet<String> {
        BTreeSet::from(["R1C1:PLC".to_string()])
    }

    #[test]
    fn word_one_hot_round_trip() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 4);
        for (i, coord) in [(0, 5), (0, 6), (0, 7), (1, 5)].into_iter().enumerate() {
            fuzzer
                .add_word_sample(i, &with_bits(&base, &[coord]))
                .unwrap();
        }
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(
            table.words["X"].bits,
            vec![
                BTreeSet::from([cbit(0, 5)]),
                BTreeSet::from([cbit(0, 6)]),
                BTreeSet::from([cbit(0, 7)]),
                BTreeSet::from([cbit(1, 5)]),
            ]
        );
    }

    #[test]
    fn word_multi_bit_diff_is_ambiguous() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 1);
        fuzzer
            .add_word_sample(0, &with_bits(&base, &[(0, 5), (0, 6)]))
            .unwrap();
        let err = fuzzer.solve(&db).unwrap_err();
        assert_matches!(err, FuzzError::Ambiguity { index: 0, .. });
        assert!(!err.is_fatal());
        // nothing committed for the failed setting
        assert!(db.tile_table("delta", "PLC").unwrap().words.is_empty());
    }

    #[test]
    fn word_unsampled_bit_is_constant_zero() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 2);
        fuzzer
            .add_word_sample(0, &with_bits(&base, &[(0, 5)]))
            .unwrap();
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(table.words["X"].bits[0], BTreeSet::from([cbit(0, 5)]));
        assert!(table.words["X"].bits[1].is_empty());
    }

    #[test]
    fn word_repeated_samples_intersect() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 1);
        fuzzer
            .add_word_sample(0, &with_bits(&base, &[(0, 5), (0, 6)]))
            .unwrap();
        fuzzer
            .add_word_sample(0, &with_bits(&base, &[(0, 5), (0, 7)]))
            .unwrap();
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(table.words["X"].bits, vec![BTreeSet::from([cbit(0, 5)])]);
    }

    #[test]
    fn word_out_of_scope_changes_ignored() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 1);
        // second bit lands in the CIB tile, outside the fuzz scope
        fuzzer
            .add_word_sample(0, &with_bits(&base, &[(0, 5), (5, 1)]))
            .unwrap();
        fuzzer.solve(&db).unwrap();
        assert!(db.tile_table("delta", "CIB").unwrap().words.is_empty());
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(table.words["X"].bits, vec![BTreeSet::from([cbit(0, 5)])]);
    }

    #[test]
    fn word_index_out_of_range() {
        let base = base_image();
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 2);
        let err = fuzzer.add_word_sample(2, &base).unwrap_err();
        assert_matches!(err, FuzzError::WidthMismatch { width: 2, found: 2, .. });
    }

    #[test]
    fn enum_three_option_scenario() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = EnumFuzzer::new(&base, &plc_scope(), "MODE", "", false, false);
        fuzzer.add_enum_sample("A", &with_bits(&base, &[(2, 0)]));
        fuzzer.add_enum_sample("B", &with_bits(&base, &[(2, 1)]));
        fuzzer.add_enum_sample("C", &with_bits(&base, &[(2, 0), (2, 1)]));
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        let opts = &table.enums["MODE"].options;
        assert_eq!(opts["A"], BTreeSet::from([cbit(2, 0)]));
        assert_eq!(opts["B"], BTreeSet::from([cbit(2, 1)]));
        assert_eq!(opts["C"], BTreeSet::from([cbit(2, 0), cbit(2, 1)]));
        // without include_zeros the one-hot patterns stay disjoint
        assert!(opts["A"].is_disjoint(&opts["B"]));
    }

    #[test]
    fn enum_include_zeros_records_cleared_bits() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = EnumFuzzer::new(&base, &plc_scope(), "MODE", "", true, false);
        fuzzer.add_enum_sample("A", &with_bits(&base, &[(2, 0)]));
        fuzzer.add_enum_sample("B", &with_bits(&base, &[(2, 1)]));
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        let opts = &table.enums["MODE"].options;
        assert_eq!(opts["A"], BTreeSet::from([cbit(2, 0), icbit(2, 1)]));
        assert_eq!(opts["B"], BTreeSet::from([icbit(2, 0), cbit(2, 1)]));
    }

    #[test]
    fn enum_assume_zero_base() {
        let (_dir, db) = scratch_db();
        // the baseline itself carries the bit; clearing it is the default
        let empty = base_image();
        let base = with_bits(&empty, &[(2, 0)]);
        let mut fuzzer = EnumFuzzer::new(&base, &plc_scope(), "MODE", "", false, true);
        fuzzer.add_enum_sample("X", &empty);
        fuzzer.add_enum_sample("Y", &base);
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        let opts = &table.enums["MODE"].options;
        assert!(opts["X"].is_empty());
        assert_eq!(opts["Y"], BTreeSet::from([cbit(2, 0)]));
    }

    #[test]
    fn enum_identical_patterns_collide() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = EnumFuzzer::new(&base, &plc_scope(), "MODE", "", false, false);
        fuzzer.add_enum_sample("A", &with_bits(&base, &[(2, 0)]));
        fuzzer.add_enum_sample("B", &with_bits(&base, &[(2, 0)]));
        fuzzer.add_enum_sample("C", &with_bits(&base, &[(2, 1)]));
        let err = fuzzer.solve(&db).unwrap_err();
        assert_matches!(err, FuzzError::EnumCollision { .. });
        assert!(db.tile_table("delta", "PLC").unwrap().enums.is_empty());
    }

    #[test]
    fn enum_needs_two_values() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = EnumFuzzer::new(&base, &plc_scope(), "MODE", "", false, false);
        fuzzer.add_enum_sample("A", &with_bits(&base, &[(2, 0)]));
        assert_matches!(fuzzer.solve(&db), Err(FuzzError::TooFewValues { .. }));
    }

    #[test]
    fn enum_repeated_samples_drop_incidental_bits() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = EnumFuzzer::new(&base, &plc_scope(), "MODE", "", false, false);
        fuzzer.add_enum_sample("A", &with_bits(&base, &[(2, 0), (2, 2)]));
        fuzzer.add_enum_sample("A", &with_bits(&base, &[(2, 0), (2, 3)]));
        fuzzer.add_enum_sample("B", &with_bits(&base, &[(2, 1)]));
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(
            table.enums["MODE"].options["A"],
            BTreeSet::from([cbit(2, 0)])
        );
    }

    #[test]
    fn pip_partial_mux() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M0",
            "R1C1:PLC",
            &BTreeSet::new(),
            false,
            false,
        );
        fuzzer.add_pip_sample("A", &with_bits(&base, &[(0, 0)]));
        fuzzer.add_pip_sample("B", &with_bits(&base, &[(0, 1)]));
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        let mux = &table.pips["M0"];
        assert!(!mux.full_mux);
        assert_eq!(mux.arcs.len(), 2);
        let arc_a = mux.arcs.iter().find(|a| a.from_wire == "A").unwrap();
        assert_eq!(arc_a.bits, BTreeSet::from([cbit(0, 0)]));
    }

    #[test]
    fn pip_full_mux_records_zero_arc() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M0",
            "R1C1:PLC",
            &BTreeSet::new(),
            true,
            false,
        );
        fuzzer.add_pip_sample("A", &with_bits(&base, &[(0, 0)]));
        fuzzer.add_pip_sample("B", &base);
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        let mux = &table.pips["M0"];
        assert!(mux.full_mux);
        // the all-zero selection is present, inverted over the coverage set
        let arc_b = mux.arcs.iter().find(|a| a.from_wire == "B").unwrap();
        assert_eq!(arc_b.bits, BTreeSet::from([icbit(0, 0)]));
        let arc_a = mux.arcs.iter().find(|a| a.from_wire == "A").unwrap();
        assert_eq!(arc_a.bits, BTreeSet::from([cbit(0, 0)]));
    }

    #[test]
    fn pip_conflict_aborts_sink_only() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut bad = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M0",
            "R1C1:PLC",
            &BTreeSet::new(),
            false,
            false,
        );
        bad.add_pip_sample("A", &with_bits(&base, &[(0, 0)]));
        bad.add_pip_sample("B", &with_bits(&base, &[(0, 0)]));
        let err = bad.solve(&db).unwrap_err();
        assert_matches!(err, FuzzError::PipConflict { .. });
        assert!(db.tile_table("delta", "PLC").unwrap().pips.is_empty());

        // a sibling sink in the same job is unaffected
        let mut good = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M1",
            "R1C1:PLC",
            &BTreeSet::new(),
            false,
            false,
        );
        good.add_pip_sample("C", &with_bits(&base, &[(0, 1)]));
        good.add_pip_sample("D", &with_bits(&base, &[(0, 2)]));
        good.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert!(!table.pips.contains_key("M0"));
        assert_eq!(table.pips["M1"].arcs.len(), 2);
    }

    #[test]
    fn pip_out_of_scope_arc_rejected() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        // the sample also disturbs the CIB tile at device frame 5
        let noisy = with_bits(&base, &[(0, 0), (5, 1)]);
        let mut fuzzer = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M0",
            "R1C1:PLC",
            &BTreeSet::new(),
            false,
            true,
        );
        fuzzer.add_pip_sample("A", &noisy);
        fuzzer.solve(&db).unwrap();
        assert!(db.tile_table("delta", "PLC").unwrap().pips.is_empty());

        let ignore = BTreeSet::from(["R1C2:CIB".to_string()]);
        let mut fuzzer = PipFuzzer::new(&base, &plc_scope(), "M0", "R1C1:PLC", &ignore, false, true);
        fuzzer.add_pip_sample("A", &noisy);
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(
            table.pips["M0"].arcs[0].bits,
            BTreeSet::from([cbit(0, 0)])
        );
        // the ignored tile still gets no records
        assert!(db.tile_table("delta", "CIB").unwrap().pips.is_empty());
    }

    #[test]
    fn pip_fixed_connections() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M0",
            "R1C2:CIB",
            &BTreeSet::new(),
            false,
            false,
        );
        fuzzer.add_pip_sample("A", &base);
        fuzzer.add_pip_sample("B", &base);
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "CIB").unwrap();
        let conns: Vec<&str> = table.conns["M0"].iter().map(|c| c.from_wire.as_str()).collect();
        assert_eq!(conns, vec!["A", "B"]);

        // skip_fixed suppresses connection harvesting
        let mut fuzzer = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M1",
            "R1C2:CIB",
            &BTreeSet::new(),
            false,
            true,
        );
        fuzzer.add_pip_sample("A", &base);
        fuzzer.solve(&db).unwrap();
        assert!(!db.tile_table("delta", "CIB").unwrap().conns.contains_key("M1"));
    }

    #[test]
    fn pip_superset_patterns_commit_minimal() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = PipFuzzer::new(
            &base,
            &plc_scope(),
            "M0",
            "R1C1:PLC",
            &BTreeSet::new(),
            false,
            false,
        );
        fuzzer.add_pip_sample("A", &with_bits(&base, &[(0, 0)]));
        fuzzer.add_pip_sample("B", &with_bits(&base, &[(0, 0), (0, 1)]));
        fuzzer.solve(&db).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        let mux = &table.pips["M0"];
        // no subtraction is guessed: each arc keeps its own sampled pattern
        let arc_a = mux.arcs.iter().find(|a| a.from_wire == "A").unwrap();
        let arc_b = mux.arcs.iter().find(|a| a.from_wire == "B").unwrap();
        assert_eq!(arc_a.bits, BTreeSet::from([cbit(0, 0)]));
        assert_eq!(arc_b.bits, BTreeSet::from([cbit(0, 0), cbit(0, 1)]));
    }

    #[test]
    fn resolve_is_idempotent_on_disk() {
        let (dir, db) = scratch_db();
        let base = base_image();
        let samples = [(0, 5), (0, 6)];
        let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), "X", "", 2);
        for (i, coord) in samples.into_iter().enumerate() {
            fuzzer
                .add_word_sample(i, &with_bits(&base, &[coord]))
                .unwrap();
        }
        fuzzer.solve(&db).unwrap();
        let path = dir.path().join("delta/tiletypes/PLC.json");
        let first = fs::read(&path).unwrap();
        let mut again = WordFuzzer::new(&base, &plc_scope(), "X", "", 2);
        for (i, coord) in samples.into_iter().enumerate() {
            again
                .add_word_sample(i, &with_bits(&base, &[coord]))
                .unwrap();
        }
        again.solve(&db).unwrap();
        assert_eq!(first, fs::read(&path).unwrap());
    }

    #[test]
    fn always_on_harvesting() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        db.add_word(
            "delta",
            "PLC",
            "X",
            "",
            vec![BTreeSet::from([cbit(0, 5)])],
        )
        .unwrap();
        // both PLC tiles show (0, 5) and (1, 1) tile-relative; (0, 5) is claimed
        let empty_design = with_bits(&base, &[(0, 5), (1, 1), (0, 13), (1, 9)]);
        always_on_bits(&db, &empty_design).unwrap();
        let table = db.tile_table("delta", "PLC").unwrap();
        assert_eq!(table.always_on, BTreeSet::from([cbit(1, 1)]));
        assert!(db.tile_table("delta", "CIB").unwrap().always_on.is_empty());

        // a same-type tile with different leftover bits is an error
        let uneven = with_bits(&empty_design, &[(2, 14)]);
        let err = always_on_bits(&db, &uneven).unwrap_err();
        assert_matches!(err, FuzzError::AlwaysOnMismatch { .. });
    }

    #[test]
    fn gray_mask_signatures() {
        let gray = |x: usize| x ^ (x >> 1);
        let masks = gray_masks(4);
        assert_eq!(masks.len(), 3);
        let mut sigs = Vec::new();
        for i in 0..4 {
            let mut sig = 0usize;
            for (j, mask) in masks.iter().enumerate() {
                if mask[i] {
                    sig |= 1 << j;
                }
            }
            sigs.push(sig);
        }
        assert_eq!(sigs, vec![gray(1), gray(2), gray(3), gray(4)]);
        assert_eq!(gray_masks(3).len(), 2);
        assert_eq!(gray_masks(1).len(), 1);
    }

    #[test]
    fn ip_word_gray_round_trip() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let width = 3;
        // logical bit i lives at byte 0x10 + i, bit i
        let phys = |i: u32| (0x0E00_0010 + i, 1u8 << i);
        let mut fuzzer = IpWordFuzzer::new(&base, "PLL_0", "PLL", "DIV", "", width);
        for mask in gray_masks(width) {
            let writes: Vec<(u32, u8)> = (0..width)
                .filter(|&i| mask[i])
                .map(|i| phys(i as u32))
                .collect();
            fuzzer
                .add_word_sample(&db, mask, &with_ip(&base, &writes))
                .unwrap();
        }
        fuzzer.solve(&db).unwrap();
        let table = db.ip_table("delta", "PLL").unwrap();
        assert_eq!(
            table.words["DIV"].bits,
            vec![
                BTreeSet::from([cbit(0x10, 0)]),
                BTreeSet::from([cbit(0x11, 1)]),
                BTreeSet::from([cbit(0x12, 2)]),
            ]
        );
    }

    #[test]
    fn ip_word_composite_flip_rejected() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = IpWordFuzzer::new(&base, "PLL_0", "PLL", "DIV", "", 2);
        for mask in gray_masks(2) {
            let mut writes = Vec::new();
            if mask[0] {
                writes.push((0x0E00_0010, 0x01));
            }
            if mask[1] {
                writes.push((0x0E00_0011, 0x01));
            }
            // a parity byte flips as bit0 xor bit1
            if mask[0] != mask[1] {
                writes.push((0x0E00_0020, 0x01));
            }
            fuzzer
                .add_word_sample(&db, mask, &with_ip(&base, &writes))
                .unwrap();
        }
        let err = fuzzer.solve(&db).unwrap_err();
        assert_matches!(
            err,
            FuzzError::AddressSpace {
                kind: AddressSpaceErrorKind::CompositeFlip {
                    addr: 0x20,
                    bit: 0
                },
                ..
            }
        );
        assert!(db.ip_table("delta", "PLL").unwrap().words.is_empty());
    }

    #[test]
    fn ip_word_duplicate_signature_rejected() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = IpWordFuzzer::new(&base, "PLL_0", "PLL", "DIV", "", 2);
        // one sample toggling both logical bits cannot tell them apart
        fuzzer
            .add_word_sample(
                &db,
                vec![true, true],
                &with_ip(&base, &[(0x0E00_0010, 0x03)]),
            )
            .unwrap();
        let err = fuzzer.solve(&db).unwrap_err();
        assert_matches!(
            err,
            FuzzError::AddressSpace {
                kind: AddressSpaceErrorKind::DuplicateSignature { bit_a: 0, bit_b: 1 },
                ..
            }
        );
    }

    #[test]
    fn ip_word_unmatched_flip_rejected() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = IpWordFuzzer::new(&base, "PLL_0", "PLL", "DIV", "", 1);
        // stray flip in the sample that toggles nothing
        fuzzer
            .add_word_sample(&db, vec![false], &with_ip(&base, &[(0x0E00_0020, 0x01)]))
            .unwrap();
        fuzzer
            .add_word_sample(&db, vec![true], &with_ip(&base, &[(0x0E00_0010, 0x01)]))
            .unwrap();
        let err = fuzzer.solve(&db).unwrap_err();
        assert_matches!(
            err,
            FuzzError::AddressSpace {
                kind: AddressSpaceErrorKind::UnmatchedFlip {
                    addr: 0x20,
                    bit: 0
                },
                ..
            }
        );
    }

    #[test]
    fn ip_unknown_region() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = IpWordFuzzer::new(&base, "NOPE", "PLL", "DIV", "", 1);
        let err = fuzzer.add_word_sample(&db, vec![true], &base).unwrap_err();
        assert_matches!(err, FuzzError::MissingRegion(name) if name == "NOPE");
    }

    #[test]
    fn ip_enum_solves_polarity() {
        let (_dir, db) = scratch_db();
        let base = base_image();
        let mut fuzzer = IpEnumFuzzer::new(&base, "PLL_0", "PLL", "MODE", "");
        fuzzer
            .add_enum_sample(&db, "ON", &with_ip(&base, &[(0x0E00_0010, 0x01)]))
            .unwrap();
        fuzzer.add_enum_sample(&db, "OFF", &base).unwrap();
        fuzzer.solve(&db).unwrap();
        let table = db.ip_table("delta", "PLL").unwrap();
        let opts = &table.enums["MODE"].options;
        assert_eq!(opts["ON"], BTreeSet::from([cbit(0x10, 0)]));
        assert_eq!(opts["OFF"], BTreeSet::from([icbit(0x10, 0)]));
    }

    #[test]
    fn concurrent_solving_shares_one_database() {
        use rayon::prelude::*;

        let (_dir, db) = scratch_db();
        let base = base_image();
        let jobs: Vec<(String, (usize, usize))> = (0..8)
            .map(|i| (format!("W{i}"), (0, i)))
            .collect();
        jobs.par_iter().for_each(|(name, coord)| {
            let mut fuzzer = WordFuzzer::new(&base, &plc_scope(), name, "", 1);
            fuzzer
                .add_word_sample(0, &with_bits(&base, &[*coord]))
                .unwrap();
            fuzzer.solve(&db).unwrap();
        });
        let table = db.tile_table("delta", "PLC").unwrap();
        for (name, (f, b)) in jobs {
            assert_eq!(table.words[&name].bits, vec![BTreeSet::from([cbit(f, b)])]);
        }
    }
}
