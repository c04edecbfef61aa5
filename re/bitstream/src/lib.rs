//! In-memory representation of one synthesized bitstream and the diff
//! primitives the solvers are built on.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use bitvec::vec::BitVec;
use prjdelta_types::grid::{DeviceData, TileGrid};

mod parse;

pub use parse::{BitstreamParser, ParseError};

/// Dense 2D bit array, `frames` x `bits`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BitGrid {
    pub frames: usize,
    pub bits: usize,
    data: BitVec,
}

impl BitGrid {
    pub fn new(frames: usize, bits: usize) -> Self {
        Self {
            frames,
            bits,
            data: BitVec::repeat(false, frames * bits),
        }
    }

    pub fn get(&self, frame: usize, bit: usize) -> bool {
        self.data[frame * self.bits + bit]
    }

    pub fn set(&mut self, frame: usize, bit: usize, val: bool) {
        self.data.set(frame * self.bits + bit, val);
    }

    /// Fill this grid from a window of a larger one.
    pub fn copy_from_window(&mut self, from: &Self, start_frame: usize, start_bit: usize) {
        for f in 0..self.frames {
            for b in 0..self.bits {
                self.data.set(
                    f * self.bits + b,
                    from.get(f + start_frame, b + start_bit),
                );
            }
        }
    }

    pub fn any(&self) -> bool {
        self.data.any()
    }

    pub fn set_bits(&self) -> BTreeSet<(usize, usize)> {
        self.data
            .iter_ones()
            .map(|i| (i / self.bits, i % self.bits))
            .collect()
    }

    /// Differences against a baseline, as (frame, bit, new value).
    pub fn delta(&self, base: &Self) -> Vec<(usize, usize, bool)> {
        assert_eq!(self.frames, base.frames);
        assert_eq!(self.bits, base.bits);
        let mut res = Vec::new();
        let mut changed = self.data.clone();
        changed ^= &base.data;
        for i in changed.iter_ones() {
            res.push((i / self.bits, i % self.bits, self.data[i]));
        }
        res
    }
}

/// One tile instance's window into the frame matrix, with its own copy of
/// the configuration bits.
#[derive(Debug, Clone)]
pub struct TileImage {
    pub tiletype: String,
    pub x: u32,
    pub y: u32,
    pub start_bit: usize,
    pub start_frame: usize,
    pub cram: BitGrid,
}

/// Per-tile differences between two images: tile name to a list of
/// (frame, bit, new value), tile-relative.  Tiles with no differences are
/// absent.
pub type ImageDelta = BTreeMap<String, Vec<(usize, usize, bool)>>;

/// Differences within one IP configuration region: (offset, bit, new value),
/// with `offset` relative to the region base address.
pub type IpDelta = Vec<(u32, u8, bool)>;

/// One parsed bitstream: the whole-device frame matrix, its per-tile
/// windows, the byte-addressed IP configuration space, and any comment
/// metadata found before the preamble.
#[derive(Debug, Clone)]
pub struct BitImage {
    pub family: String,
    pub device: String,
    pub data: DeviceData,
    pub cram: BitGrid,
    pub tiles: BTreeMap<String, TileImage>,
    pub ipconfig: BTreeMap<u32, u8>,
    pub metadata: Vec<String>,
}

impl BitImage {
    /// Create an empty image for a device, with all tile windows validated
    /// against the device's frame matrix.
    pub fn new(
        family: &str,
        device: &str,
        data: &DeviceData,
        grid: &TileGrid,
    ) -> Result<Self, ParseError> {
        let mut tiles = BTreeMap::new();
        for (name, td) in &grid.tiles {
            if td.start_frame + td.frames > data.frames
                || td.start_bit + td.bits > data.bits_per_frame
            {
                return Err(ParseError::TileOutOfRange { tile: name.clone() });
            }
            tiles.insert(
                name.clone(),
                TileImage {
                    tiletype: td.tiletype.clone(),
                    x: td.x,
                    y: td.y,
                    start_bit: td.start_bit,
                    start_frame: td.start_frame,
                    cram: BitGrid::new(td.frames, td.bits),
                },
            );
        }
        Ok(Self {
            family: family.to_string(),
            device: device.to_string(),
            data: data.clone(),
            cram: BitGrid::new(data.frames, data.bits_per_frame),
            tiles,
            ipconfig: BTreeMap::new(),
            metadata: Vec::new(),
        })
    }

    /// Refresh the per-tile windows from the whole-device matrix.
    pub fn cram_to_tiles(&mut self) {
        for tile in self.tiles.values_mut() {
            tile.cram
                .copy_from_window(&self.cram, tile.start_frame, tile.start_bit);
        }
    }

    pub fn tile(&self, name: &str) -> Option<&TileImage> {
        self.tiles.get(name)
    }

    /// Per-tile symmetric difference against a baseline image of the same
    /// device.
    pub fn delta(&self, base: &Self) -> ImageDelta {
        assert_eq!(self.device, base.device);
        self.tiles
            .iter()
            .map(|(name, tile)| {
                let base_tile = &base.tiles[name];
                (name.clone(), tile.cram.delta(&base_tile.cram))
            })
            .filter(|(_, d)| !d.is_empty())
            .collect()
    }

    /// Bit-level differences of the IP configuration bytes within
    /// `[start_addr, end_addr)`.
    pub fn ip_delta(&self, base: &Self, start_addr: u32, end_addr: u32) -> IpDelta {
        let mut delta = IpDelta::new();
        for addr in start_addr..end_addr {
            let new = *self.ipconfig.get(&addr).unwrap_or(&0x00);
            let old = *base.ipconfig.get(&addr).unwrap_or(&0x00);
            for bit in 0..8 {
                if (new >> bit) & 1 != (old >> bit) & 1 {
                    delta.push((addr - start_addr, bit, (new >> bit) & 1 != 0));
                }
            }
        }
        delta
    }

    /// Dump the image to a simple text format for debugging.
    pub fn print(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, ".device {}", self.device)?;
        for m in &self.metadata {
            writeln!(out, ".metadata {m}")?;
        }
        for (name, tile) in &self.tiles {
            if tile.cram.any() {
                writeln!(out, ".tile {}:{}", name, tile.tiletype)?;
                for (f, b) in tile.cram.set_bits() {
                    writeln!(out, "F{f}B{b}")?;
                }
            }
        }
        for (addr, data) in &self.ipconfig {
            writeln!(out, ".write 0x{addr:08x} 0x{data:02x}")?;
        }
        Ok(())
    }
}
