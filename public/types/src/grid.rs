//! Device descriptors: the device index, the per-device tile grid, and the
//! per-device IP base address table.

use std::collections::BTreeMap;

use jzon::JsonValue;
use serde::{Deserialize, Serialize};

/// Contents of `devices.json` at the database root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesFile {
    pub families: BTreeMap<String, FamilyData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyData {
    pub devices: BTreeMap<String, DeviceData>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub idcode: u32,
    pub frames: usize,
    pub bits_per_frame: usize,
    pub pad_bits_after_frame: usize,
    pub frame_ecc_bits: usize,
}

/// Contents of a per-device `tilegrid.json`: where each tile instance sits
/// within the frame matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileGrid {
    pub tiles: BTreeMap<String, TileData>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TileData {
    pub tiletype: String,
    pub x: u32,
    pub y: u32,
    pub start_bit: usize,
    pub start_frame: usize,
    pub bits: usize,
    pub frames: usize,
}

/// Contents of a per-device `baseaddr.json`: the bus address window of each
/// IP configuration region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseAddrs {
    pub regions: BTreeMap<String, AddrRegion>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddrRegion {
    pub addr: u32,
    pub abits: u32,
}

impl From<&BaseAddrs> for JsonValue {
    fn from(baseaddr: &BaseAddrs) -> Self {
        jzon::object! {
            regions: jzon::object::Object::from_iter(baseaddr.regions.iter().map(|(name, region)| {
                (name.as_str(), jzon::object! {
                    addr: region.addr,
                    abits: region.abits,
                })
            })),
        }
    }
}
