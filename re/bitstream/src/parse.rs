//! Parser for the vendor configuration bitstream container.
//!
//! The container is a comment section followed by a preamble and a command
//! stream.  Frame data carries a per-frame 14-bit ECC and a running CRC16
//! checked at explicit check tokens; IP configuration is carried by bus
//! address / bus write commands outside the frame matrix.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use prjdelta_types::grid::{DeviceData, TileGrid};

use crate::BitImage;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no preamble found in bitstream")]
    NoPreamble,
    #[error("bitstream truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("IDCODE mismatch: device has 0x{expected:08X}, bitstream checks 0x{found:08X}")]
    IdcodeMismatch { expected: u32, found: u32 },
    #[error("unknown command 0x{opcode:02X} at offset {offset}")]
    UnknownCommand { opcode: u8, offset: usize },
    #[error("unsupported frame write config byte 0x{config:02X}")]
    BadFrameConfig { config: u8 },
    #[error("CRC mismatch at offset {offset}: computed 0x{computed:04X}, stored 0x{stored:04X}")]
    CrcMismatch {
        computed: u16,
        stored: u16,
        offset: usize,
    },
    #[error("missing frame padding byte at offset {offset}")]
    BadFramePad { offset: usize },
    #[error("frame address 0x{addr:08X} out of range for device with {frames} frames")]
    FrameOutOfRange { addr: u32, frames: usize },
    #[error("frame or bus data before IDCODE check")]
    MissingIdcode,
    #[error("tile {tile} window lies outside the device frame matrix")]
    TileOutOfRange { tile: String },
}

// Magic sequences
const COMMENT_START: [u8; 2] = [0xFF, 0x00];
const COMMENT_END: [u8; 2] = [0x00, 0xFF];
const PREAMBLE: [u8; 4] = [0xFF, 0xFF, 0xBD, 0xB3];

// Commands
const LSC_RESET_CRC: u8 = 0b00111011;
const VERIFY_ID: u8 = 0b11100010;
const LSC_PROG_CNTRL0: u8 = 0b00100010;
const LSC_INIT_ADDRESS: u8 = 0b01000110;
const LSC_WRITE_ADDRESS: u8 = 0b10110100;
const LSC_PROG_INCR_RTI: u8 = 0b10000010;
const ISC_PROGRAM_USERCODE: u8 = 0b11000010;
const LSC_BUS_ADDRESS: u8 = 0b11110110;
const LSC_BUS_WRITE: u8 = 0b01110010;
const ISC_PROGRAM_DONE: u8 = 0b01011110;
const LSC_POWER_CTRL: u8 = 0b01010110;
const DUMMY: u8 = 0b11111111;

// Frame load settings byte expected with LSC_PROG_INCR_RTI
const FRAME_CFG: u8 = 0x91;

const CRC16_POLY: u16 = 0x8005;
const CRC16_INIT: u16 = 0x0000;

const ECC_POLY: u16 = 0x202D;
const ECC_INIT: u16 = 0x0000;

pub(crate) fn crc16_update(mut crc: u16, val: u8) -> u16 {
    for i in (0..8).rev() {
        let bit_flag = crc >> 15;
        crc <<= 1;
        crc |= ((val >> i) & 1) as u16;
        if bit_flag != 0 {
            crc ^= CRC16_POLY;
        }
    }
    crc
}

pub(crate) fn crc16_finalise(mut crc: u16) -> u16 {
    for _ in 0..16 {
        let bit_flag = (crc >> 15) & 1;
        crc <<= 1;
        if bit_flag != 0 {
            crc ^= CRC16_POLY;
        }
    }
    crc
}

pub(crate) fn ecc14_update(mut ecc: u16, val: bool) -> u16 {
    let bit_flag = ecc >> 13;
    ecc = ((ecc << 1) | (val as u16)) & 0x3FFF;
    if bit_flag != 0 {
        ecc ^= ECC_POLY;
    }
    ecc
}

pub(crate) fn ecc14_finalise(mut ecc: u16) -> u16 {
    for _ in 0..14 {
        ecc = ecc14_update(ecc, false);
    }
    ecc
}

pub struct BitstreamParser<'a> {
    data: &'a [u8],
    index: usize,
    crc16: u16,
    metadata: Vec<String>,
}

impl<'a> BitstreamParser<'a> {
    pub fn parse_file(
        path: impl AsRef<Path>,
        family: &str,
        device: &str,
        data: &DeviceData,
        grid: &TileGrid,
    ) -> Result<BitImage, ParseError> {
        let buffer = fs::read(path)?;
        // not Self::parse: that would borrow the local buffer for 'a
        BitstreamParser::parse(&buffer, family, device, data, grid)
    }

    pub fn parse(
        bytes: &'a [u8],
        family: &str,
        device: &str,
        data: &DeviceData,
        grid: &TileGrid,
    ) -> Result<BitImage, ParseError> {
        let mut parser = BitstreamParser {
            data: bytes,
            index: 0,
            crc16: CRC16_INIT,
            metadata: Vec::new(),
        };
        let mut image = BitImage::new(family, device, data, grid)?;
        parser.parse_container()?;
        parser.parse_commands(&mut image)?;
        image.metadata = parser.metadata;
        image.cram_to_tiles();
        Ok(image)
    }

    fn get_byte(&mut self) -> Result<u8, ParseError> {
        let Some(&val) = self.data.get(self.index) else {
            return Err(ParseError::Truncated { offset: self.index });
        };
        self.index += 1;
        self.crc16 = crc16_update(self.crc16, val);
        Ok(val)
    }

    // Opcode bytes update the CRC unless they are dummy padding.
    fn get_opcode_byte(&mut self) -> Result<u8, ParseError> {
        let Some(&val) = self.data.get(self.index) else {
            return Err(ParseError::Truncated { offset: self.index });
        };
        self.index += 1;
        if val != DUMMY {
            self.crc16 = crc16_update(self.crc16, val);
        }
        Ok(val)
    }

    fn get_u16(&mut self) -> Result<u16, ParseError> {
        let mut val = (self.get_byte()? as u16) << 8;
        val |= self.get_byte()? as u16;
        Ok(val)
    }

    fn get_u32(&mut self) -> Result<u32, ParseError> {
        let mut val = (self.get_byte()? as u32) << 24;
        val |= (self.get_byte()? as u32) << 16;
        val |= (self.get_byte()? as u32) << 8;
        val |= self.get_byte()? as u32;
        Ok(val)
    }

    fn copy_bytes(&mut self, dest: &mut [u8]) -> Result<(), ParseError> {
        for byte in dest.iter_mut() {
            *byte = self.get_byte()?;
        }
        Ok(())
    }

    fn skip_bytes(&mut self, len: usize) -> Result<(), ParseError> {
        for _ in 0..len {
            self.get_byte()?;
        }
        Ok(())
    }

    // Consume a token if the stream matches it.
    fn check_token(&mut self, token: &[u8]) -> bool {
        if self.data[self.index..].starts_with(token) {
            self.index += token.len();
            true
        } else {
            false
        }
    }

    fn check_crc16(&mut self) -> Result<(), ParseError> {
        let computed = crc16_finalise(self.crc16);
        self.crc16 = CRC16_INIT;
        let offset = self.index;
        let stored = self.get_u16()?;
        // get_u16 feeds the stored CRC into the accumulator; restart clean
        self.crc16 = CRC16_INIT;
        if computed != stored {
            return Err(ParseError::CrcMismatch {
                computed,
                stored,
                offset,
            });
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.index >= self.data.len()
    }

    // Consume comment metadata up to and including the preamble.
    fn parse_container(&mut self) -> Result<(), ParseError> {
        let mut in_metadata = false;
        let mut curr_meta = String::new();
        while !self.done() {
            if self.check_token(&PREAMBLE) {
                debug!("bitstream start at {}", self.index);
                return Ok(());
            }
            if !in_metadata && self.check_token(&COMMENT_START) {
                in_metadata = true;
                continue;
            }
            if in_metadata && self.check_token(&COMMENT_END) {
                if !curr_meta.is_empty() {
                    self.metadata.push(std::mem::take(&mut curr_meta));
                }
                in_metadata = false;
                continue;
            }
            let ch = self.get_byte()?;
            if in_metadata {
                if ch == 0x00 {
                    self.metadata.push(std::mem::take(&mut curr_meta));
                } else {
                    curr_meta.push(ch as char);
                }
            }
        }
        Err(ParseError::NoPreamble)
    }

    fn parse_frames(
        &mut self,
        image: &mut BitImage,
        curr_frame: &mut u32,
        count: u16,
    ) -> Result<(), ParseError> {
        let bits_per_frame = image.data.bits_per_frame;
        let pad_bits = image.data.frame_ecc_bits + image.data.pad_bits_after_frame;
        let mut frame_bytes = vec![0u8; (bits_per_frame + 14 + 7) / 8];
        let total = frame_bytes.len();
        debug!("write {count} frames at 0x{curr_frame:08x}");
        for _ in 0..count {
            let frame_idx = *curr_frame as usize;
            if frame_idx >= image.cram.frames {
                return Err(ParseError::FrameOutOfRange {
                    addr: *curr_frame,
                    frames: image.cram.frames,
                });
            }
            self.copy_bytes(&mut frame_bytes)?;
            let mut ecc = ECC_INIT;
            for j in (0..bits_per_frame).rev() {
                let ofs = j + pad_bits;
                let val = (frame_bytes[(total - 1) - (ofs / 8)] >> (ofs % 8)) & 1 == 1;
                if val {
                    image.cram.set(frame_idx, j, true);
                }
                ecc = ecc14_update(ecc, val);
            }
            let stored_ecc =
                ((frame_bytes[total - 2] as u16) << 8 | frame_bytes[total - 1] as u16) & 0x3FFF;
            let computed_ecc = ecc14_finalise(ecc);
            if stored_ecc != computed_ecc {
                // LUT RAM initialisation regions are masked from the ECC,
                // so a mismatch is not necessarily a corrupt stream.
                warn!(
                    "frame 0x{curr_frame:08x}: ECC mismatch, stored {stored_ecc:014b} computed {computed_ecc:014b}"
                );
            }
            self.check_crc16()?;
            let offset = self.index;
            if self.get_byte()? != 0xFF {
                return Err(ParseError::BadFramePad { offset });
            }
            *curr_frame += 1;
        }
        Ok(())
    }

    fn parse_commands(&mut self, image: &mut BitImage) -> Result<(), ParseError> {
        let mut curr_frame: u32 = 0;
        let mut bus_addr: u32 = 0;
        let mut seen_idcode = false;
        while !self.done() {
            let offset = self.index;
            let cmd = self.get_opcode_byte()?;
            match cmd {
                LSC_RESET_CRC => {
                    debug!("reset CRC");
                    self.skip_bytes(3)?;
                    self.crc16 = CRC16_INIT;
                }
                LSC_PROG_CNTRL0 => {
                    self.skip_bytes(3)?;
                    let ctrl0 = self.get_u32()?;
                    debug!("set CTRL0 to 0x{ctrl0:08X}");
                }
                VERIFY_ID => {
                    self.skip_bytes(3)?;
                    let idcode = self.get_u32()?;
                    debug!("check IDCODE is 0x{idcode:08X}");
                    if idcode != image.data.idcode {
                        return Err(ParseError::IdcodeMismatch {
                            expected: image.data.idcode,
                            found: idcode,
                        });
                    }
                    seen_idcode = true;
                }
                LSC_INIT_ADDRESS => {
                    self.skip_bytes(3)?;
                    debug!("reset frame address");
                    curr_frame = 0;
                }
                LSC_WRITE_ADDRESS => {
                    self.skip_bytes(3)?;
                    curr_frame = self.get_u32()?;
                    debug!("set frame address to 0x{curr_frame:08X}");
                }
                LSC_PROG_INCR_RTI => {
                    let config = self.get_byte()?;
                    let count = self.get_u16()?;
                    if config != FRAME_CFG {
                        return Err(ParseError::BadFrameConfig { config });
                    }
                    if !seen_idcode {
                        return Err(ParseError::MissingIdcode);
                    }
                    self.parse_frames(image, &mut curr_frame, count)?;
                }
                LSC_POWER_CTRL => {
                    self.skip_bytes(2)?;
                    let pwr = self.get_byte()?;
                    debug!("power control: {pwr}");
                }
                ISC_PROGRAM_USERCODE => {
                    let cmp_crc = self.get_byte()? & 0x80 == 0x80;
                    self.skip_bytes(2)?;
                    let usercode = self.get_u32()?;
                    debug!("set usercode to 0x{usercode:08X}");
                    if cmp_crc {
                        self.check_crc16()?;
                    }
                }
                LSC_BUS_ADDRESS => {
                    self.skip_bytes(3)?;
                    bus_addr = self.get_u32()?;
                    debug!("set bus address to 0x{bus_addr:08X}");
                }
                LSC_BUS_WRITE => {
                    let config = self.get_byte()?;
                    let cmp_crc = config & 0x80 == 0x80;
                    let byte_count = self.get_u16()? as usize;
                    if !seen_idcode {
                        return Err(ParseError::MissingIdcode);
                    }
                    for _ in 0..byte_count {
                        let val = self.get_byte()?;
                        image.ipconfig.insert(bus_addr, val);
                        bus_addr += 1;
                    }
                    if cmp_crc {
                        self.check_crc16()?;
                    }
                }
                ISC_PROGRAM_DONE => {
                    self.skip_bytes(3)?;
                    debug!("done");
                }
                DUMMY => {}
                _ => {
                    return Err(ParseError::UnknownCommand {
                        opcode: cmd,
                        offset,
                    });
                }
            }
        }
        if !seen_idcode {
            return Err(ParseError::MissingIdcode);
        }
        Ok(())
    }
}
