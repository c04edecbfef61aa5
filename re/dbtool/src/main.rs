use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jzon::JsonValue;
use prjdelta_re_bitstream::BitstreamParser;
use prjdelta_re_bsdb::Database;
use simple_error::bail;

#[derive(Debug, Parser)]
#[command(name = "prjdelta-dbtool", about = "Inspect and export the bitstream database")]
struct Args {
    /// database root directory
    db: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List known families and devices
    Devices,
    /// Print the solved table of one tile type
    DumpTile { family: String, tiletype: String },
    /// Show per-tile bit differences between two bitstreams
    Diff {
        device: String,
        base: PathBuf,
        changed: PathBuf,
    },
    /// Export the IP base address table of a device
    ExportBaseaddr {
        family: String,
        device: String,
        /// write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let db = Database::open(&args.db)?;
    match args.command {
        Command::Devices => {
            for family in db.families() {
                println!("{family}:");
                for (device, data) in db.devices(family) {
                    println!(
                        "  {device}: idcode 0x{idcode:08x}, {frames} frames x {bits} bits",
                        idcode = data.idcode,
                        frames = data.frames,
                        bits = data.bits_per_frame,
                    );
                }
            }
        }
        Command::DumpTile { family, tiletype } => {
            let table = db.tile_table(&family, &tiletype)?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::Diff {
            device,
            base,
            changed,
        } => {
            let Some((family, device, data)) = db.device_by_name(&device) else {
                bail!("unknown device {device}");
            };
            let grid = db.tilegrid(&family, &device)?;
            let base = BitstreamParser::parse_file(&base, &family, &device, &data, &grid)?;
            let changed = BitstreamParser::parse_file(&changed, &family, &device, &data, &grid)?;
            for (tile, bits) in changed.delta(&base) {
                println!("{tile}:");
                for (frame, bit, value) in bits {
                    println!("  F{frame}B{bit} {}", if value { "0 -> 1" } else { "1 -> 0" });
                }
            }
            let addrs: BTreeSet<u32> = base
                .ipconfig
                .keys()
                .chain(changed.ipconfig.keys())
                .copied()
                .collect();
            for addr in addrs {
                let old = base.ipconfig.get(&addr).copied().unwrap_or(0);
                let new = changed.ipconfig.get(&addr).copied().unwrap_or(0);
                if old != new {
                    println!("0x{addr:08x}: 0x{old:02x} -> 0x{new:02x}");
                }
            }
        }
        Command::ExportBaseaddr {
            family,
            device,
            output,
        } => {
            let baseaddr = db.baseaddr(&family, &device)?;
            let json = JsonValue::from(&*baseaddr);
            let text = json.pretty(4);
            match output {
                Some(path) => fs::write(path, text)?,
                None => println!("{text}"),
            }
        }
    }
    Ok(())
}
