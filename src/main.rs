use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use rv32sim::bus::Bus;
use rv32sim::emulator::{Emulator, RunOutcome};
use rv32sim::loader;
use std::fs;
use std::path::PathBuf;
use std::process::exit;

#[derive(Parser, Debug)]
#[command(author, version, about = "RV32IMAC testbench simulator", long_about = None)]
struct Args {
    /// Flat binary (or ELF) file loaded into RAM at address 0x0
    #[arg(long, value_name = "FILE")]
    bin: Option<PathBuf>,

    /// Dummy option accepted for compatibility with waveform-enabled
    /// testbenches
    #[arg(long, value_name = "FILE")]
    vcd: Option<PathBuf>,

    /// Print memory contents between START and END (exclusive) after
    /// execution finishes; can be passed multiple times
    #[arg(long, num_args = 2, value_names = ["START", "END"], value_parser = parse_u32, action = clap::ArgAction::Append)]
    dump: Vec<u32>,

    /// Maximum number of cycles to run before exiting
    #[arg(long, value_name = "N", default_value = "100000", value_parser = parse_u64)]
    cycles: u64,

    /// Memory size in units of 1024 bytes
    #[arg(long, value_name = "KIB", default_value = "16384", value_parser = parse_u32)]
    memsize: u32,

    /// Print per-step execution tracing info
    #[arg(long)]
    trace: bool,

    /// Use the exit code written to the I/O exit port as the process exit
    /// code, or -1 on timeout
    #[arg(long)]
    cpuret: bool,
}

/// Accept decimal or 0x-prefixed hex, matching what linker maps and
/// disassembly listings hand people.
fn parse_u32(s: &str) -> Result<u32, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

fn parse_u64(s: &str) -> Result<u64, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

fn main() {
    env_logger::init();

    if std::env::args().len() < 2 {
        let _ = Args::command().print_help();
        exit(-1);
    }
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = err.print();
                exit(0);
            }
            _ => {
                let _ = err.print();
                exit(-1);
            }
        },
    };

    let ram_size = match args.memsize.checked_mul(1024) {
        Some(size) if size & 0x3 == 0 => size,
        _ => {
            eprintln!("Invalid memory size: {} KiB", args.memsize);
            exit(-1);
        }
    };

    if let Some(vcd) = &args.vcd {
        log::debug!("ignoring --vcd {} (no waveform support)", vcd.display());
    }

    let mut emu = Emulator::new(ram_size);

    if let Some(path) = &args.bin {
        let image = match fs::read(path) {
            Ok(image) => image,
            Err(err) => {
                eprintln!("Failed to read {}: {}", path.display(), err);
                exit(-1);
            }
        };
        match loader::load_image(&mut emu.bus.ram, &image) {
            Ok(Some(entry)) => emu.cpu.pc = entry,
            Ok(None) => {}
            Err(err) => {
                eprintln!("{err}");
                exit(-1);
            }
        }
    }

    let outcome = emu.run(args.cycles, args.trace);
    let mut rc = 0;
    match outcome {
        RunOutcome::Halted { exit_code, cycles } => {
            println!("CPU requested halt. Exit code {}", exit_code as i32);
            println!("Ran for {} cycles", cycles);
            if args.cpuret {
                rc = exit_code as i32;
            }
        }
        RunOutcome::CycleLimit => {
            if args.cpuret {
                rc = -1;
            }
        }
    }

    for range in args.dump.chunks(2) {
        let (start, end) = (range[0], range[1]);
        println!("Dumping memory from {:08x} to {:08x}:", start, end);
        for i in 0..end.wrapping_sub(start) {
            let byte = emu.bus.read8(start.wrapping_add(i)).unwrap_or(0);
            print!("{:02x}{}", byte, if i % 16 == 15 { '\n' } else { ' ' });
        }
        println!();
    }

    exit(rc);
}
