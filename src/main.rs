use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use bk72xx::analysis::{kvstorage, rbl};
use bk72xx::layout;
use bk72xx::proto::packet::EraseSize;
use bk72xx::Session;

mod cli;

use cli::{AnalyzeCommand, Command, FlashCommand, Opts};

fn open_session(opts: &Opts) -> Result<Session<Box<dyn serialport::SerialPort>>> {
    let port = serialport::new(&opts.serial_port, opts.link_baud_rate)
        .open()
        .with_context(|| format!("failed to open serial port '{}'", opts.serial_port))?;

    let mut session = Session::new(
        port,
        opts.baud_rate,
        opts.link_baud_rate,
        Duration::from_millis(opts.command_timeout_ms),
        Duration::from_millis(opts.link_timeout_ms),
    );
    session.connect().context("failed to connect to device")?;
    Ok(session)
}

fn run_info(opts: &Opts) -> Result<()> {
    let session = open_session(opts)?;
    println!("chip type:        {:?}", session.chip_type);
    println!("protocol type:    {:?}", session.protocol_type);
    println!("boot version:     {:?}", session.bk_boot_version);
    println!("chip ID register: {:?}", session.bk_chip_id.map(|id| format!("0x{:08X}", id)));
    println!("flash size:       0x{:X}", session.flash_size);
    Ok(())
}

fn run_flash(opts: &Opts, cmd: &FlashCommand) -> Result<()> {
    let mut session = open_session(opts)?;
    match cmd {
        FlashCommand::Read(args) => {
            let data = session
                .flash_read_bytes(args.address, args.size, args.crc_check)
                .context("flash read failed")?;
            fs::write(&args.filename, &data)
                .with_context(|| format!("failed to write '{}'", args.filename.display()))?;
            println!("read {} byte(s) to {}", data.len(), args.filename.display());
        }
        FlashCommand::Write(args) => {
            let data = fs::read(&args.filename)
                .with_context(|| format!("failed to read '{}'", args.filename.display()))?;
            let total = data.len();
            session
                .program_flash(
                    &data,
                    args.address,
                    args.crc_check,
                    args.really_erase,
                    args.dry_run,
                    |written| {
                        println!("wrote {}/{} byte(s)", written, total);
                        Ok(())
                    },
                )
                .context("flash write failed")?;
        }
        FlashCommand::Erase(args) => {
            let mut addr = args.address & !0xFFF;
            let end = (args.address + args.size + 0xFFF) & !0xFFF;
            while addr < end {
                session
                    .flash_erase_block(addr, EraseSize::Sector4K)
                    .with_context(|| format!("erase failed at 0x{:X}", addr))?;
                addr += 0x1000;
            }
            println!("erased 0x{:X} byte(s) at 0x{:X}", args.size, args.address);
        }
    }
    Ok(())
}

fn run_analyze(cmd: &AnalyzeCommand) -> Result<()> {
    match cmd {
        AnalyzeCommand::Rbl(args) => {
            let data =
                fs::read(&args.dump).with_context(|| format!("failed to read '{}'", args.dump.display()))?;
            let layout = layout::layout_by_name(&args.layout);
            fs::create_dir_all(&args.output_directory)?;

            for offset in rbl::scan_containers(&data) {
                let container = match rbl::parse_container(&data, offset, layout) {
                    Ok(container) => container,
                    Err(e) => {
                        println!("skipping container @ 0x{:X}: {}", offset, e);
                        continue;
                    }
                };
                let name = container.header.name.clone();
                match container.payload {
                    Some(payload) => {
                        let path = args.output_directory.join(format!("{}.bin", name));
                        fs::write(&path, &payload)?;
                        println!("extracted '{}' ({} byte(s)) to {}", name, payload.len(), path.display());
                    }
                    None => println!("'{}' @ 0x{:X}: payload CRC mismatch, skipped", name, offset),
                }
            }
        }
        AnalyzeCommand::Storage(args) => {
            let data =
                fs::read(&args.dump).with_context(|| format!("failed to read '{}'", args.dump.display()))?;
            let offset = kvstorage::find_storage(&data).context("KV storage not found in input data")?;
            let storage = kvstorage::KvStorage::parse(&data[offset..]).context("failed to parse KV storage")?;

            fs::create_dir_all(&args.output_directory)?;
            let mut all = serde_json::Map::new();
            for key in storage.keys() {
                let value = storage.read_value_parsed(key)?;
                all.insert(key.to_string(), value.clone());
                if args.separate_keys {
                    let path = args.output_directory.join(format!("{}.json", key));
                    fs::write(&path, serde_json::to_string_pretty(&value)?)?;
                }
            }
            let out_path = args.output_directory.join("storage.json");
            fs::write(&out_path, serde_json::to_string_pretty(&all)?)?;
            println!("extracted {} key(s) to {}", all.len(), out_path.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let opts = Opts::from_args();

    match &opts.command {
        Command::Info => run_info(&opts),
        Command::Flash(cmd) => run_flash(&opts, cmd),
        Command::Analyze(cmd) => run_analyze(cmd),
    }
}
