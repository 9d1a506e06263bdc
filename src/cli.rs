use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Connect and print what was learned about the attached chip
    Info,
    /// Operate on the external flash
    Flash(FlashCommand),
    /// Dissect artifacts out of a firmware dump already on disk
    Analyze(AnalyzeCommand),
}

#[derive(StructOpt, Debug)]
pub enum FlashCommand {
    /// Read external flash contents
    Read(FlashReadOpts),
    /// Write external flash contents
    Write(FlashWriteOpts),
    /// Erase a region of flash
    Erase(FlashEraseOpts),
}

#[derive(StructOpt, Debug)]
pub struct FlashReadOpts {
    /// Address offset of the flash medium
    #[structopt(required = true)]
    pub address: u32,
    /// Size of the region to read
    #[structopt(required = true)]
    pub size: u32,
    /// The name of the file to save the contents to
    #[structopt(required = true, default_value = "flash.bin")]
    pub filename: PathBuf,
    /// Verify every read page against the chip's own CRC
    #[structopt(long)]
    pub crc_check: bool,
}

#[derive(StructOpt, Debug)]
pub struct FlashWriteOpts {
    /// The name of the file to read from
    #[structopt(required = true)]
    pub filename: PathBuf,
    /// Address offset of the flash medium
    #[structopt(required = true)]
    pub address: u32,
    /// Verify the programmed range's CRC against the input file
    #[structopt(long)]
    pub crc_check: bool,
    /// Allow a non-4K-aligned start by erasing its sector and writing the
    /// leading partial sector in small chunks
    #[structopt(long)]
    pub really_erase: bool,
    /// Log what would be erased/written without touching the chip
    #[structopt(long)]
    pub dry_run: bool,
}

#[derive(StructOpt, Debug)]
pub struct FlashEraseOpts {
    /// Address offset of the region to erase
    #[structopt(required = true)]
    pub address: u32,
    /// Size of the region to erase, rounded up to a 4K sector
    #[structopt(required = true)]
    pub size: u32,
}

#[derive(StructOpt, Debug)]
pub enum AnalyzeCommand {
    /// Extract RBL containers out of a firmware dump
    Rbl(AnalyzeOpts),
    /// Extract and decode the KV storage partition out of a firmware dump
    Storage(AnalyzeOpts),
}

#[derive(StructOpt, Debug)]
pub struct AnalyzeOpts {
    /// Path to the firmware dump to analyze
    #[structopt(required = true)]
    pub dump: PathBuf,
    /// Name of the known flash layout to assume
    #[structopt(long, default_value = "ota_1")]
    pub layout: String,
    /// Directory to write extracted artifacts to
    #[structopt(long, default_value = ".")]
    pub output_directory: PathBuf,
    /// Additionally write every extracted key to its own file
    #[structopt(long)]
    pub separate_keys: bool,
}

#[derive(StructOpt, Debug)]
#[structopt(name = "bk72xx-tool")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The serial device to connect to
    #[structopt(env = "SERIAL_PORT", short = "p", long = "port", default_value = "/dev/ttyUSB0")]
    pub serial_port: String,
    /// The serial baud rate to use once linked
    #[structopt(env = "BAUD_RATE", short = "b", long = "baud-rate", default_value = "921600")]
    pub baud_rate: u32,
    /// The baud rate the bootloader speaks before `SET_BAUDRATE` negotiation
    #[structopt(env = "LINK_BAUD_RATE", long = "link-baud-rate", default_value = "115200")]
    pub link_baud_rate: u32,
    /// How long to keep sending LinkCheck before giving up, in milliseconds
    #[structopt(long = "link-timeout", default_value = "10000")]
    pub link_timeout_ms: u64,
    /// Per-command response timeout, in milliseconds
    #[structopt(long = "command-timeout", default_value = "1000")]
    pub command_timeout_ms: u64,
}
