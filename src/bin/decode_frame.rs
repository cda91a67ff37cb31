use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::debug;

use cellbus_lib::blocks::{MeasurementBlock, PageBuffer, VersionInfo};
use cellbus_lib::command::Command;
use cellbus_lib::constants::{
    COMMAND_WORD_SIZE, MEASUREMENT_BLOCK_SIZE, PAGE_FRAME_SIZE, VERSION_BLOCK_SIZE, WIDE_COMMAND_SIZE,
};
use cellbus_lib::crc::crc16_xmodem;
use cellbus_lib::hamming::{self, DecodeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FrameKind {
    /// Pick by frame length
    Auto,
    Command,
    Measurement,
    Version,
    Page,
}

/// Decodes a captured bus frame given as hex.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Frame bytes in hex, e.g. "a140" or "01e40ce50c..."
    hex: String,
    /// How to interpret the frame.
    #[arg(short, long, value_enum, default_value_t = FrameKind::Auto)]
    kind: FrameKind,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn describe_word(label: &str, code: u16) {
    match hamming::classify(code) {
        DecodeStatus::Valid => println!("{}: 0x{:04x} valid", label, code),
        DecodeStatus::Corrected { bit } => println!("{}: 0x{:04x} single bit error in bit {}", label, code, bit),
        DecodeStatus::Uncorrectable => println!("{}: 0x{:04x} uncorrectable", label, code),
    }
}

fn decode_command(frame: &Bytes) -> Result<()> {
    for (i, word) in frame.chunks_exact(COMMAND_WORD_SIZE).enumerate() {
        describe_word(&format!("word {}", i), u16::from_le_bytes([word[0], word[1]]));
    }
    let command = Command::decode(frame).context("Not a valid command")?;
    println!("{}", command);
    Ok(())
}

fn decode_measurement(frame: &Bytes) -> Result<()> {
    let block = MeasurementBlock::parse(frame).context("Not a valid measurement block")?;
    println!("module {}", block.address);
    for (i, mv) in block.cell_voltages().iter().enumerate() {
        println!("  cell {}: {} mV", i + 1, mv);
    }
    println!("  temperature: {} °C", block.temperature_c());
    Ok(())
}

fn decode_version(frame: &Bytes) -> Result<()> {
    let info = VersionInfo::parse(frame).context("Not a valid version block")?;
    println!("{}", info);
    Ok(())
}

fn decode_page(frame: &Bytes) -> Result<()> {
    let page = PageBuffer::parse(frame).context("Not a valid page buffer")?;
    println!("page {}", page.page);
    for (i, chunk) in page.data.chunks(16).enumerate() {
        println!("  {:04x}: {}", i * 16, hex::encode(chunk));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(cli.verbose.tracing_level_filter())
        .init();

    let cleaned: String = cli.hex.chars().filter(|c| !c.is_whitespace()).collect();
    let frame = Bytes::from(hex::decode(&cleaned).context("Failed to decode hex input")?);
    debug!("{} bytes, crc over all 0x{:04x}", frame.len(), crc16_xmodem(&frame));

    let kind = match cli.kind {
        FrameKind::Auto => match frame.len() {
            COMMAND_WORD_SIZE | WIDE_COMMAND_SIZE => FrameKind::Command,
            MEASUREMENT_BLOCK_SIZE => FrameKind::Measurement,
            VERSION_BLOCK_SIZE => FrameKind::Version,
            PAGE_FRAME_SIZE => FrameKind::Page,
            len => bail!("Cannot guess the frame type of {} bytes, use --kind", len),
        },
        kind => kind,
    };

    match kind {
        FrameKind::Command => decode_command(&frame),
        FrameKind::Measurement => decode_measurement(&frame),
        FrameKind::Version => decode_version(&frame),
        FrameKind::Page => decode_page(&frame),
        FrameKind::Auto => unreachable!("resolved above"),
    }
}
