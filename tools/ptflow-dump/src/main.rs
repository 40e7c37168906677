use anyhow::{Context, Result};
use clap::Parser;
use ptflow_codec::{Config, Error, PacketDecoder};
use ptflow_query::QueryDecoder;

use std::{fs::File, path::PathBuf};

/// Dump the packets of a raw Intel PT trace.
///
/// The input must be a plain packet stream, e.g. the AUX data extracted
/// from a perf.data file. Set the environment variable `RUST_LOG=trace`
/// for per-packet logging of the decoding layers.
#[derive(Parser)]
struct Cmdline {
    /// Path of the raw Intel PT trace
    #[arg(short, long)]
    input: PathBuf,
    /// Dump query-level events instead of packets
    #[arg(long)]
    events: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let Cmdline { input, events } = Cmdline::parse();

    let file = File::open(&input).context("Failed to open input file")?;
    // SAFETY: check the safety requirements of memmap2 documentation
    let buf = unsafe { memmap2::Mmap::map(&file).context("Failed to mmap input file")? };

    if events {
        dump_events(&buf)
    } else {
        dump_packets(&buf)
    }
}

fn dump_packets(buf: &[u8]) -> Result<()> {
    let mut decoder = PacketDecoder::new(Config::new(buf));
    let mut packet_count = 0usize;

    decoder
        .sync_forward()
        .map_err(|error| anyhow::anyhow!("No sync point found: {error}"))?;

    loop {
        match decoder.next() {
            Ok(packet) => {
                println!("{:#010x}\t{packet:x?}", decoder.offset().unwrap_or(0));
                packet_count += 1;
            }
            Err(Error::Eos) => break,
            Err(error) => {
                eprintln!("packet error: {error}; searching for the next sync point");
                if decoder.sync_forward().is_err() {
                    break;
                }
            }
        }
    }

    println!("{packet_count} packets");
    Ok(())
}

fn dump_events(buf: &[u8]) -> Result<()> {
    let mut decoder = QueryDecoder::new(Config::new(buf));

    let (ip, _) = decoder
        .sync_forward()
        .map_err(|error| anyhow::anyhow!("No sync point found: {error}"))?;
    println!("synced at {:#010x}, ip {ip:x?}", decoder.sync_offset()?);

    loop {
        match decoder.event() {
            Ok((event, status)) => {
                println!("{event:x?}");
                if status.eos {
                    break;
                }
            }
            Err(Error::Eos) | Err(Error::BadQuery) => {
                // Events are exhausted up to the next sync point.
                match decoder.sync_forward() {
                    Ok((ip, _)) => {
                        println!("synced at {:#010x}, ip {ip:x?}", decoder.sync_offset()?);
                    }
                    Err(_) => break,
                }
            }
            Err(error) => {
                eprintln!("event error: {error}");
                break;
            }
        }
    }

    Ok(())
}
