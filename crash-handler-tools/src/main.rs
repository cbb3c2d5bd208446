// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use crash_handler::stream::{Base94Decoder, Base94Encoder};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

/// Encode a file as base94 text, or decode base94 text back into bytes.
///
/// Decoding accepts the lines of a minidump written to the log, including the
/// `-----BEGIN CRASHPAD MINIDUMP-----` and `-----END CRASHPAD MINIDUMP-----` markers.
#[derive(Debug, Parser)]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["encode", "decode"])))]
struct Args {
    /// Encode the input file.
    #[arg(short, long)]
    encode: bool,

    /// Decode the input file.
    #[arg(short, long)]
    decode: bool,

    /// Compress with zlib before encoding, or decompress after decoding.
    #[arg(short, long)]
    zlib: bool,

    /// The file to read.
    input: PathBuf,

    /// The file to write.
    output: PathBuf,
}

fn is_marker(line: &str) -> bool {
    line.starts_with("-----") && line.ends_with("-----")
}

fn encode<W: Write>(input: &[u8], output: W, zlib: bool) -> io::Result<W> {
    let encoder = Base94Encoder::new(output);
    if zlib {
        let mut compressor = ZlibEncoder::new(encoder, Compression::default());
        compressor.write_all(input)?;
        compressor.finish()?.finish()
    } else {
        let mut encoder = encoder;
        encoder.write_all(input)?;
        encoder.finish()
    }
}

fn write_text<W: Write>(text: &str, writer: &mut W) -> io::Result<()> {
    for line in text.lines().map(str::trim).filter(|line| !is_marker(line)) {
        writer.write_all(line.as_bytes())?;
    }
    Ok(())
}

fn decode<W: Write>(input: &[u8], output: W, zlib: bool) -> io::Result<W> {
    let text = String::from_utf8_lossy(input);
    if zlib {
        let mut decoder = Base94Decoder::new(ZlibDecoder::new(output));
        write_text(&text, &mut decoder)?;
        decoder.finish()?.finish()
    } else {
        let mut decoder = Base94Decoder::new(output);
        write_text(&text, &mut decoder)?;
        decoder.finish()
    }
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::parse();

    log::info!("input file path: {}", args.input.display());
    log::info!("output file path: {}", args.output.display());

    let input = fs::read(&args.input).context("while reading input file")?;
    let output = BufWriter::new(File::create(&args.output).context("while creating output file")?);

    let mut output = if args.encode {
        encode(&input, output, args.zlib).context("while encoding")?
    } else {
        decode(&input, output, args.zlib).context("while decoding")?
    };
    output.flush().context("while writing output file")?;
    Ok(())
}

pub fn main() {
    env_logger::init();

    if let Err(e) = try_main() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
