use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use sylva::config::DecoderConfig;
use sylva::decoder::{Decoder, DecoderError};
use sylva::lm;

#[derive(Parser)]
#[command(name = "sylva", about = "Syntax-based translation decoder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode sentences, one per input line
    Decode {
        /// Path to the decoder configuration TOML file
        config: PathBuf,
        /// Input file (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compile a text ARPA language model into the binary image format
    CompileLm {
        /// Path to the ARPA input file
        input: PathBuf,
        /// Path for the compiled output file
        output: PathBuf,
    },
}

fn decode(
    config: &PathBuf,
    input: Option<&PathBuf>,
    output: Option<&PathBuf>,
) -> Result<(), DecoderError> {
    let config = DecoderConfig::from_path(config)?;
    let decoder = Arc::new(Decoder::from_config(&config)?);
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    match output {
        Some(path) => {
            let sink = BufWriter::new(File::create(path)?);
            let mut sink = decoder.decode_corpus(reader, sink)?;
            sink.flush()?;
        }
        None => {
            decoder.decode_corpus(reader, io::stdout().lock())?;
        }
    }
    Ok(())
}

fn main() {
    sylva::trace_init::init_tracing();
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Decode {
            config,
            input,
            output,
        } => decode(config, input.as_ref(), output.as_ref()),
        Command::CompileLm { input, output } => {
            lm::compile_arpa(input, output).map_err(DecoderError::from)
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
