// Trace decoder
//
// Extracts selected lines from a binary trace into per-channel plot files, a
// combined table, or a value change dump, then prints the command that views
// the result.

use clap::{ArgAction, Parser};
use logictrace_rs::trace_formatter::DEFAULT_DECODE_RATE_HZ;
use logictrace_rs::{ChannelSelection, DecodeError, DecodeSession, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str =
    "Usage: logictrace-decode -f <file> [-h <hz>] [-g <offset>] [-o <file> | -v <file>] <line:name>...";

#[derive(Parser)]
#[command(name = "logictrace-decode")]
#[command(version)]
#[command(about = "Decode a logic bus trace for plotting or waveform viewing")]
#[command(long_about = "Turn the selected lines of a binary trace into one plot file per channel (default), \
a combined table (-o) or a value change dump (-v). The command that plots or views the output is printed on stdout.")]
#[command(disable_help_flag = true)]
struct Args {
    /// Trace file to read
    #[arg(short = 'f', value_name = "FILE")]
    file: PathBuf,

    /// Sample rate the trace was captured at, in Hz
    #[arg(short = 'h', value_name = "HZ", default_value_t = DEFAULT_DECODE_RATE_HZ,
          value_parser = clap::value_parser!(u32).range(1..))]
    hz: u32,

    /// Vertical offset between stacked channels
    #[arg(short = 'g', value_name = "OFFSET", default_value_t = 0.0, allow_negative_numbers = true)]
    offset: f64,

    /// Write a combined table instead of per-channel files
    #[arg(short = 'o', value_name = "FILE", conflicts_with = "vcd")]
    combined: Option<PathBuf>,

    /// Write a value change dump instead of per-channel files
    #[arg(short = 'v', value_name = "FILE")]
    vcd: Option<PathBuf>,

    /// Directory for per-channel files
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long, help = "Show debug information and detailed logs")]
    verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Lines to extract, as <line>:<name>
    #[arg(value_name = "LINE:NAME", required = true)]
    channels: Vec<ChannelSelection>,
}

impl Args {
    fn output_format(&self) -> OutputFormat {
        match (&self.combined, &self.vcd) {
            (Some(path), _) => OutputFormat::Combined {
                path: path.clone(),
                offset: self.offset,
                rate_hz: self.hz,
            },
            (None, Some(path)) => OutputFormat::EventLog {
                path: path.clone(),
                rate_hz: self.hz,
            },
            (None, None) => OutputFormat::PerChannel {
                directory: self.output_dir.clone(),
                offset: self.offset,
                rate_hz: self.hz,
            },
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init();
    }

    let session = match DecodeSession::new(args.output_format(), args.channels.clone()) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", USAGE);
            return ExitCode::from(e.exit_code());
        }
    };

    match session.run(&args.file) {
        Ok(summary) => {
            log::info!(
                "Decoded {} samples from {}",
                summary.samples,
                args.file.display()
            );
            println!("{}", session.viewer_command());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            if let DecodeError::Selection(_) = e {
                eprintln!("{}", USAGE);
            }
            ExitCode::from(e.exit_code())
        }
    }
}
