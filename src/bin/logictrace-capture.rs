// Logic bus capture
//
// Samples all 32 bus lines into a ring buffer holding the last few seconds
// and writes them to a binary trace when interrupted or when the trigger line
// goes high.

use clap::{ArgAction, Parser};
use logictrace_rs::capture::{DEFAULT_CAPTURE_SECONDS, DEFAULT_SAMPLE_RATE_HZ};
use logictrace_rs::{BusSampler, CaptureConfig, CaptureDriver, CaptureError, StopReason};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Exit status when the bus cannot be read.
const SAMPLER_EXIT_CODE: u8 = 3;

#[derive(Parser)]
#[command(name = "logictrace-capture")]
#[command(version)]
#[command(about = "Capture the logic bus into a binary trace")]
#[command(long_about = "Sample all 32 bus lines at a fixed rate, keeping only the most recent window. \
The window is written to the trace file on SIGINT, SIGTERM or SIGQUIT, or as soon as the trigger line reads high.")]
#[command(disable_help_flag = true)]
struct Args {
    /// Trace file to write
    #[arg(short = 'o', value_name = "FILE")]
    output: PathBuf,

    /// Stop capturing when this line reads high
    #[arg(short = 't', value_name = "LINE", value_parser = clap::value_parser!(u8).range(0..32))]
    trigger: Option<u8>,

    /// Length of the capture window in seconds
    #[arg(short = 's', value_name = "SECONDS", default_value_t = DEFAULT_CAPTURE_SECONDS,
          value_parser = clap::value_parser!(u32).range(1..))]
    seconds: u32,

    /// Sample rate in Hz
    #[arg(short = 'h', value_name = "HZ", default_value_t = DEFAULT_SAMPLE_RATE_HZ,
          value_parser = clap::value_parser!(u32).range(1..))]
    hz: u32,

    /// GPIO character device to sample
    #[arg(long, value_name = "PATH", default_value = "/dev/gpiochip0")]
    chip: PathBuf,

    /// Enable verbose logging
    #[arg(long, help = "Show debug information and detailed logs")]
    verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
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

    let mut config = CaptureConfig::new(&args.output)
        .with_seconds(args.seconds)
        .with_rate_hz(args.hz);
    if let Some(line) = args.trigger {
        config = config.with_trigger_line(line);
    }

    run(config, &args.chip)
}

#[cfg(target_os = "linux")]
fn run(config: CaptureConfig, chip: &Path) -> ExitCode {
    capture(config, logictrace_rs::GpioChipSampler::new(chip))
}

#[cfg(not(target_os = "linux"))]
fn run(_config: CaptureConfig, chip: &Path) -> ExitCode {
    log::error!(
        "Sampling {} needs the Linux GPIO character device",
        chip.display()
    );
    ExitCode::from(SAMPLER_EXIT_CODE)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn capture<S: BusSampler>(config: CaptureConfig, sampler: S) -> ExitCode {
    let output = config.output.clone();
    let driver = CaptureDriver::new(config, sampler);
    if let Err(e) = driver.stop_handle().register_termination_signals() {
        log::error!("Cannot install signal handlers: {}", e);
        return ExitCode::from(SAMPLER_EXIT_CODE);
    }

    match driver.run() {
        Ok(report) => {
            log::info!(
                "Wrote {} of {} samples to {} ({} dropped) in {:.3} s, {:.0} Hz achieved",
                report.samples_written,
                report.samples_read,
                output.display(),
                report.samples_dropped,
                report.elapsed.as_secs_f64(),
                report.achieved_rate_hz()
            );
            if matches!(report.stop_reason, StopReason::SamplerFault(_)) {
                ExitCode::from(SAMPLER_EXIT_CODE)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            log::error!("{}", e);
            if let CaptureError::InvalidTriggerLine(_) = e {
                eprintln!("Usage: logictrace-capture -o <file> [-t <line>] [-s <seconds>] [-h <hz>]");
            }
            ExitCode::from(e.exit_code())
        }
    }
}
