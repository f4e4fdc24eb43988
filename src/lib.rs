//! # logictrace-rs
//!
//! Capture the 32 lines of a logic bus into a binary trace and decode traces
//! into plottable or viewable waveforms.
//!
//! Capture samples the bus at a fixed cadence into a ring buffer holding the
//! last few seconds, then dumps it oldest first when stopped by a signal or a
//! trigger line. Decode turns a trace into per-line change events and renders
//! selected lines in one of three formats.
//!
//! ## Features
//!
//! - **Ring capture**: fixed-size window, overwrites the oldest samples
//! - **GPIO sampling**: Linux GPIO character device through `gpio-cdev`
//! - **Edge detection**: one change event per level change, plus a closing event
//! - **Synchronized rows**: gap rows so held values never interpolate
//! - **Three outputs**: per-channel plot files, a combined table, a value change dump
//! - **DataFrame output**: uses `polars` for analysing traces in Rust
//!
//! ## Examples
//!
//! ### Edge Detection
//!
//! ```rust
//! use logictrace_rs::{encode_channel, ChangeEvent};
//!
//! let events = encode_channel(0, &[0, 0, 1, 1, 0]);
//! assert_eq!(events[1], ChangeEvent::new(2, true));
//! assert_eq!(events.last(), Some(&ChangeEvent::new(4, false)));
//! ```
//!
//! ### Capturing
//!
//! ```rust,no_run
//! use logictrace_rs::{CaptureConfig, CaptureDriver, GpioChipSampler};
//!
//! let config = CaptureConfig::new("trace.bin")
//!     .with_seconds(10)
//!     .with_rate_hz(200_000)
//!     .with_trigger_line(17);
//! let driver = CaptureDriver::new(config, GpioChipSampler::new("/dev/gpiochip0"));
//! driver.stop_handle().register_termination_signals()?;
//!
//! let report = driver.run()?;
//! println!("Wrote {} samples", report.samples_written);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Decoding
//!
//! ```rust,no_run
//! use logictrace_rs::{ChannelSelection, DecodeSession, OutputFormat};
//!
//! let channels = vec!["0:clk".parse::<ChannelSelection>()?, "1:data".parse()?];
//! let format = OutputFormat::EventLog {
//!     path: "trace.vcd".into(),
//!     rate_hz: 200_000,
//! };
//! let session = DecodeSession::new(format, channels)?;
//! session.run("trace.bin")?;
//! println!("{}", session.viewer_command());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### DataFrame
//!
//! ```rust,no_run
//! use logictrace_rs::{trace_to_dataframe, ChannelSelection, TraceReader};
//!
//! let samples = TraceReader::open("trace.bin")?.read_all()?;
//! let df = trace_to_dataframe(&samples, &["0:clk".parse::<ChannelSelection>()?], 200_000)?;
//! println!("{}", df.head(Some(10)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bus_sampler;
pub mod capture;
pub mod channel;
pub mod dataframe;
pub mod ring_capture;
pub mod synchronizer;
pub mod trace_file;
pub mod trace_formatter;

// Re-export the main types for convenience
pub use bus_sampler::{BusSampler, ReplaySampler, Sample, SamplerError};

#[cfg(target_os = "linux")]
pub use bus_sampler::GpioChipSampler;

pub use ring_capture::{RingCapture, RingCaptureError};

pub use capture::{
    CaptureConfig, CaptureDriver, CaptureError, CaptureReport, StopHandle, StopReason,
};

pub use trace_file::{TraceError, TraceReader, TraceWriter};

pub use channel::{encode_channel, replay_events, ChangeEvent, ChannelEncoder, ChannelSelection};

pub use synchronizer::{Row, RowKind, Synchronizer};

pub use trace_formatter::{
    decode, DecodeError, DecodeSession, DecodeSummary, OpenedOutput, OutputFormat, TraceSink,
};

pub use dataframe::trace_to_dataframe;
