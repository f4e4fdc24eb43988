use crate::bus_sampler::Sample;
use crate::channel::{check_selections, ChannelEncoder, ChannelSelection, SelectionError};
use crate::synchronizer::{Row, Synchronizer};
use crate::trace_file::{TraceError, TraceReader};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_DECODE_RATE_HZ: u32 = 25_000_000;

/// Levels of the two points that pin a plot's vertical range.
const PLOT_RANGE: [f64; 2] = [-0.25, 1.25];

/// Decimal places kept before trailing zeros are trimmed.
const DECIMAL_PLACES: usize = 9;

const TIME_COLUMN: &str = "t";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("Cannot open trace {path}: {source}")]
    OpenInput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot create output {path}: {source}")]
    OpenOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read trace: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to write output: {0}")]
    Write(#[from] std::io::Error),
}

impl DecodeError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            DecodeError::Selection(_) => 1,
            DecodeError::Read(_) => 3,
            DecodeError::OpenInput { .. } | DecodeError::OpenOutput { .. } => 4,
            DecodeError::Write(_) => 5,
        }
    }
}

impl From<TraceError> for DecodeError {
    fn from(e: TraceError) -> Self {
        match e {
            TraceError::Open { path, source } => DecodeError::OpenInput { path, source },
            TraceError::Io(source) => DecodeError::Read(source),
        }
    }
}

/// Format `value` with up to nine decimals, dropping trailing zeros and a
/// trailing decimal point.
pub fn compact_decimal(value: f64) -> String {
    let mut text = format!("{:.*}", DECIMAL_PLACES, value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text.remove(0);
    }
    text
}

fn seconds(index: u64, rate_hz: u32) -> f64 {
    index as f64 / f64::from(rate_hz)
}

/// Symbol naming channel `channel` in the event log.
pub fn event_log_symbol(channel: usize) -> char {
    u8::try_from(channel)
        .ok()
        .and_then(|offset| b'A'.checked_add(offset))
        .map_or('?', char::from)
}

/// Receives a trace one sample at a time and renders it.
pub trait TraceSink {
    fn begin(&mut self) -> std::io::Result<()>;

    fn push(&mut self, index: u64, sample: Sample) -> std::io::Result<()>;

    fn finish(&mut self) -> std::io::Result<()>;
}

/// One `time value` file per channel, for stacked plots.
///
/// Channels are not synchronized with each other, but each channel closes
/// its own gaps: before a change at `i`, the held level is restated at
/// `i - 1` so that lines join with square edges.
pub struct PerChannelSink<W: Write> {
    writers: Vec<W>,
    encoders: Vec<ChannelEncoder>,
    offset: f64,
    rate_hz: u32,
}

impl<W: Write> PerChannelSink<W> {
    pub fn new(channels: &[ChannelSelection], writers: Vec<W>, offset: f64, rate_hz: u32) -> Self {
        Self {
            writers,
            encoders: channels
                .iter()
                .map(|channel| ChannelEncoder::new(channel.line))
                .collect(),
            offset,
            rate_hz,
        }
    }

    pub fn into_writers(self) -> Vec<W> {
        self.writers
    }

    fn point(&mut self, channel: usize, index: u64, level: f64) -> std::io::Result<()> {
        let value = level + self.offset * channel as f64;
        writeln!(
            self.writers[channel],
            "{} {}",
            compact_decimal(seconds(index, self.rate_hz)),
            compact_decimal(value)
        )
    }
}

impl<W: Write> TraceSink for PerChannelSink<W> {
    fn begin(&mut self) -> std::io::Result<()> {
        for level in PLOT_RANGE {
            for channel in 0..self.writers.len() {
                self.point(channel, 0, level)?;
            }
        }
        Ok(())
    }

    fn push(&mut self, index: u64, sample: Sample) -> std::io::Result<()> {
        for channel in 0..self.encoders.len() {
            let previous = self.encoders[channel].last_event();
            let Some(event) = self.encoders[channel].observe(index, sample) else {
                continue;
            };
            if let Some(previous) = previous {
                if previous.index + 1 != index {
                    self.point(channel, index - 1, f64::from(u8::from(previous.value)))?;
                }
            }
            self.point(channel, index, f64::from(u8::from(event.value)))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> std::io::Result<()> {
        for channel in 0..self.encoders.len() {
            if let Some(event) = self.encoders[channel].finish() {
                self.point(channel, event.index, f64::from(u8::from(event.value)))?;
            }
        }
        for writer in &mut self.writers {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Tab-separated table with a time column and one column per channel.
pub struct CombinedSink<W: Write> {
    out: W,
    names: Vec<String>,
    sync: Synchronizer,
    offset: f64,
    rate_hz: u32,
}

impl<W: Write> CombinedSink<W> {
    pub fn new(channels: &[ChannelSelection], out: W, offset: f64, rate_hz: u32) -> Self {
        Self {
            out,
            names: channels.iter().map(|channel| channel.name.clone()).collect(),
            sync: Synchronizer::new(channels),
            offset,
            rate_hz,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line<I>(&mut self, index: u64, levels: I) -> std::io::Result<()>
    where
        I: IntoIterator<Item = f64>,
    {
        write!(self.out, "{}", compact_decimal(seconds(index, self.rate_hz)))?;
        for (channel, level) in levels.into_iter().enumerate() {
            let value = level + self.offset * channel as f64;
            write!(self.out, "\t{}", compact_decimal(value))?;
        }
        writeln!(self.out)
    }

    fn row(&mut self, row: &Row) -> std::io::Result<()> {
        let levels: Vec<f64> = row
            .cells
            .iter()
            .map(|cell| f64::from(u8::from(cell.value)))
            .collect();
        self.line(row.index, levels)
    }
}

impl<W: Write> TraceSink for CombinedSink<W> {
    fn begin(&mut self) -> std::io::Result<()> {
        write!(self.out, "{}", TIME_COLUMN)?;
        for name in &self.names {
            write!(self.out, "\t{}", name)?;
        }
        writeln!(self.out)?;
        let channels = self.names.len();
        for level in PLOT_RANGE {
            self.line(0, std::iter::repeat(level).take(channels))?;
        }
        Ok(())
    }

    fn push(&mut self, index: u64, sample: Sample) -> std::io::Result<()> {
        for row in self.sync.push(index, sample).into_iter().flatten() {
            self.row(&row)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> std::io::Result<()> {
        if let Some(row) = self.sync.finish() {
            self.row(&row)?;
        }
        self.out.flush()
    }
}

/// Value change dump with one single-bit wire per channel.
///
/// The timescale is one sample, so timestamps are sample indices. It is
/// written as the sample period in nanoseconds, which is not always one of
/// the 1, 10 or 100 magnitudes the format defines (3 MHz gives
/// `333.333333333 ns`). Viewers that insist on those magnitudes will reject
/// such a dump; capture at a rate dividing 1 GHz by a power of ten to avoid it.
pub struct EventLogSink<W: Write> {
    out: W,
    names: Vec<String>,
    sync: Synchronizer,
    rate_hz: u32,
    last_time: Option<u64>,
}

impl<W: Write> EventLogSink<W> {
    pub fn new(channels: &[ChannelSelection], out: W, rate_hz: u32) -> Self {
        Self {
            out,
            names: channels.iter().map(|channel| channel.name.clone()).collect(),
            sync: Synchronizer::new(channels),
            rate_hz,
            last_time: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn row(&mut self, row: &Row) -> std::io::Result<()> {
        for (channel, value) in row.reported() {
            if self.last_time != Some(row.index) {
                writeln!(self.out, "#{}", row.index)?;
                self.last_time = Some(row.index);
            }
            writeln!(self.out, "{}{}", u8::from(value), event_log_symbol(channel))?;
        }
        Ok(())
    }
}

impl<W: Write> TraceSink for EventLogSink<W> {
    fn begin(&mut self) -> std::io::Result<()> {
        let date = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
        writeln!(self.out, "$date {} $end", date)?;
        writeln!(
            self.out,
            "$version {} {} $end",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )?;
        writeln!(
            self.out,
            "$timescale {} ns $end",
            compact_decimal(1e9 / f64::from(self.rate_hz))
        )?;
        writeln!(self.out, "$scope module top $end")?;
        for (channel, name) in self.names.iter().enumerate() {
            writeln!(
                self.out,
                "$var wire 1 {} {} $end",
                event_log_symbol(channel),
                name
            )?;
        }
        writeln!(self.out, "$upscope $end")?;
        writeln!(self.out, "$enddefinitions $end")
    }

    fn push(&mut self, index: u64, sample: Sample) -> std::io::Result<()> {
        for row in self.sync.push(index, sample).into_iter().flatten() {
            self.row(&row)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> std::io::Result<()> {
        if let Some(row) = self.sync.finish() {
            self.row(&row)?;
        }
        self.out.flush()
    }
}

/// Where and how a decode renders its output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    /// One file per channel, named after the channel, inside `directory`.
    PerChannel {
        directory: PathBuf,
        offset: f64,
        rate_hz: u32,
    },
    /// A single tab-separated table.
    Combined {
        path: PathBuf,
        offset: f64,
        rate_hz: u32,
    },
    /// A value change dump for waveform viewers.
    EventLog { path: PathBuf, rate_hz: u32 },
}

impl OutputFormat {
    pub fn rate_hz(&self) -> u32 {
        match self {
            OutputFormat::PerChannel { rate_hz, .. }
            | OutputFormat::Combined { rate_hz, .. }
            | OutputFormat::EventLog { rate_hz, .. } => *rate_hz,
        }
    }

    /// Files this format writes for `channels`.
    pub fn output_paths(&self, channels: &[ChannelSelection]) -> Vec<PathBuf> {
        match self {
            OutputFormat::PerChannel { directory, .. } => channels
                .iter()
                .map(|channel| directory.join(&channel.name))
                .collect(),
            OutputFormat::Combined { path, .. } | OutputFormat::EventLog { path, .. } => {
                vec![path.clone()]
            }
        }
    }

    /// Stage the output files and a sink rendering into them.
    ///
    /// Nothing appears at the output paths until [`OpenedOutput::commit`].
    pub fn open_sink(&self, channels: &[ChannelSelection]) -> Result<OpenedOutput, DecodeError> {
        let mut staged = Vec::new();
        let mut writers = Vec::new();
        for path in self.output_paths(channels) {
            let (stage, writer) = StagedOutput::create(path)?;
            staged.push(stage);
            writers.push(writer);
        }
        let sink: Box<dyn TraceSink> = match self {
            OutputFormat::PerChannel {
                offset, rate_hz, ..
            } => Box::new(PerChannelSink::new(channels, writers, *offset, *rate_hz)),
            OutputFormat::Combined {
                offset, rate_hz, ..
            } => Box::new(CombinedSink::new(channels, writers.remove(0), *offset, *rate_hz)),
            OutputFormat::EventLog { rate_hz, .. } => {
                Box::new(EventLogSink::new(channels, writers.remove(0), *rate_hz))
            }
        };
        Ok(OpenedOutput { sink, staged })
    }

    /// Command line that plots or views the generated output.
    pub fn viewer_command(&self, channels: &[ChannelSelection]) -> String {
        let quote = |path: &Path| format!("\"{}\"", path.display());
        match self {
            OutputFormat::PerChannel { .. } => {
                let files: Vec<String> = self
                    .output_paths(channels)
                    .iter()
                    .map(|path| quote(path.as_path()))
                    .collect();
                format!("plot {}", files.join(", "))
            }
            OutputFormat::Combined { path, .. } => {
                let series: Vec<String> = channels
                    .iter()
                    .map(|channel| {
                        format!("{} using \"{}\":\"{}\"", quote(path.as_path()), TIME_COLUMN, channel.name)
                    })
                    .collect();
                format!("plot {}", series.join(", "))
            }
            OutputFormat::EventLog { path, .. } => format!("gtkwave -d {}", path.display()),
        }
    }
}

/// An output file rendered next to its final path and moved into place on commit.
struct StagedOutput {
    file: NamedTempFile,
    path: PathBuf,
}

impl StagedOutput {
    fn create(path: PathBuf) -> Result<(Self, BufWriter<File>), DecodeError> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let open_error = |source| DecodeError::OpenOutput {
            path: path.clone(),
            source,
        };
        let file = tempfile::Builder::new()
            .prefix(".logictrace-")
            .tempfile_in(directory)
            .map_err(open_error)?;
        let writer = file.as_file().try_clone().map_err(open_error)?;
        Ok((Self { file, path }, BufWriter::new(writer)))
    }

    fn persist(self) -> Result<(), DecodeError> {
        let path = self.path;
        self.file
            .persist(&path)
            .map_err(|e| DecodeError::OpenOutput {
                path: path.clone(),
                source: e.error,
            })?;
        tracing::debug!(path = %path.display(), "output written");
        Ok(())
    }
}

/// A sink whose files only reach their final paths once rendering succeeded.
///
/// Dropping it without committing removes every staged file.
pub struct OpenedOutput {
    sink: Box<dyn TraceSink>,
    staged: Vec<StagedOutput>,
}

impl OpenedOutput {
    pub fn sink(&mut self) -> &mut dyn TraceSink {
        self.sink.as_mut()
    }

    /// Move every staged file to its output path.
    pub fn commit(self) -> Result<(), DecodeError> {
        let OpenedOutput { sink, staged } = self;
        drop(sink);
        staged.into_iter().try_for_each(StagedOutput::persist)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeSummary {
    pub samples: u64,
}

/// Stream a whole trace through `sink`.
pub fn decode<R: Read>(
    reader: TraceReader<R>,
    sink: &mut dyn TraceSink,
) -> Result<DecodeSummary, DecodeError> {
    let span = tracing::debug_span!("decode");
    let _entered = span.enter();

    sink.begin()?;
    let mut summary = DecodeSummary::default();
    for item in reader {
        let (index, sample) = item?;
        sink.push(index, sample)?;
        summary.samples += 1;
    }
    if summary.samples == 0 {
        tracing::warn!("Trace holds no samples; output has no data rows");
    }
    sink.finish()?;
    tracing::debug!(samples = summary.samples, "decode finished");
    Ok(summary)
}

/// One decode run: a trace file, the channels to extract, and the format.
#[derive(Debug, Clone)]
pub struct DecodeSession {
    format: OutputFormat,
    channels: Vec<ChannelSelection>,
}

impl DecodeSession {
    pub fn new(format: OutputFormat, channels: Vec<ChannelSelection>) -> Result<Self, DecodeError> {
        check_selections(&channels)?;
        Ok(Self { format, channels })
    }

    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    pub fn channels(&self) -> &[ChannelSelection] {
        &self.channels
    }

    /// Decode `input`. The trace is opened before any output file is created.
    pub fn run<P: AsRef<Path>>(&self, input: P) -> Result<DecodeSummary, DecodeError> {
        self.run_reader(TraceReader::open(input)?)
    }

    /// Decode an already opened trace.
    ///
    /// Outputs appear only when the whole trace was rendered; on any error
    /// the staged files are removed and existing outputs are left untouched.
    pub fn run_reader<R: Read>(&self, reader: TraceReader<R>) -> Result<DecodeSummary, DecodeError> {
        let mut output = self.format.open_sink(&self.channels)?;
        tracing::info!(
            channels = self.channels.len(),
            rate_hz = self.format.rate_hz(),
            "decoding trace"
        );
        let summary = decode(reader, output.sink())?;
        output.commit()?;
        Ok(summary)
    }

    pub fn viewer_command(&self) -> String {
        self.format.viewer_command(&self.channels)
    }
}
