use crate::bus_sampler::{line_level, BusSampler, SamplerError, BUS_WIDTH};
use crate::ring_capture::{RingCapture, RingCaptureError};
use crate::trace_file::{TraceError, TraceWriter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_CAPTURE_SECONDS: u32 = 60;
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 500_000;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Trigger line {0} is outside the 32-line bus")]
    InvalidTriggerLine(u8),

    #[error("Cannot open output {path}: {source}")]
    OpenOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to initialise bus sampler: {0}")]
    SamplerInit(#[source] SamplerError),

    #[error(transparent)]
    Buffer(#[from] RingCaptureError),

    #[error("Failed to write trace {path}: {source}")]
    WriteTrace {
        path: PathBuf,
        source: TraceError,
    },
}

impl CaptureError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            CaptureError::InvalidTriggerLine(_) => 1,
            CaptureError::OpenOutput { .. } => 2,
            CaptureError::SamplerInit(_) => 3,
            CaptureError::Buffer(_) => 4,
            CaptureError::WriteTrace { .. } => 5,
        }
    }
}

/// Cancellation flag shared between the capture loop and signal handlers.
///
/// The loop polls it once per sample, so an in-flight sample and its delay
/// always complete before the stop is noticed.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Raise the flag on SIGINT, SIGTERM and SIGQUIT.
    ///
    /// A second signal arriving while the flag is already raised terminates
    /// the process immediately.
    pub fn register_termination_signals(&self) -> std::io::Result<()> {
        for &signal in signal_hook::consts::TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&self.0))?;
            signal_hook::flag::register(signal, Arc::clone(&self.0))?;
        }
        Ok(())
    }
}

/// Best-effort fixed sampling cadence.
///
/// The period is the requested rate truncated to whole nanoseconds, and the
/// wait is a spin on the monotonic clock. Nothing here is a real-time
/// guarantee: when the loop falls more than one period behind, the schedule is
/// re-anchored instead of bursting to catch up. Compare
/// [`CaptureReport::achieved_rate_hz`] with [`Cadence::effective_rate_hz`] to
/// see how close a run came.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period: Duration,
}

impl Cadence {
    pub fn from_rate(rate_hz: u32) -> Self {
        let nanos = NANOS_PER_SECOND / u64::from(rate_hz.max(1));
        Self {
            period: Duration::from_nanos(nanos.max(1)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Rate the truncated period actually corresponds to.
    pub fn effective_rate_hz(&self) -> u64 {
        NANOS_PER_SECOND / self.period.as_nanos().max(1) as u64
    }

    pub fn start(&self) -> Ticker {
        Ticker {
            period: self.period,
            deadline: Instant::now() + self.period,
        }
    }
}

/// Running schedule produced by [`Cadence::start`].
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    deadline: Instant,
}

impl Ticker {
    /// Spin until the next deadline.
    pub fn wait(&mut self) {
        while Instant::now() < self.deadline {
            std::hint::spin_loop();
        }
        let now = Instant::now();
        self.deadline += self.period;
        if self.deadline < now {
            self.deadline = now + self.period;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub output: PathBuf,
    pub trigger_line: Option<u8>,
    pub seconds: u32,
    pub rate_hz: u32,
}

impl CaptureConfig {
    pub fn new<P: Into<PathBuf>>(output: P) -> Self {
        Self {
            output: output.into(),
            trigger_line: None,
            seconds: DEFAULT_CAPTURE_SECONDS,
            rate_hz: DEFAULT_SAMPLE_RATE_HZ,
        }
    }

    pub fn with_trigger_line(mut self, line: u8) -> Self {
        self.trigger_line = Some(line);
        self
    }

    pub fn with_seconds(mut self, seconds: u32) -> Self {
        self.seconds = seconds;
        self
    }

    pub fn with_rate_hz(mut self, rate_hz: u32) -> Self {
        self.rate_hz = rate_hz;
        self
    }

    pub fn cadence(&self) -> Cadence {
        Cadence::from_rate(self.rate_hz)
    }

    fn validate(&self) -> Result<(), CaptureError> {
        match self.trigger_line {
            Some(line) if line >= BUS_WIDTH => Err(CaptureError::InvalidTriggerLine(line)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The stop flag was raised, normally by a signal.
    Requested,
    /// The trigger line was high in the last captured sample.
    Trigger { line: u8 },
    /// Reading the bus failed mid-capture.
    SamplerFault(String),
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub stop_reason: StopReason,
    pub samples_read: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub elapsed: Duration,
    pub requested_rate_hz: u32,
    pub effective_rate_hz: u64,
}

impl CaptureReport {
    /// Sample rate the loop actually sustained.
    pub fn achieved_rate_hz(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.samples_read as f64 / seconds
        } else {
            0.0
        }
    }
}

/// Runs one capture: sample into a ring buffer until stopped, then dump the
/// buffer to the trace file in capture order.
pub struct CaptureDriver<S: BusSampler> {
    config: CaptureConfig,
    sampler: S,
    stop: StopHandle,
}

impl<S: BusSampler> CaptureDriver<S> {
    pub fn new(config: CaptureConfig, sampler: S) -> Self {
        Self {
            config,
            sampler,
            stop: StopHandle::new(),
        }
    }

    /// Use an externally owned stop flag.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Capture into the configured output file.
    ///
    /// The output is created before the sampler is touched, so a bad path
    /// fails without initialising the platform.
    pub fn run(self) -> Result<CaptureReport, CaptureError> {
        self.config.validate()?;
        let file = File::create(&self.config.output).map_err(|source| CaptureError::OpenOutput {
            path: self.config.output.clone(),
            source,
        })?;
        self.run_into(BufWriter::new(file))
    }

    /// Capture into any writer.
    pub fn run_into<W: Write>(mut self, output: W) -> Result<CaptureReport, CaptureError> {
        self.config.validate()?;
        self.sampler.init().map_err(CaptureError::SamplerInit)?;
        if let Some(layout) = self.sampler.describe_lines() {
            log::info!("Bus line configuration: {}", layout);
        }

        let mut ring = match RingCapture::for_window(self.config.seconds, self.config.rate_hz) {
            Ok(ring) => ring,
            Err(e) => {
                self.sampler.shutdown();
                return Err(e.into());
            }
        };
        log::info!(
            "Allocated {} MB buffer ({} samples)",
            ring.size_in_bytes() / (1024 * 1024),
            ring.capacity()
        );

        let cadence = self.config.cadence();
        log::info!(
            "Sampling rate: {} Hz requested, {} Hz effective",
            self.config.rate_hz,
            cadence.effective_rate_hz()
        );
        if let Some(line) = self.config.trigger_line {
            log::info!("Stopping when line {} goes high", line);
        }

        let started = Instant::now();
        let stop_reason = self.sample_until_stopped(&mut ring, cadence);
        let elapsed = started.elapsed();
        self.sampler.shutdown();

        match &stop_reason {
            StopReason::Requested => log::info!("Stop requested"),
            StopReason::Trigger { line } => log::info!("Trigger line {} asserted", line),
            StopReason::SamplerFault(e) => log::error!("Bus read failed: {}", e),
        }

        log::info!(
            "Dumping {} samples to {}",
            ring.len(),
            self.config.output.display()
        );
        let mut writer = TraceWriter::new(output);
        let write_error = |source: TraceError| CaptureError::WriteTrace {
            path: self.config.output.clone(),
            source,
        };
        let samples_written = writer.write_all(ring.drain()).map_err(write_error)?;
        writer.finish().map_err(write_error)?;
        log::debug!("Trace written");

        Ok(CaptureReport {
            stop_reason,
            samples_read: ring.appended(),
            samples_written,
            samples_dropped: ring.dropped(),
            elapsed,
            requested_rate_hz: self.config.rate_hz,
            effective_rate_hz: cadence.effective_rate_hz(),
        })
    }

    fn sample_until_stopped(&mut self, ring: &mut RingCapture, cadence: Cadence) -> StopReason {
        let trigger = self.config.trigger_line;
        let mut ticker = cadence.start();
        while !self.stop.is_stop_requested() {
            let sample = match self.sampler.read_bus_level() {
                Ok(sample) => sample,
                Err(e) => return StopReason::SamplerFault(e.to_string()),
            };
            ring.append(sample);
            ticker.wait();
            if let Some(line) = trigger {
                if line_level(sample, line) {
                    return StopReason::Trigger { line };
                }
            }
        }
        StopReason::Requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_sampler::ReplaySampler;
    use crate::trace_file::TraceReader;
    use std::io::Cursor;

    fn fast_config() -> CaptureConfig {
        CaptureConfig::new("unused.bin")
            .with_seconds(1)
            .with_rate_hz(1_000_000)
    }

    fn decode(bytes: Vec<u8>) -> Vec<u32> {
        TraceReader::new(Cursor::new(bytes)).read_all().unwrap()
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cadence_period() {
        let cadence = Cadence::from_rate(500_000);
        assert_eq!(cadence.period(), Duration::from_nanos(2_000));
        assert_eq!(cadence.effective_rate_hz(), 500_000);
    }

    #[test]
    fn test_cadence_effective_rate_truncates() {
        let cadence = Cadence::from_rate(3);
        assert_eq!(cadence.period(), Duration::from_nanos(333_333_333));
        assert_eq!(cadence.effective_rate_hz(), 3);
        let cadence = Cadence::from_rate(300_000_000);
        assert_eq!(cadence.period(), Duration::from_nanos(3));
        assert_eq!(cadence.effective_rate_hz(), 333_333_333);
    }

    #[test]
    fn test_ticker_keeps_pace() {
        let cadence = Cadence::from_rate(10_000);
        let mut ticker = cadence.start();
        let started = Instant::now();
        for _ in 0..20 {
            ticker.wait();
        }
        assert!(started.elapsed() >= Duration::from_micros(1_800));
    }

    #[test]
    fn test_trigger_stops_after_fifth_sample() {
        let samples = vec![0, 1, 2, 0, 1 << 3, 0, 0, 0];
        let config = fast_config().with_trigger_line(3);
        let mut output = Vec::new();
        let report = CaptureDriver::new(config, ReplaySampler::new(samples))
            .run_into(&mut output)
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Trigger { line: 3 });
        assert_eq!(report.samples_written, 5);
        assert_eq!(decode(output), vec![0, 1, 2, 0, 8]);
    }

    #[test]
    fn test_stop_request_flushes_capture() {
        let stop = StopHandle::new();
        let sampler = ReplaySampler::new((0..6).collect()).stop_after(6, stop.clone());
        let mut output = Vec::new();
        let report = CaptureDriver::new(fast_config(), sampler)
            .with_stop_handle(stop)
            .run_into(&mut output)
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Requested);
        assert_eq!(report.samples_read, 6);
        assert_eq!(report.samples_dropped, 0);
        assert_eq!(decode(output), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stop_before_first_sample() {
        let driver = CaptureDriver::new(fast_config(), ReplaySampler::new(vec![1]));
        driver.stop_handle().request_stop();
        let mut output = Vec::new();
        let report = driver.run_into(&mut output).unwrap();
        assert_eq!(report.samples_read, 0);
        assert!(output.is_empty());
    }

    #[test]
    fn test_wrapped_capture_keeps_latest_window() {
        let stop = StopHandle::new();
        let sampler = ReplaySampler::new((1..=11).collect()).stop_after(11, stop.clone());
        let config = CaptureConfig::new("unused.bin")
            .with_seconds(1)
            .with_rate_hz(8);
        let mut output = Vec::new();
        let report = CaptureDriver::new(config, sampler)
            .with_stop_handle(stop)
            .run_into(&mut output)
            .unwrap();

        assert_eq!(report.samples_read, 11);
        assert_eq!(report.samples_written, 8);
        assert_eq!(report.samples_dropped, 3);
        assert_eq!(decode(output), (4..=11).collect::<Vec<_>>());
    }

    #[test]
    fn test_sampler_init_failure() {
        let err = CaptureDriver::new(fast_config(), ReplaySampler::unavailable())
            .run_into(Vec::new())
            .unwrap_err();
        assert!(matches!(err, CaptureError::SamplerInit(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_trace_write_failure() {
        let config = fast_config().with_trigger_line(0);
        let err = CaptureDriver::new(config, ReplaySampler::new(vec![0, 1]))
            .run_into(FullDisk)
            .unwrap_err();
        assert!(matches!(err, CaptureError::WriteTrace { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_empty_window_fails_allocation() {
        let config = fast_config().with_seconds(0);
        let err = CaptureDriver::new(config, ReplaySampler::new(vec![0]))
            .run_into(Vec::new())
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Buffer(RingCaptureError::ZeroCapacity)
        ));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_invalid_trigger_line() {
        let config = fast_config().with_trigger_line(32);
        let err = CaptureDriver::new(config, ReplaySampler::new(vec![0]))
            .run_into(Vec::new())
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_output_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig::new(dir.path().join("missing").join("trace.bin"));
        let err = CaptureDriver::new(config, ReplaySampler::new(vec![0]))
            .run()
            .unwrap_err();
        assert!(matches!(err, CaptureError::OpenOutput { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_run_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        let config = CaptureConfig::new(&path)
            .with_seconds(1)
            .with_rate_hz(1_000_000)
            .with_trigger_line(0);
        let report = CaptureDriver::new(config, ReplaySampler::new(vec![2, 2, 3]))
            .run()
            .unwrap();
        assert_eq!(report.samples_written, 3);
        assert!(report.achieved_rate_hz() > 0.0);
        assert_eq!(
            TraceReader::open(&path).unwrap().read_all().unwrap(),
            vec![2, 2, 3]
        );
    }
}
