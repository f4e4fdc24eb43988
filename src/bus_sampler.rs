use crate::capture::StopHandle;

/// One reading of the whole bus: bit `p` holds the level of line `p`.
pub type Sample = u32;

/// Number of lines a [`Sample`] can carry.
pub const BUS_WIDTH: u8 = 32;

/// Level of `line` in `sample`. Lines outside the bus always read low.
#[inline]
pub fn line_level(sample: Sample, line: u8) -> bool {
    sample
        .checked_shr(u32::from(line))
        .is_some_and(|shifted| shifted & 1 == 1)
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[cfg(target_os = "linux")]
    #[error("GPIO character device error: {0}")]
    Gpio(#[from] gpio_cdev::Error),

    #[error("Bus sampler is not available: {0}")]
    Unavailable(String),

    #[error("Bus sampler used before init")]
    NotInitialized,
}

/// Source of instantaneous bus levels.
///
/// `init` runs once before the sampling loop and its failure is fatal.
/// `read_bus_level` is called once per sample period from the timing-critical
/// loop, so implementations should not block or log there.
pub trait BusSampler {
    fn init(&mut self) -> Result<(), SamplerError>;

    fn read_bus_level(&mut self) -> Result<Sample, SamplerError>;

    fn shutdown(&mut self) {}

    /// Compact per-line configuration, four lines per group (e.g. `iiii oo-- ...`).
    fn describe_lines(&self) -> Option<String> {
        None
    }
}

/// Replays a fixed list of samples, holding the last level once exhausted.
///
/// Used to drive the capture loop without hardware. With [`Self::stop_after`]
/// the sampler raises the driver's stop flag after the given number of reads,
/// which is how an external signal shows up to the loop.
#[derive(Debug, Clone, Default)]
pub struct ReplaySampler {
    samples: Vec<Sample>,
    position: usize,
    reads: u64,
    stop_after: Option<(u64, StopHandle)>,
    unavailable: bool,
    initialized: bool,
}

impl ReplaySampler {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            ..Self::default()
        }
    }

    /// A sampler whose `init` always fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn stop_after(mut self, reads: u64, stop: StopHandle) -> Self {
        self.stop_after = Some((reads, stop));
        self
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl BusSampler for ReplaySampler {
    fn init(&mut self) -> Result<(), SamplerError> {
        if self.unavailable {
            return Err(SamplerError::Unavailable("replay source disabled".to_string()));
        }
        self.initialized = true;
        Ok(())
    }

    fn read_bus_level(&mut self) -> Result<Sample, SamplerError> {
        if !self.initialized {
            return Err(SamplerError::NotInitialized);
        }
        let sample = match self.samples.get(self.position) {
            Some(sample) => {
                self.position += 1;
                *sample
            }
            None => self.samples.last().copied().unwrap_or(0),
        };
        self.reads += 1;
        if let Some((limit, stop)) = &self.stop_after {
            if self.reads >= *limit {
                stop.request_stop();
            }
        }
        Ok(sample)
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }
}

#[cfg(target_os = "linux")]
pub use gpio::GpioChipSampler;

#[cfg(target_os = "linux")]
mod gpio {
    use super::{BusSampler, Sample, SamplerError, BUS_WIDTH};
    use gpio_cdev::{Chip, LineDirection, LineRequestFlags, MultiLineHandle};
    use std::path::{Path, PathBuf};

    const CONSUMER: &str = "logictrace";

    /// Samples the first 32 lines of a GPIO chip through the character device.
    ///
    /// Only lines that are inputs and not claimed by another consumer are
    /// requested, so capturing never changes the direction of a pin. The
    /// remaining lines always read low.
    pub struct GpioChipSampler {
        chip_path: PathBuf,
        handle: Option<MultiLineHandle>,
        offsets: Vec<u32>,
        layout: Option<String>,
    }

    impl GpioChipSampler {
        pub fn new<P: AsRef<Path>>(chip_path: P) -> Self {
            Self {
                chip_path: chip_path.as_ref().to_path_buf(),
                handle: None,
                offsets: Vec::new(),
                layout: None,
            }
        }
    }

    impl BusSampler for GpioChipSampler {
        fn init(&mut self) -> Result<(), SamplerError> {
            log::debug!("Opening GPIO chip {}", self.chip_path.display());
            let mut chip = Chip::new(&self.chip_path)?;
            let line_count = chip.num_lines().min(u32::from(BUS_WIDTH));

            let mut layout = String::new();
            let mut offsets = Vec::new();
            for offset in 0..u32::from(BUS_WIDTH) {
                if offset % 4 == 0 && offset != 0 {
                    layout.push(' ');
                }
                if offset >= line_count {
                    layout.push('-');
                    continue;
                }
                let info = chip.get_line(offset)?.info()?;
                match info.direction() {
                    LineDirection::Out => layout.push('o'),
                    LineDirection::In if info.is_used() => layout.push('-'),
                    LineDirection::In => {
                        layout.push('i');
                        offsets.push(offset);
                    }
                }
            }

            if offsets.is_empty() {
                return Err(SamplerError::Unavailable(format!(
                    "no free input lines on {}",
                    self.chip_path.display()
                )));
            }

            let defaults = vec![0u8; offsets.len()];
            let handle = chip
                .get_lines(&offsets)?
                .request(LineRequestFlags::INPUT, &defaults, CONSUMER)?;
            log::debug!("Requested {} input lines", offsets.len());

            self.handle = Some(handle);
            self.offsets = offsets;
            self.layout = Some(layout);
            Ok(())
        }

        fn read_bus_level(&mut self) -> Result<Sample, SamplerError> {
            let handle = self.handle.as_ref().ok_or(SamplerError::NotInitialized)?;
            let values = handle.get_values()?;
            Ok(values
                .iter()
                .zip(&self.offsets)
                .filter(|(value, _)| **value != 0)
                .fold(0, |acc, (_, offset)| acc | (1 << offset)))
        }

        fn shutdown(&mut self) {
            self.handle = None;
        }

        fn describe_lines(&self) -> Option<String> {
            self.layout.clone()
        }
    }
}
