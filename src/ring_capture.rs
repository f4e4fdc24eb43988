use crate::bus_sampler::Sample;

#[derive(Debug, thiserror::Error)]
pub enum RingCaptureError {
    #[error("Capture buffer capacity must be at least one sample")]
    ZeroCapacity,

    #[error("Capture window of {seconds} s at {rate_hz} Hz does not fit in memory")]
    WindowTooLarge { seconds: u32, rate_hz: u32 },

    #[error("Failed to allocate capture buffer for {capacity} samples")]
    AllocationFailed { capacity: usize },
}

/// Fixed-capacity circular buffer of samples.
///
/// Holds the most recent `capacity` samples. Once full, every append silently
/// overwrites the oldest sample. `head` is the next slot to write; the oldest
/// retained sample sits at `head` after the first wrap and at 0 before it.
#[derive(Debug)]
pub struct RingCapture {
    slots: Vec<Sample>,
    head: usize,
    len: usize,
    appended: u64,
}

impl RingCapture {
    /// Allocate `capacity` zeroed slots.
    pub fn new(capacity: usize) -> Result<Self, RingCaptureError> {
        if capacity == 0 {
            return Err(RingCaptureError::ZeroCapacity);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| RingCaptureError::AllocationFailed { capacity })?;
        slots.resize(capacity, 0);

        Ok(Self {
            slots,
            head: 0,
            len: 0,
            appended: 0,
        })
    }

    /// Size the buffer for `seconds` of capture at `rate_hz`.
    pub fn for_window(seconds: u32, rate_hz: u32) -> Result<Self, RingCaptureError> {
        let capacity = usize::try_from(u64::from(seconds) * u64::from(rate_hz))
            .map_err(|_| RingCaptureError::WindowTooLarge { seconds, rate_hz })?;
        Self::new(capacity)
    }

    #[inline]
    pub fn append(&mut self, sample: Sample) {
        self.slots[self.head] = sample;
        self.head += 1;
        if self.head == self.slots.len() {
            self.head = 0;
        }
        if self.len < self.slots.len() {
            self.len += 1;
        }
        self.appended += 1;
    }

    /// Retained samples, oldest first.
    ///
    /// The oldest region runs from `head` to the end of the backing storage and
    /// is empty until the buffer has wrapped; the newest region runs from the
    /// start up to `head`.
    pub fn drain(&self) -> impl Iterator<Item = Sample> + '_ {
        let (newest, tail) = self.slots.split_at(self.head);
        let oldest = &tail[..self.len - self.head];
        oldest.iter().chain(newest).copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total number of samples ever appended.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Samples overwritten because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.appended - self.len as u64
    }

    pub fn has_wrapped(&self) -> bool {
        self.dropped() > 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.slots.len() * std::mem::size_of::<Sample>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            RingCapture::new(0),
            Err(RingCaptureError::ZeroCapacity)
        ));
    }

    #[test]
    fn test_window_capacity() {
        let ring = RingCapture::for_window(2, 4).unwrap();
        assert_eq!(ring.capacity(), 8);
        assert!(ring.is_empty());
        assert_eq!(ring.size_in_bytes(), 32);
    }

    #[test]
    fn test_drain_before_wrap() {
        let mut ring = RingCapture::new(8).unwrap();
        for sample in [5, 6, 7] {
            ring.append(sample);
        }
        assert_eq!(ring.drain().collect::<Vec<_>>(), vec![5, 6, 7]);
        assert!(!ring.has_wrapped());
    }

    #[test]
    fn test_drain_exactly_full() {
        let mut ring = RingCapture::new(4).unwrap();
        for sample in 1..=4 {
            ring.append(sample);
        }
        assert_eq!(ring.drain().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(ring.dropped(), 0);
    }

    #[test]
    fn test_drain_after_wrap() {
        let mut ring = RingCapture::new(4).unwrap();
        for sample in 1..=6 {
            ring.append(sample);
        }
        assert_eq!(ring.drain().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(ring.dropped(), 2);
        assert_eq!(ring.appended(), 6);
        assert!(ring.has_wrapped());
    }

    proptest! {
        #[test]
        fn test_drain_keeps_most_recent(
            samples in proptest::collection::vec(any::<u32>(), 0..200),
            capacity in 1usize..64,
        ) {
            let mut ring = RingCapture::new(capacity).unwrap();
            for &sample in &samples {
                ring.append(sample);
            }
            let keep = samples.len().min(capacity);
            let expected = &samples[samples.len() - keep..];
            prop_assert_eq!(ring.drain().collect::<Vec<_>>(), expected.to_vec());
            prop_assert_eq!(ring.len(), keep);
        }
    }
}
