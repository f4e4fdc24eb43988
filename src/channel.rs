use crate::bus_sampler::{line_level, Sample, BUS_WIDTH};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Most channels a single decode can select.
pub const MAX_CHANNELS: usize = BUS_WIDTH as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("Channel selection '{0}' must look like <line>:<name>")]
    MissingColon(String),

    #[error("Channel selection '{0}' does not start with a line number")]
    InvalidLine(String),

    #[error("Line {0} is outside the 32-line bus")]
    LineOutOfRange(u32),

    #[error("Channel selection '{0}' has an empty name")]
    EmptyName(String),

    #[error("At least one channel must be selected")]
    NoChannels,

    #[error("At most 32 channels can be selected, got {0}")]
    TooManyChannels(usize),

    #[error("Channel name '{0}' is selected more than once")]
    DuplicateName(String),
}

/// A bus line and the name it is shown under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSelection {
    pub line: u8,
    pub name: String,
}

impl ChannelSelection {
    pub fn new<S: Into<String>>(line: u8, name: S) -> Result<Self, SelectionError> {
        if line >= BUS_WIDTH {
            return Err(SelectionError::LineOutOfRange(u32::from(line)));
        }
        let name = name.into();
        if name.is_empty() {
            return Err(SelectionError::EmptyName(format!("{}:", line)));
        }
        Ok(Self { line, name })
    }

    #[inline]
    pub fn level(&self, sample: Sample) -> bool {
        line_level(sample, self.line)
    }
}

impl FromStr for ChannelSelection {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (line, name) = s
            .split_once(':')
            .ok_or_else(|| SelectionError::MissingColon(s.to_string()))?;
        let line: u32 = line
            .trim()
            .parse()
            .map_err(|_| SelectionError::InvalidLine(s.to_string()))?;
        let line = u8::try_from(line)
            .ok()
            .filter(|line| *line < BUS_WIDTH)
            .ok_or(SelectionError::LineOutOfRange(line))?;
        if name.is_empty() {
            return Err(SelectionError::EmptyName(s.to_string()));
        }
        Ok(Self {
            line,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ChannelSelection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.name)
    }
}

/// Check that a selection list can be decoded in one pass.
///
/// Names become file names and column headers, so they must be unique. The
/// same line may be selected under several names.
pub fn check_selections(selections: &[ChannelSelection]) -> Result<(), SelectionError> {
    match selections.len() {
        0 => return Err(SelectionError::NoChannels),
        n if n > MAX_CHANNELS => return Err(SelectionError::TooManyChannels(n)),
        _ => {}
    }
    let mut seen = HashSet::with_capacity(selections.len());
    for selection in selections {
        if !seen.insert(selection.name.as_str()) {
            return Err(SelectionError::DuplicateName(selection.name.clone()));
        }
    }
    Ok(())
}

/// A channel switching to `value`, first visible at sample `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub index: u64,
    pub value: bool,
}

impl ChangeEvent {
    pub fn new(index: u64, value: bool) -> Self {
        Self { index, value }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.index, u8::from(self.value))
    }
}

/// Edge detector for one line.
///
/// Fed every sample in order, it reports an event whenever the line's level
/// differs from the previous sample. The level before the first sample is
/// unset, so the first sample always produces an event.
#[derive(Debug, Clone)]
pub struct ChannelEncoder {
    line: u8,
    last_event: Option<ChangeEvent>,
    last_index: Option<u64>,
}

impl ChannelEncoder {
    pub fn new(line: u8) -> Self {
        Self {
            line,
            last_event: None,
            last_index: None,
        }
    }

    pub fn line(&self) -> u8 {
        self.line
    }

    pub fn observe(&mut self, index: u64, sample: Sample) -> Option<ChangeEvent> {
        self.last_index = Some(index);
        let level = line_level(sample, self.line);
        if self.value() == Some(level) {
            return None;
        }
        let event = ChangeEvent::new(index, level);
        self.last_event = Some(event);
        Some(event)
    }

    /// Current level, `None` before the first sample.
    pub fn value(&self) -> Option<bool> {
        self.last_event.map(|event| event.value)
    }

    pub fn last_event(&self) -> Option<ChangeEvent> {
        self.last_event
    }

    /// Level the line held just before sample `index`.
    pub fn value_before(&self, index: u64) -> Option<bool> {
        let event = self.last_event?;
        if event.index == index {
            (index > 0).then_some(!event.value)
        } else {
            Some(event.value)
        }
    }

    /// Closing event restating the current level at the last observed index.
    pub fn finish(&self) -> Option<ChangeEvent> {
        Some(ChangeEvent::new(self.last_index?, self.value()?))
    }
}

/// All change events for one line, followed by the closing event.
pub fn encode_channel(line: u8, samples: &[Sample]) -> Vec<ChangeEvent> {
    let mut encoder = ChannelEncoder::new(line);
    let mut events: Vec<ChangeEvent> = samples
        .iter()
        .zip(0u64..)
        .filter_map(|(sample, index)| encoder.observe(index, *sample))
        .collect();
    events.extend(encoder.finish());
    events
}

/// Rebuild a line's level at each of `len` samples by holding each event's value.
pub fn replay_events(events: &[ChangeEvent], len: usize) -> Vec<bool> {
    let mut levels = Vec::with_capacity(len);
    let mut pending = events.iter().peekable();
    let mut level = false;
    for index in 0..len as u64 {
        while let Some(event) = pending.next_if(|event| event.index <= index) {
            level = event.value;
        }
        levels.push(level);
    }
    levels
}
