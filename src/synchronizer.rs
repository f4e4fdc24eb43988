//! Cross-channel row synchronization for the combined table and event log.
//!
//! Rows are emitted only when at least one channel changes. A reader of the
//! output holds each value until the next row, so when a change arrives more
//! than one sample after the previous row, a gap row is emitted first at the
//! sample just before the change. It restates every channel's held level so
//! that no viewer interpolates across the gap.
//!
//! The gap decision is shared: one change with a gap reasserts all channels,
//! and every emitted row counts as reported for all channels.

use crate::bus_sampler::Sample;
use crate::channel::{ChannelEncoder, ChannelSelection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    /// Restates held levels at the sample before a change.
    Gap,
    /// At least one channel changed at this sample.
    Change,
    /// Terminal levels at the last sample of the trace.
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub value: bool,
    /// False for channels a sparse format may leave out of this row.
    pub reported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub index: u64,
    pub kind: RowKind,
    pub cells: Vec<Cell>,
}

impl Row {
    /// `(channel, value)` for each channel reported in this row.
    pub fn reported(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.reported)
            .map(|(channel, cell)| (channel, cell.value))
    }
}

/// Drives one [`ChannelEncoder`] per selected channel in lock-step.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    encoders: Vec<ChannelEncoder>,
    last_row: Option<u64>,
}

impl Synchronizer {
    pub fn new(channels: &[ChannelSelection]) -> Self {
        Self {
            encoders: channels
                .iter()
                .map(|channel| ChannelEncoder::new(channel.line))
                .collect(),
            last_row: None,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.encoders.len()
    }

    /// Feed the sample at `index`; returns the gap row and change row it produced.
    pub fn push(&mut self, index: u64, sample: Sample) -> [Option<Row>; 2] {
        let mut changed = false;
        for encoder in &mut self.encoders {
            changed |= encoder.observe(index, sample).is_some();
        }
        if !changed {
            return [None, None];
        }

        let gap = self.last_row.is_some_and(|row| row + 1 != index);
        let gap_row = gap.then(|| Row {
            index: index - 1,
            kind: RowKind::Gap,
            cells: self
                .encoders
                .iter()
                .map(|encoder| Cell {
                    value: encoder.value_before(index).unwrap_or(false),
                    reported: true,
                })
                .collect(),
        });

        let change_row = Row {
            index,
            kind: RowKind::Change,
            cells: self
                .encoders
                .iter()
                .map(|encoder| Cell {
                    value: encoder.value().unwrap_or(false),
                    reported: gap
                        || encoder
                            .last_event()
                            .is_some_and(|event| event.index == index),
                })
                .collect(),
        };

        self.last_row = Some(index);
        [gap_row, Some(change_row)]
    }

    /// Row restating every channel at the last sample, `None` for an empty trace.
    pub fn finish(&self) -> Option<Row> {
        let cells = self
            .encoders
            .iter()
            .map(|encoder| {
                encoder.finish().map(|event| Cell {
                    value: event.value,
                    reported: true,
                })
            })
            .collect::<Option<Vec<Cell>>>()?;
        let index = self.encoders.first()?.finish()?.index;
        Some(Row {
            index,
            kind: RowKind::Final,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_sampler::line_level;
    use proptest::prelude::*;

    fn channels(lines: &[u8]) -> Vec<ChannelSelection> {
        lines
            .iter()
            .map(|line| ChannelSelection::new(*line, format!("l{}", line)).unwrap())
            .collect()
    }

    fn run(lines: &[u8], samples: &[Sample]) -> Vec<Row> {
        let mut sync = Synchronizer::new(&channels(lines));
        let mut rows: Vec<Row> = samples
            .iter()
            .zip(0u64..)
            .flat_map(|(sample, index)| sync.push(index, *sample))
            .flatten()
            .collect();
        rows.extend(sync.finish());
        rows
    }

    fn indices(rows: &[Row]) -> Vec<(u64, RowKind)> {
        rows.iter().map(|row| (row.index, row.kind)).collect()
    }

    #[test]
    fn test_first_sample_reports_every_channel() {
        let rows = run(&[0, 1], &[0b10]);
        assert_eq!(rows[0].index, 0);
        assert_eq!(rows[0].kind, RowKind::Change);
        assert_eq!(
            rows[0].reported().collect::<Vec<_>>(),
            vec![(0, false), (1, true)]
        );
        assert_eq!(indices(&rows), vec![(0, RowKind::Change), (0, RowKind::Final)]);
    }

    #[test]
    fn test_adjacent_changes_need_no_gap_row() {
        // line 0 changes at 1, line 1 changes at 2
        let rows = run(&[0, 1], &[0b00, 0b01, 0b11, 0b11]);
        assert_eq!(
            indices(&rows),
            vec![
                (0, RowKind::Change),
                (1, RowKind::Change),
                (2, RowKind::Change),
                (3, RowKind::Final)
            ]
        );
        assert_eq!(rows[2].reported().collect::<Vec<_>>(), vec![(1, true)]);
    }

    #[test]
    fn test_separated_changes_close_gaps() {
        // A (line 0) changes at 2, B (line 1) changes at 5
        let samples = [0b00, 0b00, 0b01, 0b01, 0b01, 0b11, 0b11];
        let rows = run(&[0, 1], &samples);
        assert_eq!(
            indices(&rows),
            vec![
                (0, RowKind::Change),
                (1, RowKind::Gap),
                (2, RowKind::Change),
                (4, RowKind::Gap),
                (5, RowKind::Change),
                (6, RowKind::Final)
            ]
        );

        let gap = &rows[1];
        assert_eq!(
            gap.reported().collect::<Vec<_>>(),
            vec![(0, false), (1, false)]
        );
        let change = &rows[2];
        assert_eq!(
            change.reported().collect::<Vec<_>>(),
            vec![(0, true), (1, false)]
        );
        let final_row = &rows[5];
        assert_eq!(
            final_row.reported().collect::<Vec<_>>(),
            vec![(0, true), (1, true)]
        );
    }

    #[test]
    fn test_final_row_at_last_change() {
        let rows = run(&[0], &[0, 0, 1, 1, 0, 1, 1, 0]);
        let last_two: Vec<_> = indices(&rows).into_iter().rev().take(2).collect();
        assert_eq!(last_two, vec![(7, RowKind::Final), (7, RowKind::Change)]);
        assert!(!rows.last().unwrap().cells[0].value);
    }

    #[test]
    fn test_empty_trace_has_no_rows() {
        assert!(run(&[0, 1], &[]).is_empty());
    }

    #[test]
    fn test_same_line_twice() {
        let rows = run(&[2, 2], &[0, 4]);
        assert_eq!(rows[1].reported().collect::<Vec<_>>(), vec![(0, true), (1, true)]);
    }

    proptest! {
        #[test]
        fn test_rows_reproduce_levels_and_close_gaps(
            samples in proptest::collection::vec(0u32..16, 1..120),
            lines in proptest::collection::vec(0u8..4, 1..4),
        ) {
            let rows = run(&lines, &samples);

            // Change rows are always directly preceded by a row at index - 1.
            for pair in rows.windows(2) {
                if pair[1].kind == RowKind::Change {
                    prop_assert_eq!(pair[0].index + 1, pair[1].index);
                }
            }
            prop_assert_eq!(rows.first().map(|row| row.index), Some(0));
            prop_assert_eq!(
                rows.last().map(|row| (row.index, row.kind)),
                Some((samples.len() as u64 - 1, RowKind::Final))
            );

            // Holding each reported value reproduces every channel at every sample.
            for (channel, line) in lines.iter().enumerate() {
                let mut held = None;
                let mut pending = rows.iter().peekable();
                for (index, sample) in (0u64..).zip(&samples) {
                    while let Some(row) = pending.next_if(|row| row.index <= index) {
                        if row.cells[channel].reported {
                            held = Some(row.cells[channel].value);
                        }
                    }
                    prop_assert_eq!(held, Some(line_level(*sample, *line)));
                }
            }
        }
    }
}
