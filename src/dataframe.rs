use crate::bus_sampler::Sample;
use crate::channel::ChannelSelection;
use polars::prelude::*;

pub const TIME_COLUMN_NAME: &str = "time";
pub const RAW_COLUMN_NAME: &str = "raw";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

/// Tabulate a trace: a `time` column in seconds, the `raw` bus word, and one
/// boolean column per selected channel, named after the channel.
///
/// Channel names must be unique and must not clash with `time` or `raw`.
pub fn trace_to_dataframe(
    samples: &[Sample],
    selections: &[ChannelSelection],
    rate_hz: u32,
) -> PolarsResult<DataFrame> {
    if rate_hz == 0 {
        return Err(PolarsError::ComputeError(
            "sample rate must be positive".into(),
        ));
    }

    let mut columns: Vec<Column> = Vec::with_capacity(selections.len() + 1);
    columns.push(Series::new(RAW_COLUMN_NAME.into(), samples).into());
    for selection in selections {
        let levels: Vec<bool> = samples.iter().map(|s| selection.level(*s)).collect();
        columns.push(Series::new(selection.name.as_str().into(), levels).into());
    }

    let mut projection = vec![col(TIME_COLUMN_NAME), col(RAW_COLUMN_NAME)];
    projection.extend(selections.iter().map(|s| col(s.name.as_str())));

    DataFrame::new(columns)?
        .lazy()
        .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
        .with_columns([(col(ROW_INDEX_COLUMN_NAME).cast(DataType::Float64)
            * lit(1.0 / f64::from(rate_hz)))
        .alias(TIME_COLUMN_NAME)])
        .select(projection)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selections(spec: &[&str]) -> Vec<ChannelSelection> {
        spec.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_columns_and_levels() {
        let samples = [0b000, 0b001, 0b101, 0b100];
        let df = trace_to_dataframe(&samples, &selections(&["0:clk", "2:data"]), 4).unwrap();

        let names: Vec<&str> = df.get_column_names().into_iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["time", "raw", "clk", "data"]);
        assert_eq!(df.height(), 4);

        let time: Vec<Option<f64>> = df.column("time").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(time, vec![Some(0.0), Some(0.25), Some(0.5), Some(0.75)]);

        let clk: Vec<Option<bool>> = df.column("clk").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(clk, vec![Some(false), Some(true), Some(true), Some(false)]);
        let data: Vec<Option<bool>> =
            df.column("data").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(data, vec![Some(false), Some(false), Some(true), Some(true)]);

        let raw = df.column("raw").unwrap().u32().unwrap();
        assert_eq!(raw.get(2), Some(0b101));
    }

    #[test]
    fn test_empty_trace() {
        let df = trace_to_dataframe(&[], &selections(&["0:a"]), 1).unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.width(), 3);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(trace_to_dataframe(&[0], &selections(&["0:a", "1:a"]), 1).is_err());
        assert!(trace_to_dataframe(&[0], &selections(&["0:raw"]), 1).is_err());
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(trace_to_dataframe(&[0], &selections(&["0:a"]), 0).is_err());
    }
}
