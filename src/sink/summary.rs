use std::collections::BTreeMap;
use std::io::BufWriter;
use std::path::Path;

use tracing::info;

use crate::batch::OperationAggregate;
use crate::sink::{close_csv, create_file, SinkError, TIMESTAMP_FORMAT};

const SUMMARY_HEADER: [&str; 5] = [
    "PROCEDURE",
    "EARLIEST_START_TIME",
    "LATEST_END_TIME",
    "EXECUTION_SECONDS",
    "STATUS",
];

/// Write one row per operation, sorted by operation name
pub fn write_summary(
    path: impl AsRef<Path>,
    summary: &BTreeMap<String, OperationAggregate>,
) -> Result<(), SinkError> {
    let path = path.as_ref();
    let file = create_file(path)?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    writer.write_record(SUMMARY_HEADER)?;

    for (operation, aggregate) in summary {
        writer.write_record([
            operation.clone(),
            aggregate.earliest_start.format(TIMESTAMP_FORMAT).to_string(),
            aggregate.latest_end.format(TIMESTAMP_FORMAT).to_string(),
            format!("{:.3}", aggregate.elapsed().as_secs_f64()),
            aggregate.status.to_string(),
        ])?;
    }

    close_csv(writer)?;

    info!(path = %path.display(), operations = summary.len(), "Summary written");
    Ok(())
}
