//! CSV export of the feature table.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::features::{FeatureTable, FeatureValue};

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("row for customer {customer_id} has {found} cells, schema has {expected} columns")]
    RowWidth {
        customer_id: String,
        found: usize,
        expected: usize,
    },
}

pub fn write_feature_table_csv(path: &Path, table: &FeatureTable) -> Result<(), ExportError> {
    let file = File::create(path)?;
    write_feature_table(file, table)?;
    info!(
        component = "export",
        event = "export.csv.written",
        path = %path.display(),
        rows = table.rows.len(),
        columns = table.schema.columns.len()
    );
    Ok(())
}

pub fn write_feature_table<W: Write>(writer: W, table: &FeatureTable) -> Result<(), ExportError> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(table.schema.column_names())?;

    let expected = table.schema.columns.len();
    for row in &table.rows {
        let cells = row.cells();
        if cells.len() != expected {
            return Err(ExportError::RowWidth {
                customer_id: row.customer_id.clone(),
                found: cells.len(),
                expected,
            });
        }
        out.write_record(cells.iter().map(format_cell))?;
    }
    out.flush()?;
    Ok(())
}

fn format_cell(cell: &FeatureValue<'_>) -> String {
    match cell {
        FeatureValue::Str(v) => (*v).to_string(),
        FeatureValue::I64(v) => v.to_string(),
        FeatureValue::F64(v) => v.to_string(),
        FeatureValue::Bool(true) => "True".to_string(),
        FeatureValue::Bool(false) => "False".to_string(),
        FeatureValue::DateTime(v) => v.format(DATE_FORMAT).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn formats_each_cell_kind() {
        let ts = NaiveDate::from_ymd_opt(2011, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(format_cell(&FeatureValue::DateTime(ts)), "2011-01-02 03:04:05");
        assert_eq!(format_cell(&FeatureValue::Bool(true)), "True");
        assert_eq!(format_cell(&FeatureValue::F64(10.5)), "10.5");
        assert_eq!(format_cell(&FeatureValue::I64(999)), "999");
        assert_eq!(format_cell(&FeatureValue::Str("17850")), "17850");
    }
}
