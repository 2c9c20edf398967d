/// Track table module.
///
/// The tracked-cell matrix is a plain numeric table with one row per
/// measurement. This module names its columns and flattens it into the two
/// forms the browser reads: CSV and a columnar protobuf blob.
use crate::error::{Error, Result};
use crate::labels::Measurement;
use crate::pb;
use ndarray::{concatenate, Array2, Axis};
use prost::Message;

pub const SEGMENT_LABEL_COLUMN: &str = "segmentLabel";

#[derive(Clone, Debug, PartialEq)]
pub struct TrackTable {
    pub columns: Vec<String>,
    pub rows: Array2<f64>,
}

impl TrackTable {
    /// Name the columns of `rows`. Columns beyond `names` become `col{n}`
    /// (1-based, like MATLAB); unused names are dropped.
    pub fn new(rows: Array2<f64>, names: &[String]) -> TrackTable {
        let columns = (0..rows.ncols())
            .map(|c| match names.get(c) {
                Some(name) => name.clone(),
                None => format!("col{}", c + 1),
            })
            .collect();
        TrackTable { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| Error::BadRequest(format!("track table has no `{}` column", name)))
    }

    /// One measurement per row, read from the named columns.
    pub fn measurements(&self, x: &str, y: &str, frame: &str) -> Result<Vec<Measurement>> {
        let (xi, yi, fi) = (
            self.require_column(x)?,
            self.require_column(y)?,
            self.require_column(frame)?,
        );
        Ok(self
            .rows
            .outer_iter()
            .map(|row| Measurement {
                x: row[xi],
                y: row[yi],
                frame: row[fi],
            })
            .collect())
    }

    /// Rows whose `column` equals `value`.
    pub fn rows_where(&self, column: &str, value: f64) -> Result<Vec<usize>> {
        let ci = self.require_column(column)?;
        Ok(self
            .rows
            .column(ci)
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == value)
            .map(|(i, _)| i)
            .collect())
    }

    /// Distinct values of `column`, ascending.
    pub fn distinct(&self, column: &str) -> Result<Vec<f64>> {
        let ci = self.require_column(column)?;
        let mut values: Vec<f64> = self.rows.column(ci).to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        Ok(values)
    }

    /// Append the `segmentLabel` column.
    pub fn with_segment_labels(self, labels: &[u32]) -> Result<TrackTable> {
        if labels.len() != self.rows.nrows() {
            return Err(Error::BadRequest(format!(
                "{} segment labels for {} rows",
                labels.len(),
                self.rows.nrows()
            )));
        }
        let column = Array2::from_shape_fn((labels.len(), 1), |(r, _)| f64::from(labels[r]));
        let rows = concatenate(Axis(1), &[self.rows.view(), column.view()])?;
        let mut columns = self.columns;
        columns.push(SEGMENT_LABEL_COLUMN.to_string());
        Ok(TrackTable { columns, rows })
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in self.rows.outer_iter() {
            writer.write_record(row.iter().map(|&v| format_value(v)))?;
        }
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }

    pub fn to_protobuf(&self) -> Vec<u8> {
        let message = pb::TrackTable {
            columns: self
                .columns
                .iter()
                .zip(self.rows.columns())
                .map(|(name, values)| pb::TrackColumn {
                    name: name.clone(),
                    values: values.to_vec(),
                })
                .collect(),
        };
        message.encode_to_vec()
    }
}

/// Integral values print without a fraction, so ids and frame numbers read
/// as `12` rather than `12.0`.
fn format_value(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else if v.is_nan() {
        String::new()
    } else {
        format!("{}", v)
    }
}
