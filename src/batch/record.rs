use super::BatchError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One row of a batch: column name to value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            fields: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Ordered records of one batch artifact. Record identity is the row position.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Artifact key the batch was read from
    pub name: String,
    pub discovered_at: DateTime<Utc>,
    /// Header row, in file order
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

impl Batch {
    /// Parse a delimited CSV artifact with a header row.
    ///
    /// Every column in `required` must be present in the header.
    pub fn parse(
        name: &str,
        content: &[u8],
        delimiter: u8,
        required: &[&str],
        discovered_at: DateTime<Utc>,
    ) -> Result<Self, BatchError> {
        let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(content);

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        for column in required {
            if !columns.iter().any(|c| c == column) {
                return Err(BatchError::MissingColumn(column.to_string()));
            }
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            records.push(Record::from_pairs(
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(str::to_string)),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            discovered_at,
            columns,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Split into the first `count` records and the rest, keeping order.
    /// The remainder keeps the same columns and is named `remainder_name`.
    pub fn split_at(mut self, count: usize, remainder_name: String) -> (Batch, Batch) {
        let count = count.min(self.records.len());
        let rest = self.records.split_off(count);
        let remainder = Batch {
            name: remainder_name,
            discovered_at: self.discovered_at,
            columns: self.columns.clone(),
            records: rest,
        };
        (self, remainder)
    }

    /// Serialize with the same header and column order the batch was read with
    pub fn to_csv(&self, delimiter: u8) -> Result<Vec<u8>, BatchError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(Vec::new());

        writer.write_record(&self.columns)?;
        for record in &self.records {
            writer.write_record(
                self.columns
                    .iter()
                    .map(|column| record.get(column).unwrap_or_default()),
            )?;
        }

        writer
            .into_inner()
            .map_err(|e| BatchError::Write(e.to_string()))
    }
}
