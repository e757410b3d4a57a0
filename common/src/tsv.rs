use thiserror::Error;

/// Column holding the trait name in a heritability table
/// (`AssayNumber, Strain, TraitName, Replicate, Value`).
pub const TRAIT_COLUMN: usize = 2;

#[derive(Debug, Error, PartialEq)]
pub enum TsvError {
    #[error("table has no data rows")]
    Empty,

    #[error("row {row} has {found} columns, expected at least {expected}")]
    ShortRow {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("unreadable table: {0}")]
    Malformed(String),
}

/// Summary of an uploaded trait table.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitTable {
    pub trait_name: String,
    pub rows: usize,
}

/// Reads a tab separated table with a header row and returns the trait
/// named in the first data row plus the number of data rows.
pub fn inspect_trait_table(data: &str) -> Result<TraitTable, TsvError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());

    let mut trait_name = None;
    let mut rows = 0;

    for (i, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| TsvError::Malformed(e.to_string()))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if trait_name.is_none() {
            let name = record.get(TRAIT_COLUMN).ok_or(TsvError::ShortRow {
                row: i + 1,
                found: record.len(),
                expected: TRAIT_COLUMN + 1,
            })?;
            trait_name = Some(name.to_string());
        }
        rows += 1;
    }

    match trait_name {
        Some(trait_name) if !trait_name.is_empty() => Ok(TraitTable { trait_name, rows }),
        _ => Err(TsvError::Empty),
    }
}
