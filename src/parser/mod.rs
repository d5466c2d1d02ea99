use crate::error::{ConverterError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

pub mod controls;
pub mod mappings;

/// One row of the controls table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlRow {
    #[serde(rename = "FAMILY")]
    pub family: String,
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "TITLE")]
    pub title: String,
    #[serde(rename = "PRIORITY", default)]
    pub priority: String,
    #[serde(rename = "BASELINE-IMPACT", default)]
    pub baseline_impact: String,
    #[serde(rename = "DESCRIPTION", default)]
    pub description: String,
    #[serde(rename = "SUPPLEMENTAL GUIDANCE", default)]
    pub supplemental_guidance: String,
    #[serde(rename = "RELATED", default)]
    pub related: String,
}

/// One row of the control -> technique mappings table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingRow {
    #[serde(rename = "Control ID")]
    pub control_id: String,
    #[serde(rename = "Control Name", default)]
    pub control_name: String,
    #[serde(rename = "Mapping Type", default)]
    pub mapping_type: String,
    #[serde(rename = "Technique ID")]
    pub technique_id: String,
    #[serde(rename = "Technique Name", default)]
    pub technique_name: String,
}

/// Rows paired with their 1-based data row number, for error reporting
pub type Numbered<T> = Vec<(usize, T)>;

pub fn read_tsv<T: DeserializeOwned>(path: &Path) -> Result<Numbered<T>> {
    let file = File::open(path).map_err(|source| ConverterError::Input {
        path: path.display().to_string(),
        source,
    })?;
    read_tsv_from_reader(file, &path.display().to_string())
}

/// Read a header-led, tab-delimited table. Any row that does not match the
/// header or the row type aborts the read.
pub fn read_tsv_from_reader<R: Read, T: DeserializeOwned>(reader: R, label: &str) -> Result<Numbered<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (idx, result) in reader.deserialize::<T>().enumerate() {
        let row_number = idx + 1;
        let row = result.map_err(|e| ConverterError::MalformedRow {
            file: label.to_string(),
            row: row_number,
            message: e.to_string(),
        })?;
        rows.push((row_number, row));
    }
    debug!("Read {} rows from {}", rows.len(), label);
    Ok(rows)
}
