use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConverterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TSV read failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot read input file {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{file}: row {row}: {message}")]
    MalformedRow {
        file: String,
        row: usize,
        message: String,
    },

    #[error("{file}: row {row}: unknown control '{control_id}'")]
    UnknownControl {
        file: String,
        row: usize,
        control_id: String,
    },

    #[error("{file}: row {row}: technique '{technique_id}' not found in ATT&CK data")]
    UnresolvedTechnique {
        file: String,
        row: usize,
        technique_id: String,
    },

    #[error("Prior output {path} has unexpected structure: {message}")]
    PriorOutput { path: String, message: String },

    #[error("Relationship {relationship} points at unknown object {reference}")]
    DanglingReference {
        relationship: String,
        reference: String,
    },

    #[error("Reference dataset error: {0}")]
    ReferenceData(String),
}

pub type Result<T> = std::result::Result<T, ConverterError>;
