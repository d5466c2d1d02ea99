/// Default locations and identifiers shared across the converter
/// These mirror the layout of the framework's `data/` directory

// Default file paths (used by CLI and config fallbacks)
pub const DEFAULT_INPUT_CONTROLS: &str = "data/800-53-r4-controls.tsv";
pub const DEFAULT_INPUT_MAPPINGS: &str = "data/800-53-r4-mappings.tsv";
pub const DEFAULT_OUTPUT_CONTROLS: &str = "data/800-53-r4-controls.json";
pub const DEFAULT_OUTPUT_MAPPINGS: &str = "data/800-53-r4-mappings.json";

pub const DEFAULT_ATTACK_URL: &str =
    "https://raw.githubusercontent.com/mitre/cti/subtechniques/enterprise-attack/enterprise-attack.json";
pub const DEFAULT_ATTACK_TIMEOUT_SECS: u64 = 60;

// STIX vocabulary
pub const STIX_SPEC_VERSION: &str = "2.0";
pub const CONTROL_SOURCE_NAME: &str = "NIST 800-53 Revision 4";
pub const ATTACK_SOURCE_NAME: &str = "mitre-attack";

pub const SUBCONTROL_OF: &str = "subcontrol-of";
pub const RELATED_TO: &str = "related-to";
pub const MITIGATES: &str = "mitigates";

/// Separator for the relationship natural key: `<source_ref>---<target_ref>`
pub const RELATIONSHIP_KEY_SEPARATOR: &str = "---";

/// Build the natural key used to reuse relationship ids between runs
pub fn relationship_key(source_ref: &str, target_ref: &str) -> String {
    format!("{source_ref}{RELATIONSHIP_KEY_SEPARATOR}{target_ref}")
}
