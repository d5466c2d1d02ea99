use crate::apis::mitre_attack::TechniqueIndex;
use crate::constants::MITIGATES;
use crate::error::{ConverterError, Result};
use crate::idempotency::IdentityResolver;
use crate::parser::controls::ControlGraph;
use crate::parser::MappingRow;
use crate::types::{Relationship, StixObject};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// Turn mapping rows into control -> technique relationships.
///
/// Fails closed: a row naming a control missing from `controls` or a
/// technique missing from `techniques` aborts the whole conversion.
#[instrument(skip(rows, controls, techniques, resolver), fields(rows = rows.len()))]
pub fn parse_mappings(
    rows: &[(usize, MappingRow)],
    file: &str,
    controls: &ControlGraph,
    techniques: &TechniqueIndex,
    resolver: &mut IdentityResolver<'_>,
) -> Result<Vec<StixObject>> {
    let mut relationships = Vec::new();
    let mut seen = HashSet::new();

    for (row_number, row) in rows {
        let control_id = row.control_id.trim();
        let technique_id = row.technique_id.trim();
        if control_id.is_empty() || technique_id.is_empty() {
            return Err(ConverterError::MalformedRow {
                file: file.to_string(),
                row: *row_number,
                message: "Control ID and Technique ID are required".to_string(),
            });
        }

        let source_ref = controls
            .stix_id(control_id)
            .ok_or_else(|| ConverterError::UnknownControl {
                file: file.to_string(),
                row: *row_number,
                control_id: control_id.to_string(),
            })?
            .to_string();
        let technique = techniques
            .resolve(technique_id)
            .ok_or_else(|| ConverterError::UnresolvedTechnique {
                file: file.to_string(),
                row: *row_number,
                technique_id: technique_id.to_string(),
            })?;

        if !seen.insert((source_ref.clone(), technique.stix_id.clone())) {
            debug!("Duplicate mapping {} -> {} at row {}", control_id, technique_id, row_number);
            continue;
        }

        let relationship_type = match row.mapping_type.trim() {
            "" => MITIGATES.to_string(),
            other => other.to_lowercase(),
        };
        let mut relationship = StixObject::Relationship(Relationship {
            id: resolver.relationship_id(&source_ref, &technique.stix_id),
            created: String::new(),
            modified: String::new(),
            relationship_type,
            source_ref,
            target_ref: technique.stix_id.clone(),
        });
        resolver.stamp(&mut relationship)?;
        relationships.push(relationship);
    }

    info!("Parsed {} control -> technique mappings", relationships.len());
    Ok(relationships)
}
