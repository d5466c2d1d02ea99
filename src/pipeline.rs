use crate::apis::mitre_attack::{load_techniques, AttackSource, TechniqueIndex};
use crate::config::Settings;
use crate::error::{ConverterError, Result};
use crate::idempotency::{IdentityResolver, PriorBundle};
use crate::parser::controls::{parse_controls, ControlGraph};
use crate::parser::mappings::parse_mappings;
use crate::parser::{read_tsv, ControlRow, MappingRow};
use crate::storage::write_bundle;
use crate::types::{Bundle, StixObject};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, instrument};

/// Result of a complete conversion run
#[derive(Debug, Serialize)]
pub struct ConversionResult {
    pub controls: usize,
    pub control_relationships: usize,
    pub mappings: usize,
    pub ids_reused: usize,
    pub ids_generated: usize,
    pub output_controls: String,
    pub output_mappings: String,
}

pub struct Pipeline;

impl Pipeline {
    #[instrument(skip_all)]
    pub async fn run(settings: &Settings, source: &dyn AttackSource) -> Result<ConversionResult> {
        Self::run_at(settings, source, Utc::now()).await
    }

    /// Run the conversion with an explicit run timestamp for new/changed objects.
    /// Nothing is written unless both bundles were built successfully.
    pub async fn run_at(
        settings: &Settings,
        source: &dyn AttackSource,
        run_time: DateTime<Utc>,
    ) -> Result<ConversionResult> {
        // Step 1: controls
        let controls_label = settings.input_controls.display().to_string();
        info!("📥 Reading controls from {}", controls_label);
        let control_rows = read_tsv::<ControlRow>(&settings.input_controls)?;

        let prior_controls = PriorBundle::load(&settings.output_controls)?;
        let mut control_resolver = IdentityResolver::new(&prior_controls, run_time);
        let graph = parse_controls(&control_rows, &controls_label, &mut control_resolver)?;
        let controls_bundle = Bundle::new(control_resolver.bundle_id(), graph.objects());
        verify_control_bundle(&controls_bundle)?;

        // Step 2: reference dataset
        let techniques = load_techniques(source).await?;

        // Step 3: mappings
        let mappings_label = settings.input_mappings.display().to_string();
        info!("📥 Reading mappings from {}", mappings_label);
        let mapping_rows = read_tsv::<MappingRow>(&settings.input_mappings)?;

        let prior_mappings = PriorBundle::load(&settings.output_mappings)?;
        let mut mapping_resolver = IdentityResolver::new(&prior_mappings, run_time);
        let mappings = parse_mappings(&mapping_rows, &mappings_label, &graph, &techniques, &mut mapping_resolver)?;
        let mappings_bundle = Bundle::new(mapping_resolver.bundle_id(), mappings);
        verify_mapping_bundle(&mappings_bundle, &graph, &techniques)?;

        // Step 4: persist
        write_bundle(&controls_bundle, &settings.output_controls)?;
        write_bundle(&mappings_bundle, &settings.output_mappings)?;

        let result = ConversionResult {
            controls: graph.controls.len(),
            control_relationships: graph.relationships.len(),
            mappings: mappings_bundle.objects.len(),
            ids_reused: control_resolver.reused + mapping_resolver.reused,
            ids_generated: control_resolver.generated + mapping_resolver.generated,
            output_controls: settings.output_controls.display().to_string(),
            output_mappings: settings.output_mappings.display().to_string(),
        };
        info!(
            "✅ Conversion finished: {} controls, {} control relationships, {} mappings ({} ids reused, {} generated)",
            result.controls,
            result.control_relationships,
            result.mappings,
            result.ids_reused,
            result.ids_generated
        );
        Ok(result)
    }
}

fn dangling(relationship: &str, reference: &str) -> ConverterError {
    ConverterError::DanglingReference {
        relationship: relationship.to_string(),
        reference: reference.to_string(),
    }
}

/// Every relationship in the controls bundle must join two controls of that bundle
pub fn verify_control_bundle(bundle: &Bundle) -> Result<()> {
    let ids: HashSet<&str> = bundle.controls().map(|c| c.id.as_str()).collect();
    for rel in bundle.relationships() {
        for reference in [&rel.source_ref, &rel.target_ref] {
            if !ids.contains(reference.as_str()) {
                return Err(dangling(&rel.id, reference));
            }
        }
    }
    Ok(())
}

/// Every mapping must run from a known control to a known technique
pub fn verify_mapping_bundle(bundle: &Bundle, controls: &ControlGraph, techniques: &TechniqueIndex) -> Result<()> {
    let control_ids: HashSet<&str> = controls.control_stix_ids().collect();
    let technique_ids: HashSet<&str> = techniques.stix_ids().collect();
    for object in &bundle.objects {
        let StixObject::Relationship(rel) = object else {
            return Err(dangling(object.id(), "non-relationship object in mappings bundle"));
        };
        if !control_ids.contains(rel.source_ref.as_str()) {
            return Err(dangling(&rel.id, &rel.source_ref));
        }
        if !technique_ids.contains(rel.target_ref.as_str()) {
            return Err(dangling(&rel.id, &rel.target_ref));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ControlRow;
    use crate::types::Relationship;
    use serde_json::json;

    fn mitigates(id: &str, source_ref: &str, target_ref: &str) -> StixObject {
        StixObject::Relationship(Relationship {
            id: id.into(),
            created: String::new(),
            modified: String::new(),
            relationship_type: "mitigates".into(),
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
        })
    }

    #[test]
    fn test_verify_control_bundle_flags_dangling_edge() {
        let bundle = Bundle::new(
            "bundle--1".into(),
            vec![StixObject::Relationship(Relationship {
                id: "relationship--1".into(),
                created: String::new(),
                modified: String::new(),
                relationship_type: "subcontrol-of".into(),
                source_ref: "course-of-action--missing".into(),
                target_ref: "course-of-action--also-missing".into(),
            })],
        );
        assert!(matches!(
            verify_control_bundle(&bundle),
            Err(ConverterError::DanglingReference { .. })
        ));
        assert!(verify_control_bundle(&Bundle::new("bundle--2".into(), vec![])).is_ok());
    }

    #[test]
    fn test_verify_mapping_bundle_checks_both_ends() {
        let rows = vec![(
            1,
            ControlRow {
                family: "ACCESS CONTROL".into(),
                name: "AC-2".into(),
                title: "Account Management".into(),
                ..Default::default()
            },
        )];
        let prior = PriorBundle::empty();
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        let graph = parse_controls(&rows, "controls.tsv", &mut resolver).unwrap();
        let techniques = TechniqueIndex::from_slice(
            &serde_json::to_vec(&json!({"objects": [{
                "type": "attack-pattern",
                "id": "attack-pattern--t1078",
                "external_references": [{"source_name": "mitre-attack", "external_id": "T1078"}]
            }]}))
            .unwrap(),
        )
        .unwrap();
        let control = graph.stix_id("AC-2").unwrap().to_string();

        let good = Bundle::new("bundle--m".into(), vec![mitigates("relationship--1", &control, "attack-pattern--t1078")]);
        assert!(verify_mapping_bundle(&good, &graph, &techniques).is_ok());

        let unknown_target = Bundle::new("bundle--m".into(), vec![mitigates("relationship--2", &control, "attack-pattern--nope")]);
        match verify_mapping_bundle(&unknown_target, &graph, &techniques) {
            Err(ConverterError::DanglingReference { reference, .. }) => assert_eq!(reference, "attack-pattern--nope"),
            other => panic!("unexpected result: {other:?}"),
        }

        let unknown_source = Bundle::new(
            "bundle--m".into(),
            vec![mitigates("relationship--3", "course-of-action--nope", "attack-pattern--t1078")],
        );
        assert!(verify_mapping_bundle(&unknown_source, &graph, &techniques).is_err());
    }
}
