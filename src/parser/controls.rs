use crate::constants::{RELATED_TO, SUBCONTROL_OF};
use crate::error::{ConverterError, Result};
use crate::idempotency::IdentityResolver;
use crate::parser::ControlRow;
use crate::types::{CourseOfAction, ExternalReference, Relationship, StixObject};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

static BASE_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}-\d+$").expect("base control pattern"));
static ENHANCEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]{2}-\d+)\s*\(\d+\)$").expect("enhancement pattern"));

/// Catalog identifier of a control, e.g. `AC-2` or the enhancement `AC-2 (1)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlId {
    Base(String),
    Enhancement { id: String, parent: String },
}

impl ControlId {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if BASE_CONTROL.is_match(raw) {
            return Some(ControlId::Base(raw.to_string()));
        }
        ENHANCEMENT.captures(raw).map(|caps| ControlId::Enhancement {
            id: raw.to_string(),
            parent: caps[1].to_string(),
        })
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            ControlId::Base(_) => None,
            ControlId::Enhancement { parent, .. } => Some(parent),
        }
    }
}

/// Controls plus the relationships between them, in input order
#[derive(Debug, Clone, Default)]
pub struct ControlGraph {
    pub controls: Vec<StixObject>,
    pub relationships: Vec<StixObject>,
    ids: HashMap<String, String>,
}

impl ControlGraph {
    /// STIX id assigned to a catalog identifier
    pub fn stix_id(&self, natural_id: &str) -> Option<&str> {
        self.ids.get(natural_id.trim()).map(String::as_str)
    }

    /// STIX ids of every control in the graph
    pub fn control_stix_ids(&self) -> impl Iterator<Item = &str> {
        self.controls.iter().map(StixObject::id)
    }

    /// Controls first, then relationships: the order written to the bundle
    pub fn objects(&self) -> Vec<StixObject> {
        self.controls
            .iter()
            .chain(self.relationships.iter())
            .cloned()
            .collect()
    }
}

fn malformed(file: &str, row: usize, message: impl Into<String>) -> ConverterError {
    ConverterError::MalformedRow {
        file: file.to_string(),
        row,
        message: message.into(),
    }
}

fn compose_description(row: &ControlRow) -> String {
    let text = row.description.trim();
    let guidance = row.supplemental_guidance.trim();
    match (text.is_empty(), guidance.is_empty()) {
        (_, true) => text.to_string(),
        (true, false) => format!("Supplemental Guidance: {guidance}"),
        (false, false) => format!("{text}\n\nSupplemental Guidance: {guidance}"),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_control(row: &ControlRow, stix_id: String) -> CourseOfAction {
    let priority = row.priority.trim();
    CourseOfAction {
        id: stix_id,
        created: String::new(),
        modified: String::new(),
        name: row.title.trim().to_string(),
        description: compose_description(row),
        external_references: vec![ExternalReference::control(row.name.trim())],
        x_mitre_family: row.family.trim().to_string(),
        x_mitre_priority: (!priority.is_empty()).then(|| priority.to_string()),
        x_mitre_impact: split_list(&row.baseline_impact),
    }
}

/// Build the control graph. Prior ids are reused through `resolver`; fresh
/// ones are generated for natural keys it has not seen.
#[instrument(skip(rows, resolver), fields(rows = rows.len()))]
pub fn parse_controls(
    rows: &[(usize, ControlRow)],
    file: &str,
    resolver: &mut IdentityResolver<'_>,
) -> Result<ControlGraph> {
    let mut graph = ControlGraph::default();
    let mut parsed_ids = Vec::with_capacity(rows.len());

    // Pass 1: one course-of-action per row
    for (row_number, row) in rows {
        let name = row.name.trim();
        if name.is_empty() {
            return Err(malformed(file, *row_number, "empty NAME"));
        }
        if row.title.trim().is_empty() {
            return Err(malformed(file, *row_number, format!("control {name} has an empty TITLE")));
        }
        let control_id = ControlId::parse(name)
            .ok_or_else(|| malformed(file, *row_number, format!("malformed control identifier '{name}'")))?;
        if graph.ids.contains_key(name) {
            return Err(malformed(file, *row_number, format!("duplicate control identifier '{name}'")));
        }

        let stix_id = resolver.control_id(name);
        debug!("Control {} -> {}", name, stix_id);
        graph.ids.insert(name.to_string(), stix_id.clone());
        graph
            .controls
            .push(StixObject::CourseOfAction(build_control(row, stix_id)));
        parsed_ids.push(control_id);
    }

    // Pass 2: hierarchy and cross references, now that every control has an id
    let mut seen = HashSet::new();
    for ((row_number, row), control_id) in rows.iter().zip(&parsed_ids) {
        let name = row.name.trim();
        let source_ref = graph.ids[name].clone();

        if let Some(parent) = control_id.parent() {
            let target_ref = graph.stix_id(parent).map(str::to_string).ok_or_else(|| {
                malformed(file, *row_number, format!("enhancement {name} has no base control {parent}"))
            })?;
            push_relationship(&mut graph, &mut seen, resolver, SUBCONTROL_OF, source_ref.clone(), target_ref);
        }

        for related in split_list(&row.related) {
            if related == name {
                continue;
            }
            let target = graph.stix_id(&related).map(str::to_string);
            match target {
                Some(target_ref) => {
                    push_relationship(&mut graph, &mut seen, resolver, RELATED_TO, source_ref.clone(), target_ref)
                }
                None => warn!("{}: row {}: related control {} not in catalog, skipping", file, row_number, related),
            }
        }
    }

    for object in graph.controls.iter_mut().chain(graph.relationships.iter_mut()) {
        resolver.stamp(object)?;
    }

    info!(
        "Parsed {} controls and {} control relationships",
        graph.controls.len(),
        graph.relationships.len()
    );
    Ok(graph)
}

fn push_relationship(
    graph: &mut ControlGraph,
    seen: &mut HashSet<(String, String)>,
    resolver: &mut IdentityResolver<'_>,
    relationship_type: &str,
    source_ref: String,
    target_ref: String,
) {
    if !seen.insert((source_ref.clone(), target_ref.clone())) {
        return;
    }
    let id = resolver.relationship_id(&source_ref, &target_ref);
    graph.relationships.push(StixObject::Relationship(Relationship {
        id,
        created: String::new(),
        modified: String::new(),
        relationship_type: relationship_type.to_string(),
        source_ref,
        target_ref,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::PriorBundle;
    use chrono::Utc;

    fn row(name: &str, title: &str, related: &str) -> (usize, ControlRow) {
        (
            0,
            ControlRow {
                family: "ACCESS CONTROL".to_string(),
                name: name.to_string(),
                title: title.to_string(),
                priority: "P1".to_string(),
                baseline_impact: "LOW,MODERATE,HIGH".to_string(),
                description: "The organization manages accounts.".to_string(),
                supplemental_guidance: String::new(),
                related: related.to_string(),
            },
        )
    }

    fn numbered(rows: Vec<(usize, ControlRow)>) -> Vec<(usize, ControlRow)> {
        rows.into_iter().enumerate().map(|(i, (_, r))| (i + 1, r)).collect()
    }

    #[test]
    fn test_control_id_parse() {
        assert_eq!(ControlId::parse("AC-2"), Some(ControlId::Base("AC-2".into())));
        assert_eq!(ControlId::parse("AC-2 (1)").unwrap().parent(), Some("AC-2"));
        assert_eq!(ControlId::parse("AC-2(12)").unwrap().parent(), Some("AC-2"));
        assert!(ControlId::parse("access control").is_none());
        assert!(ControlId::parse("AC-2 (x)").is_none());
    }

    #[test]
    fn test_enhancement_gets_subcontrol_relationship() {
        let rows = numbered(vec![
            row("AC-2", "Account Management", ""),
            row("AC-2 (1)", "Automated System Account Management", ""),
        ]);
        let prior = PriorBundle::empty();
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        let graph = parse_controls(&rows, "controls.tsv", &mut resolver).unwrap();

        assert_eq!(graph.controls.len(), 2);
        assert_eq!(graph.relationships.len(), 1);
        match &graph.relationships[0] {
            StixObject::Relationship(r) => {
                assert_eq!(r.relationship_type, SUBCONTROL_OF);
                assert_eq!(r.source_ref, graph.stix_id("AC-2 (1)").unwrap());
                assert_eq!(r.target_ref, graph.stix_id("AC-2").unwrap());
            }
            other => panic!("expected relationship, got {other:?}"),
        }
    }

    #[test]
    fn test_related_controls_skip_unknown_and_self() {
        let rows = numbered(vec![
            row("AC-2", "Account Management", "AC-3, AC-2, PM-99"),
            row("AC-3", "Access Enforcement", ""),
        ]);
        let prior = PriorBundle::empty();
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        let graph = parse_controls(&rows, "controls.tsv", &mut resolver).unwrap();

        assert_eq!(graph.relationships.len(), 1);
        if let StixObject::Relationship(r) = &graph.relationships[0] {
            assert_eq!(r.relationship_type, RELATED_TO);
        }
    }

    #[test]
    fn test_control_attributes() {
        let mut rows = numbered(vec![row("AC-2", "Account Management", "")]);
        rows[0].1.supplemental_guidance = "Examples include shared accounts.".to_string();
        let prior = PriorBundle::empty();
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        let graph = parse_controls(&rows, "controls.tsv", &mut resolver).unwrap();

        let StixObject::CourseOfAction(control) = &graph.controls[0] else {
            panic!("expected course-of-action");
        };
        assert_eq!(control.natural_id(), Some("AC-2"));
        assert_eq!(control.name, "Account Management");
        assert_eq!(control.x_mitre_priority.as_deref(), Some("P1"));
        assert_eq!(control.x_mitre_impact, vec!["LOW", "MODERATE", "HIGH"]);
        assert!(control.description.ends_with("Supplemental Guidance: Examples include shared accounts."));
        assert!(!control.created.is_empty());
        assert_eq!(control.created, control.modified);
    }

    #[test]
    fn test_missing_base_control_is_fatal() {
        let rows = numbered(vec![row("AC-2 (1)", "Automated System Account Management", "")]);
        let prior = PriorBundle::empty();
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        let err = parse_controls(&rows, "controls.tsv", &mut resolver).unwrap_err();
        assert!(matches!(err, ConverterError::MalformedRow { row: 1, .. }));
    }

    #[test]
    fn test_duplicate_and_malformed_names_are_fatal() {
        let prior = PriorBundle::empty();

        let dup = numbered(vec![row("AC-2", "A", ""), row("AC-2", "B", "")]);
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        assert!(matches!(
            parse_controls(&dup, "c.tsv", &mut resolver),
            Err(ConverterError::MalformedRow { row: 2, .. })
        ));

        let bad = numbered(vec![row("not a control", "A", "")]);
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        assert!(parse_controls(&bad, "c.tsv", &mut resolver).is_err());

        let untitled = numbered(vec![row("AC-1", "  ", "")]);
        let mut resolver = IdentityResolver::new(&prior, Utc::now());
        assert!(parse_controls(&untitled, "c.tsv", &mut resolver).is_err());
    }
}
