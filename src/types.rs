use crate::constants::{CONTROL_SOURCE_NAME, STIX_SPEC_VERSION};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A STIX external reference; controls carry exactly one naming their catalog id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ExternalReference {
    pub fn control(external_id: &str) -> Self {
        Self {
            source_name: CONTROL_SOURCE_NAME.to_string(),
            external_id: Some(external_id.to_string()),
            url: None,
        }
    }
}

/// A security control, serialized as a STIX `course-of-action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseOfAction {
    pub id: String,
    pub created: String,
    pub modified: String,
    pub name: String,
    pub description: String,
    pub external_references: Vec<ExternalReference>,
    pub x_mitre_family: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_mitre_priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub x_mitre_impact: Vec<String>,
}

impl CourseOfAction {
    /// The catalog identifier (e.g. `AC-2 (1)`) this control was built from
    pub fn natural_id(&self) -> Option<&str> {
        self.external_references
            .first()
            .and_then(|r| r.external_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub created: String,
    pub modified: String,
    pub relationship_type: String,
    pub source_ref: String,
    pub target_ref: String,
}

/// Objects the converter emits into a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StixObject {
    CourseOfAction(CourseOfAction),
    Relationship(Relationship),
}

impl StixObject {
    pub fn id(&self) -> &str {
        match self {
            StixObject::CourseOfAction(c) => &c.id,
            StixObject::Relationship(r) => &r.id,
        }
    }

    pub fn set_timestamps(&mut self, created: String, modified: String) {
        match self {
            StixObject::CourseOfAction(c) => {
                c.created = created;
                c.modified = modified;
            }
            StixObject::Relationship(r) => {
                r.created = created;
                r.modified = modified;
            }
        }
    }

    /// JSON form with `created`/`modified` stripped, used to detect content changes
    pub fn content_value(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        strip_timestamps(&mut value);
        Ok(value)
    }
}

pub fn strip_timestamps(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("created");
        obj.remove("modified");
    }
}

/// A STIX 2.0 bundle: the unit written to each output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "bundle")]
pub struct Bundle {
    pub id: String,
    pub spec_version: String,
    pub objects: Vec<StixObject>,
}

impl Bundle {
    pub fn new(id: String, objects: Vec<StixObject>) -> Self {
        Self {
            id,
            spec_version: STIX_SPEC_VERSION.to_string(),
            objects,
        }
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.objects.iter().filter_map(|o| match o {
            StixObject::Relationship(r) => Some(r),
            _ => None,
        })
    }

    pub fn controls(&self) -> impl Iterator<Item = &CourseOfAction> {
        self.objects.iter().filter_map(|o| match o {
            StixObject::CourseOfAction(c) => Some(c),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_control() -> StixObject {
        StixObject::CourseOfAction(CourseOfAction {
            id: "course-of-action--1".to_string(),
            created: "2020-01-01T00:00:00.000Z".to_string(),
            modified: "2020-01-01T00:00:00.000Z".to_string(),
            name: "Account Management".to_string(),
            description: "Manage accounts.".to_string(),
            external_references: vec![ExternalReference::control("AC-2")],
            x_mitre_family: "ACCESS CONTROL".to_string(),
            x_mitre_priority: None,
            x_mitre_impact: vec![],
        })
    }

    #[test]
    fn test_course_of_action_serializes_with_type_tag() {
        let value = serde_json::to_value(sample_control()).unwrap();
        assert_eq!(value["type"], "course-of-action");
        assert_eq!(value["external_references"][0]["source_name"], CONTROL_SOURCE_NAME);
        assert_eq!(value["external_references"][0]["external_id"], "AC-2");
        // Empty optional fields are omitted
        assert!(value.get("x_mitre_priority").is_none());
        assert!(value.get("x_mitre_impact").is_none());
    }

    #[test]
    fn test_content_value_ignores_timestamps() {
        let a = sample_control();
        let mut b = a.clone();
        b.set_timestamps("2021-05-05T00:00:00.000Z".into(), "2022-05-05T00:00:00.000Z".into());
        assert_eq!(a.content_value().unwrap(), b.content_value().unwrap());

        if let StixObject::CourseOfAction(c) = &mut b {
            c.name = "Renamed".to_string();
        }
        assert_ne!(a.content_value().unwrap(), b.content_value().unwrap());
    }

    #[test]
    fn test_bundle_tag_and_spec_version() {
        let bundle = Bundle::new("bundle--x".to_string(), vec![sample_control()]);
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["type"], "bundle");
        assert_eq!(value["spec_version"], "2.0");
        assert_eq!(bundle.controls().count(), 1);
        assert_eq!(bundle.relationships().count(), 0);

        let back: Bundle = serde_json::from_value(value).unwrap();
        assert_eq!(back, bundle);
    }
}
