//! Identifier reuse between runs.
//!
//! A previously written bundle is indexed by natural key so that regenerating
//! the output keeps every STIX id (and, when content is unchanged, every
//! timestamp) exactly as it was.

use crate::constants::relationship_key;
use crate::error::{ConverterError, Result};
use crate::types::{strip_timestamps, StixObject};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// STIX timestamp layout (millisecond precision, UTC)
pub fn stix_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Lookups built from an existing output bundle
#[derive(Debug, Default, Clone)]
pub struct PriorBundle {
    pub bundle_id: Option<String>,
    /// natural control id (e.g. `AC-2 (1)`) -> STIX id
    pub control_ids: HashMap<String, String>,
    /// `source---target` -> STIX id
    pub relationship_ids: HashMap<String, String>,
    objects: HashMap<String, Value>,
}

impl PriorBundle {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a prior bundle; a missing file means there is nothing to reuse
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No prior output at {}", path.display());
            return Ok(Self::empty());
        }
        let content = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content).map_err(|e| ConverterError::PriorOutput {
            path: path.display().to_string(),
            message: format!("invalid JSON: {e}"),
        })?;
        let prior = Self::from_value(&value, &path.display().to_string())?;
        info!(
            "Loaded {} control ids and {} relationship ids from {}",
            prior.control_ids.len(),
            prior.relationship_ids.len(),
            path.display()
        );
        Ok(prior)
    }

    pub fn from_value(value: &Value, label: &str) -> Result<Self> {
        let structure = |message: String| ConverterError::PriorOutput {
            path: label.to_string(),
            message,
        };

        let objects = value
            .get("objects")
            .and_then(Value::as_array)
            .ok_or_else(|| structure("missing 'objects' array".to_string()))?;

        let mut prior = Self {
            bundle_id: value.get("id").and_then(Value::as_str).map(str::to_string),
            ..Self::default()
        };

        for (i, sdo) in objects.iter().enumerate() {
            let id = sdo
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| structure(format!("object {i} has no 'id'")))?;
            let sdo_type = sdo
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| structure(format!("object {id} has no 'type'")))?;

            if sdo_type == "relationship" {
                let source = sdo.get("source_ref").and_then(Value::as_str);
                let target = sdo.get("target_ref").and_then(Value::as_str);
                match (source, target) {
                    (Some(s), Some(t)) => {
                        prior.relationship_ids.insert(relationship_key(s, t), id.to_string());
                    }
                    _ => return Err(structure(format!("relationship {id} lacks source_ref/target_ref"))),
                }
            } else {
                let external_id = sdo
                    .get("external_references")
                    .and_then(|refs| refs.get(0))
                    .and_then(|r| r.get("external_id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| structure(format!("object {id} has no external_references[0].external_id")))?;
                prior.control_ids.insert(external_id.to_string(), id.to_string());
            }
            prior.objects.insert(id.to_string(), sdo.clone());
        }
        Ok(prior)
    }

    pub fn control_id(&self, natural_id: &str) -> Option<&str> {
        self.control_ids.get(natural_id).map(String::as_str)
    }

    pub fn relationship_id(&self, source_ref: &str, target_ref: &str) -> Option<&str> {
        self.relationship_ids
            .get(&relationship_key(source_ref, target_ref))
            .map(String::as_str)
    }

    fn object(&self, id: &str) -> Option<&Value> {
        self.objects.get(id)
    }
}

/// Hands out STIX ids and timestamps, preferring whatever a prior run wrote
pub struct IdentityResolver<'a> {
    prior: &'a PriorBundle,
    run_timestamp: String,
    pub reused: usize,
    pub generated: usize,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(prior: &'a PriorBundle, run_time: DateTime<Utc>) -> Self {
        Self {
            prior,
            run_timestamp: stix_timestamp(run_time),
            reused: 0,
            generated: 0,
        }
    }

    pub fn control_id(&mut self, natural_id: &str) -> String {
        match self.prior.control_id(natural_id) {
            Some(id) => self.reuse(id),
            None => self.fresh("course-of-action"),
        }
    }

    pub fn relationship_id(&mut self, source_ref: &str, target_ref: &str) -> String {
        match self.prior.relationship_id(source_ref, target_ref) {
            Some(id) => self.reuse(id),
            None => self.fresh("relationship"),
        }
    }

    pub fn bundle_id(&self) -> String {
        self.prior
            .bundle_id
            .clone()
            .unwrap_or_else(|| format!("bundle--{}", Uuid::new_v4()))
    }

    /// Fill `created`/`modified`: `created` survives from the prior object,
    /// `modified` survives only if nothing else about the object changed.
    pub fn stamp(&self, object: &mut StixObject) -> Result<()> {
        let (created, modified) = match self.prior.object(object.id()) {
            Some(prior) => {
                let created = prior
                    .get("created")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| self.run_timestamp.clone());
                let mut prior_content = prior.clone();
                strip_timestamps(&mut prior_content);
                let modified = if prior_content == object.content_value()? {
                    prior
                        .get("modified")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| created.clone())
                } else {
                    debug!("Object {} changed since prior run", object.id());
                    self.run_timestamp.clone()
                };
                (created, modified)
            }
            None => (self.run_timestamp.clone(), self.run_timestamp.clone()),
        };
        object.set_timestamps(created, modified);
        Ok(())
    }

    fn reuse(&mut self, id: &str) -> String {
        self.reused += 1;
        id.to_string()
    }

    fn fresh(&mut self, prefix: &str) -> String {
        self.generated += 1;
        format!("{prefix}--{}", Uuid::new_v4())
    }
}
