use crate::constants::ATTACK_SOURCE_NAME;
use crate::error::{ConverterError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Where the ATT&CK reference bundle comes from
#[async_trait]
pub trait AttackSource: Send + Sync {
    /// Human-readable location, for logs and errors
    fn location(&self) -> String;

    /// Fetch the raw bundle bytes
    async fn fetch(&self) -> Result<Vec<u8>>;
}

pub struct HttpAttackSource {
    client: reqwest::Client,
    url: String,
}

impl HttpAttackSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AttackSource for HttpAttackSource {
    fn location(&self) -> String {
        self.url.clone()
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<u8>> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ConverterError::ReferenceData(format!(
                "GET {} returned status {}",
                self.url,
                status.as_u16()
            )));
        }
        let bytes = resp.bytes().await?.to_vec();
        debug!("Fetched {} bytes", bytes.len());
        Ok(bytes)
    }
}

/// A bundle already on disk (offline runs, pinned ATT&CK releases)
pub struct FileAttackSource {
    path: PathBuf,
}

impl FileAttackSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AttackSource for FileAttackSource {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path).await.map_err(|e| {
            ConverterError::ReferenceData(format!("Failed to read {}: {}", self.path.display(), e))
        })
    }
}

/// Pick the source for a `--attack-data` value: URLs go over HTTP, anything else is a path
pub fn source_for(location: &str, timeout: Duration) -> Result<Box<dyn AttackSource>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpAttackSource::new(location, timeout)?))
    } else {
        Ok(Box::new(FileAttackSource::new(location)))
    }
}

#[derive(Debug, Deserialize)]
struct RawBundle {
    objects: Vec<RawObject>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(rename = "type")]
    object_type: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    external_references: Vec<RawExternalReference>,
    #[serde(default)]
    revoked: bool,
    #[serde(default)]
    x_mitre_deprecated: bool,
}

#[derive(Debug, Deserialize)]
struct RawExternalReference {
    #[serde(default)]
    source_name: String,
    #[serde(default)]
    external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Technique {
    pub stix_id: String,
    pub external_id: String,
    pub name: String,
    pub revoked: bool,
    pub deprecated: bool,
}

impl Technique {
    fn is_current(&self) -> bool {
        !self.revoked && !self.deprecated
    }
}

/// ATT&CK techniques keyed by their `mitre-attack` external id (`T1078`, `T1548.002`)
#[derive(Debug, Default, Clone)]
pub struct TechniqueIndex {
    by_external_id: HashMap<String, Technique>,
}

impl TechniqueIndex {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bundle: RawBundle = serde_json::from_slice(bytes)
            .map_err(|e| ConverterError::ReferenceData(format!("not a STIX bundle: {e}")))?;

        let mut index = Self::default();
        for object in bundle.objects.into_iter().filter(|o| o.object_type == "attack-pattern") {
            let external_id = object
                .external_references
                .iter()
                .find(|r| r.source_name == ATTACK_SOURCE_NAME)
                .and_then(|r| r.external_id.clone());
            let Some(external_id) = external_id else {
                debug!("attack-pattern {} has no ATT&CK id, skipping", object.id);
                continue;
            };
            index.insert(Technique {
                stix_id: object.id,
                external_id,
                name: object.name,
                revoked: object.revoked,
                deprecated: object.x_mitre_deprecated,
            });
        }
        Ok(index)
    }

    /// A current technique wins over a revoked or deprecated one with the same id
    fn insert(&mut self, technique: Technique) {
        let key = technique.external_id.trim().to_uppercase();
        match self.by_external_id.get(&key) {
            Some(existing) if existing.is_current() || !technique.is_current() => {
                debug!(
                    "Keeping {} for {} over {}",
                    existing.stix_id, key, technique.stix_id
                );
            }
            _ => {
                self.by_external_id.insert(key, technique);
            }
        }
    }

    pub fn resolve(&self, external_id: &str) -> Option<&Technique> {
        self.by_external_id.get(&external_id.trim().to_uppercase())
    }

    /// STIX ids of the indexed (winning) techniques
    pub fn stix_ids(&self) -> impl Iterator<Item = &str> {
        self.by_external_id.values().map(|t| t.stix_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_external_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_external_id.is_empty()
    }
}

/// Fetch and index the reference dataset; an empty index is an error
#[instrument(skip(source), fields(location = %source.location()))]
pub async fn load_techniques(source: &dyn AttackSource) -> Result<TechniqueIndex> {
    info!("Fetching ATT&CK data from {}", source.location());
    let bytes = source.fetch().await?;
    let index = TechniqueIndex::from_slice(&bytes)?;
    if index.is_empty() {
        warn!("No attack-patterns found at {}", source.location());
        return Err(ConverterError::ReferenceData(format!(
            "{} contains no ATT&CK techniques",
            source.location()
        )));
    }
    info!("Indexed {} ATT&CK techniques", index.len());
    Ok(index)
}
