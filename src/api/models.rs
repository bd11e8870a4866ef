//! Typed registry responses
//!
//! Field names follow the registry's camelCase JSON. Fields this crate does
//! not model are kept in `extra`, so a value written back out (for example as
//! a metadata sidecar) loses nothing the registry sent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Download and rating counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    pub download_count: u64,
    pub rating_count: u64,
    pub rating: f64,
    pub thumbs_up_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Stats {
    /// Rating pulled toward 3.0 when few downloaders rated (1.0 when unrated)
    ///
    /// Full confidence is reached once a fifth of downloaders have rated.
    pub fn weighted_rating(&self) -> f64 {
        if self.rating_count == 0 {
            return 1.0;
        }

        let ratio = self.rating_count as f64 / self.download_count.max(1) as f64;
        let confidence = (ratio * 5.0).min(1.0);
        3.0 + (self.rating - 3.0) * confidence
    }

    /// Thumbs-up per download mapped onto 1.0..=5.0, saturating at 20%
    pub fn weighted_thumbsup(&self) -> f64 {
        if self.download_count == 0 {
            return 1.0;
        }

        let ratio = self.thumbs_up_count as f64 / self.download_count as f64;
        1.0 + (ratio * 5.0).min(1.0) * 4.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size_kb: f64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generation parameters attached to a preview image
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ImageMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Image {
    /// File extension taken from the URL path, without the dot
    pub fn extension(&self) -> Option<&str> {
        let path = self.url.split(['?', '#']).next()?;
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        (!ext.is_empty()).then_some(ext)
    }
}

/// One version of a registry model, the unit a local file resolves to
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Parent model id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trained_words: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ModelFile>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    /// Filled in by enrichment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_model: Option<ParentModel>,
    /// Filled in by enrichment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sibling_versions: Vec<SiblingVersion>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelVersion {
    pub fn is_enriched(&self) -> bool {
        !self.sibling_versions.is_empty()
    }

    pub fn primary_file(&self) -> Option<&ModelFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Creator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Summary of a parent model attached to each enriched version
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentModel {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Creator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
}

impl From<&Model> for ParentModel {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id,
            name: model.name.clone(),
            kind: model.kind.clone(),
            nsfw: model.nsfw,
            description: model.description.clone(),
            tags: model.tags.clone(),
            creator: model.creator.clone(),
            stats: model.stats.clone(),
        }
    }
}

/// Another version of the same parent model
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SiblingVersion {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    /// Whether this sibling is the version the local file resolved to
    #[serde(default)]
    pub is_current: bool,
}

impl SiblingVersion {
    pub fn from_version(version: &ModelVersion, current_version_id: u64) -> Self {
        Self {
            id: version.id,
            name: version.name.clone(),
            base_model: version.base_model.clone(),
            created_at: version.created_at,
            download_url: version.download_url.clone(),
            stats: version.stats.clone(),
            is_current: version.id == current_version_id,
        }
    }
}

/// A parent model together with all of its versions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentModelWithVersions {
    pub parent_model: ParentModel,
    pub sibling_versions: Vec<SiblingVersion>,
}

impl ParentModelWithVersions {
    pub fn from_model(model: &Model, current_version_id: u64) -> Self {
        Self {
            parent_model: ParentModel::from(model),
            sibling_versions: model
                .model_versions
                .iter()
                .map(|v| SiblingVersion::from_version(v, current_version_id))
                .collect(),
        }
    }

    /// Sibling list with `is_current` recomputed for `version_id`
    pub fn siblings_for(&self, version_id: u64) -> Vec<SiblingVersion> {
        self.sibling_versions
            .iter()
            .map(|s| SiblingVersion {
                is_current: s.id == version_id,
                ..s.clone()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    #[serde(default)]
    pub items: Vec<Model>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageSearchResult {
    #[serde(default)]
    pub items: Vec<Image>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Filters for `GET models`
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub tags: Vec<String>,
    pub username: Option<String>,
    pub types: Vec<String>,
    pub sort: Option<String>,
    pub period: Option<String>,
    pub nsfw: Option<bool>,
    pub limit: u32,
    pub page: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: None,
            tags: Vec::new(),
            username: None,
            types: Vec::new(),
            sort: None,
            period: None,
            nsfw: None,
            limit: 100,
            page: 1,
        }
    }
}

impl SearchQuery {
    pub fn to_params(&self) -> Value {
        let mut params = Map::new();
        params.insert("limit".into(), self.limit.into());
        params.insert("page".into(), self.page.into());

        if let Some(query) = &self.query {
            params.insert("query".into(), query.clone().into());
        }
        if !self.tags.is_empty() {
            params.insert("tag".into(), self.tags.join(",").into());
        }
        if let Some(username) = &self.username {
            params.insert("username".into(), username.clone().into());
        }
        if !self.types.is_empty() {
            params.insert("types".into(), self.types.join(",").into());
        }
        if let Some(sort) = &self.sort {
            params.insert("sort".into(), sort.clone().into());
        }
        if let Some(period) = &self.period {
            params.insert("period".into(), period.clone().into());
        }
        if let Some(nsfw) = self.nsfw {
            params.insert("nsfw".into(), nsfw.to_string().into());
        }

        Value::Object(params)
    }
}
