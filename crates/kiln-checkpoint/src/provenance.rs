//! Provenance records identifying a saved model.

use crate::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Format version written when none is set.
pub const DEFAULT_FORMAT_VERSION: &str = "1.0.0";

const KEY_MODEL_TYPE: &str = "model_type";
const KEY_FORMAT_VERSION: &str = "format_version";
const KEY_BASE_MODEL: &str = "base_model";
const KEY_TITLE: &str = "title";
const KEY_IMPLEMENTATION: &str = "implementation";
const KEY_DATE: &str = "date";

/// Descriptive metadata identifying a model.
///
/// Embedded as flat string pairs in the `__metadata__` section of flat tensor
/// files and written as `model_spec.json` inside internal snapshots.
///
/// # Examples
///
/// ```
/// use kiln_checkpoint::ProvenanceHeader;
///
/// let header = ProvenanceHeader::new("pixart_alpha")
///     .with_title("my finetune")
///     .with_date("2024-01-31");
/// let pairs = header.to_metadata();
/// assert_eq!(pairs["model_type"], "pixart_alpha");
/// assert_eq!(pairs["format_version"], "1.0.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceHeader {
    /// Model family / architecture.
    pub model_type: String,

    /// Version of the provenance record layout.
    #[serde(default = "default_format_version")]
    pub format_version: String,

    /// Identifier of the model this one was trained from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,

    /// Human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Implementation the weights are meant for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,

    /// Creation date, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Additional free-form pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

fn default_format_version() -> String {
    DEFAULT_FORMAT_VERSION.to_string()
}

impl ProvenanceHeader {
    /// Create a header for the given model family.
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
            format_version: default_format_version(),
            base_model: None,
            title: None,
            implementation: None,
            date: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the base model identifier.
    pub fn with_base_model(mut self, base_model: impl Into<String>) -> Self {
        self.base_model = Some(base_model.into());
        self
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the implementation.
    pub fn with_implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = Some(implementation.into());
        self
    }

    /// Set the date.
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// Add a free-form pair.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Returns a copy dated today (local time) unless a date is already set.
    pub fn stamped(&self) -> Self {
        let mut header = self.clone();
        if header.date.is_none() {
            header.date = Some(chrono::Local::now().format("%Y-%m-%d").to_string());
        }
        header
    }

    /// Flattens the header into string pairs.
    ///
    /// Extra pairs never override the named fields.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut pairs: HashMap<String, String> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.insert(KEY_MODEL_TYPE.to_string(), self.model_type.clone());
        pairs.insert(KEY_FORMAT_VERSION.to_string(), self.format_version.clone());
        let optional = [
            (KEY_BASE_MODEL, &self.base_model),
            (KEY_TITLE, &self.title),
            (KEY_IMPLEMENTATION, &self.implementation),
            (KEY_DATE, &self.date),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                pairs.insert(key.to_string(), value.clone());
            }
        }
        pairs
    }

    /// Rebuilds a header from flat string pairs.
    ///
    /// Fails with [`CheckpointError::MissingKey`] if `model_type` is absent.
    pub fn from_metadata<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut rest: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let model_type = rest
            .remove(KEY_MODEL_TYPE)
            .ok_or_else(|| CheckpointError::MissingKey(KEY_MODEL_TYPE.to_string()))?;
        Ok(Self {
            model_type,
            format_version: rest
                .remove(KEY_FORMAT_VERSION)
                .unwrap_or_else(default_format_version),
            base_model: rest.remove(KEY_BASE_MODEL),
            title: rest.remove(KEY_TITLE),
            implementation: rest.remove(KEY_IMPLEMENTATION),
            date: rest.remove(KEY_DATE),
            extra: rest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trip() {
        let header = ProvenanceHeader::new("pixart_alpha")
            .with_base_model("PixArt-alpha/PixArt-XL-2-1024-MS")
            .with_implementation("diffusers")
            .with_extra("resolution", "1024");
        let pairs = header.to_metadata();
        assert_eq!(pairs.len(), 5);

        let back = ProvenanceHeader::from_metadata(&pairs).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_extra_cannot_shadow_fields() {
        let header = ProvenanceHeader::new("test").with_extra("model_type", "other");
        assert_eq!(header.to_metadata()["model_type"], "test");
    }

    #[test]
    fn test_from_metadata_requires_model_type() {
        let pairs: HashMap<String, String> = HashMap::new();
        assert!(matches!(
            ProvenanceHeader::from_metadata(&pairs),
            Err(CheckpointError::MissingKey(key)) if key == "model_type"
        ));
    }

    #[test]
    fn test_json_defaults() {
        let header: ProvenanceHeader = serde_json::from_str(r#"{"model_type":"test"}"#).unwrap();
        assert_eq!(header.format_version, DEFAULT_FORMAT_VERSION);
        assert_eq!(
            serde_json::to_string(&header).unwrap(),
            r#"{"model_type":"test","format_version":"1.0.0"}"#
        );
    }

    #[test]
    fn test_stamped_keeps_existing_date() {
        let header = ProvenanceHeader::new("test").with_date("2023-12-01");
        assert_eq!(header.stamped().date.as_deref(), Some("2023-12-01"));

        let stamped = ProvenanceHeader::new("test").stamped();
        let date = stamped.date.unwrap();
        assert_eq!(date.len(), 10);
        assert!(chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_ok());
    }
}
