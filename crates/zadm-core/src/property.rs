// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Property resolution.
//!
//! Native properties come straight from the engine with its source
//! classification. Free-form names go through a fixed precedence chain:
//! userquota-class names, then `written@` names, then the user property
//! map. Every successful read yields a [`PropertyRecord`] with its
//! provenance set.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error};
use zadm_engine::{
    is_userquota_property, is_written_property, PropSource, ZfsProp, RECEIVED_SOURCE_MARKER,
};

/// Size of the value buffer of a property record, terminator included.
pub const VALUE_BUFFER_LEN: usize = 1024;
/// Size of the source buffer of a property record, terminator included.
pub const SOURCE_BUFFER_LEN: usize = 256;

const UNSET_VALUE: &str = "-";
const CREATION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Where an effective property value comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Provenance {
    Local,
    Inherited { from: String },
    Received,
    Default,
    None,
    Temporary,
}

impl Provenance {
    pub fn label(&self) -> String {
        match self {
            Provenance::Local => "local".to_string(),
            Provenance::Inherited { from } => format!("inherited:{}", from),
            Provenance::Received => "received".to_string(),
            Provenance::Default => "default".to_string(),
            Provenance::None => "none".to_string(),
            Provenance::Temporary => "temporary".to_string(),
        }
    }

    /// Parse a label produced by [`Provenance::label`]. Unknown or empty
    /// labels read as `none`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "local" => Provenance::Local,
            "received" => Provenance::Received,
            "default" => Provenance::Default,
            "temporary" => Provenance::Temporary,
            other => match other.strip_prefix("inherited:") {
                Some(from) if !from.is_empty() => Provenance::Inherited {
                    from: from.to_string(),
                },
                _ => Provenance::None,
            },
        }
    }

    /// Whether the value is the engine default rather than something set.
    pub fn is_unset(&self) -> bool {
        matches!(self, Provenance::None | Provenance::Default)
    }
}

impl From<PropSource> for Provenance {
    fn from(source: PropSource) -> Self {
        match source {
            PropSource::None => Provenance::None,
            PropSource::Default => Provenance::Default,
            PropSource::Local => Provenance::Local,
            PropSource::Temporary => Provenance::Temporary,
            PropSource::Received => Provenance::Received,
            PropSource::Inherited(from) => Provenance::Inherited { from },
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Longest prefix of `text` that fits a buffer of `buffer_len` bytes
/// including its terminator, cut on a character boundary.
pub fn truncate_to_buffer(text: &str, buffer_len: usize) -> &str {
    let max = buffer_len.saturating_sub(1);
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// One resolved property value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyRecord {
    /// Effective value, at most `VALUE_BUFFER_LEN - 1` bytes
    pub value: String,
    /// Provenance label, at most `SOURCE_BUFFER_LEN - 1` bytes
    pub source: String,
    pub provenance: Provenance,
    /// The native property read; `None` for user and derived names
    pub property: Option<ZfsProp>,
}

impl PropertyRecord {
    pub fn new(value: &str, provenance: Provenance, property: Option<ZfsProp>) -> Self {
        let label = provenance.label();
        PropertyRecord {
            value: truncate_to_buffer(value, VALUE_BUFFER_LEN).to_string(),
            source: truncate_to_buffer(&label, SOURCE_BUFFER_LEN).to_string(),
            provenance,
            property,
        }
    }

    fn unset() -> Self {
        PropertyRecord::new(UNSET_VALUE, Provenance::None, None)
    }
}

/// Read a native property. Fails when the property does not apply to the
/// dataset's type or the engine cannot produce it.
pub fn get_property(dataset: &Dataset<'_>, prop: ZfsProp) -> Result<PropertyRecord> {
    let handle = dataset.raw();
    let native = dataset
        .registry()
        .call("prop_get", |e| e.prop_get(handle, prop, true))?;
    Ok(PropertyRecord::new(
        &native.value,
        native.source.into(),
        Some(prop),
    ))
}

/// Resolve a user-defined or derived property by name.
pub fn get_user_property(dataset: &Dataset<'_>, name: &str) -> Result<PropertyRecord> {
    let handle = dataset.raw();
    let registry = dataset.registry();

    if is_userquota_property(name) {
        return Ok(computed(
            name,
            registry.call("userquota_get", |e| e.userquota_get(handle, name, true)),
        ));
    }
    if is_written_property(name) {
        return Ok(computed(
            name,
            registry.call("written_get", |e| e.written_get(handle, name, true)),
        ));
    }

    let props = registry.call("user_props", |e| e.user_props(handle))?;
    let Some(entry) = props.get(name) else {
        return Ok(PropertyRecord::unset());
    };
    let (Some(value), Some(source)) = (entry.value.as_deref(), entry.source.as_deref()) else {
        error!(operation = "get_user_property", dataset = %dataset.name(), property = %name, "User property entry lacks value or source");
        return Err(Error::Inconsistent(format!(
            "user property '{}' of '{}' has no value or source",
            name,
            dataset.name()
        )));
    };
    let provenance = if source == dataset.name() {
        Provenance::Local
    } else if source == RECEIVED_SOURCE_MARKER {
        Provenance::Received
    } else {
        Provenance::Inherited {
            from: source.to_string(),
        }
    };
    Ok(PropertyRecord::new(value, provenance, None))
}

fn computed(name: &str, result: Result<String>) -> PropertyRecord {
    match result {
        Ok(value) => PropertyRecord::new(&value, Provenance::Local, None),
        Err(err) => {
            debug!(operation = "get_user_property", property = %name, error = %err, "Derived property not computable");
            PropertyRecord::unset()
        }
    }
}

/// Every applicable native property of one dataset, as last loaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatasetProperties {
    records: BTreeMap<ZfsProp, PropertyRecord>,
}

impl DatasetProperties {
    /// Read every native property that applies to the dataset's type.
    /// Properties the engine refuses are left out.
    pub fn load(dataset: &Dataset<'_>) -> Result<Self> {
        let kind = dataset.dataset_type();
        let mut records = BTreeMap::new();
        for prop in ZfsProp::ALL.iter().copied().filter(|p| p.applies_to(kind)) {
            match get_property(dataset, prop) {
                Ok(record) => {
                    records.insert(prop, record);
                }
                Err(err) if err.code().is_some() => {
                    debug!(operation = "reload_properties", dataset = %dataset.name(), property = %prop, error = %err, "Skipping property");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(DatasetProperties { records })
    }

    pub fn get(&self, prop: ZfsProp) -> Option<&PropertyRecord> {
        self.records.get(&prop)
    }

    pub fn insert(&mut self, record: PropertyRecord) {
        if let Some(prop) = record.property {
            self.records.insert(prop, record);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ZfsProp, &PropertyRecord)> {
        self.records.iter().map(|(prop, record)| (*prop, record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct PropertyEntry {
    value: String,
    #[serde(default)]
    source: String,
}

fn serialized_value(prop: ZfsProp, value: &str) -> Option<String> {
    if value == "none" || value == u64::MAX.to_string() {
        return None;
    }
    if prop == ZfsProp::Creation {
        if let Some(date) = value
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        {
            return Some(date.format(CREATION_FORMAT).to_string());
        }
    }
    Some(value.to_string())
}

impl Serialize for DatasetProperties {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let entries: BTreeMap<&str, PropertyEntry> = self
            .records
            .iter()
            .filter_map(|(prop, record)| {
                serialized_value(*prop, &record.value).map(|value| {
                    (
                        prop.name(),
                        PropertyEntry {
                            value,
                            source: record.source.clone(),
                        },
                    )
                })
            })
            .collect();
        entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DatasetProperties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entries = BTreeMap::<ZfsProp, PropertyEntry>::deserialize(deserializer)?;
        let records = entries
            .into_iter()
            .map(|(prop, entry)| {
                let provenance = Provenance::from_label(&entry.source);
                (prop, PropertyRecord::new(&entry.value, provenance, Some(prop)))
            })
            .collect();
        Ok(DatasetProperties { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for provenance in [
            Provenance::Local,
            Provenance::Inherited {
                from: "tank/home".into(),
            },
            Provenance::Received,
            Provenance::Default,
            Provenance::None,
            Provenance::Temporary,
        ] {
            assert_eq!(Provenance::from_label(&provenance.label()), provenance);
        }
        assert_eq!(Provenance::from_label(""), Provenance::None);
        assert_eq!(Provenance::from_label("inherited:"), Provenance::None);
    }

    #[test]
    fn truncation_respects_buffers_and_char_boundaries() {
        let long = "x".repeat(2000);
        let record = PropertyRecord::new(&long, Provenance::Local, None);
        assert_eq!(record.value.len(), VALUE_BUFFER_LEN - 1);

        let accented = "é".repeat(600);
        let record = PropertyRecord::new(&accented, Provenance::Local, None);
        assert!(record.value.len() <= VALUE_BUFFER_LEN - 1);
        assert_eq!(record.value.len() % 2, 0);

        let from = "a".repeat(400);
        let record = PropertyRecord::new("v", Provenance::Inherited { from }, None);
        assert_eq!(record.source.len(), SOURCE_BUFFER_LEN - 1);
        assert!(record.source.starts_with("inherited:"));
    }

    #[test]
    fn json_skips_sentinels_and_formats_creation() {
        let mut props = DatasetProperties::default();
        props.insert(PropertyRecord::new("0", Provenance::None, Some(ZfsProp::Creation)));
        props.insert(PropertyRecord::new("none", Provenance::Default, Some(ZfsProp::Quota)));
        props.insert(PropertyRecord::new(
            &u64::MAX.to_string(),
            Provenance::None,
            Some(ZfsProp::Available),
        ));
        props.insert(PropertyRecord::new("lz4", Provenance::Local, Some(ZfsProp::Compression)));

        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["creation"]["value"], "1970-01-01T00:00:00+0000");
        assert_eq!(json["compression"]["source"], "local");
        assert!(json.get("quota").is_none());
        assert!(json.get("available").is_none());
    }

    #[test]
    fn json_source_is_optional() {
        let props: DatasetProperties =
            serde_json::from_str(r#"{"compression":{"value":"lz4"},"atime":{"value":"on","source":"default"}}"#)
                .unwrap();
        let compression = props.get(ZfsProp::Compression).unwrap();
        assert_eq!(compression.value, "lz4");
        assert_eq!(compression.provenance, Provenance::None);
        assert_eq!(props.get(ZfsProp::Atime).unwrap().provenance, Provenance::Default);
    }
}
