// ABOUTME: Custom serde deserializers for config types.
// ABOUTME: Validates manifest names, image refs and the non-empty manifest list.

use nonempty::NonEmpty;
use serde::Deserialize;

use super::ManifestConfig;
use crate::types::{ImageRef, ManifestName};

pub fn deserialize_manifest_name<'de, D>(deserializer: D) -> Result<ManifestName, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    ManifestName::new(&s).map_err(serde::de::Error::custom)
}

pub fn deserialize_manifest_names<'de, D>(deserializer: D) -> Result<Vec<ManifestName>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<String> = Vec::deserialize(deserializer)?;
    values
        .iter()
        .map(|s| ManifestName::new(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(serde::de::Error::custom)
}

pub fn deserialize_image_ref<'de, D>(deserializer: D) -> Result<ImageRef, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    ImageRef::parse(&s).map_err(serde::de::Error::custom)
}

pub fn deserialize_manifests<'de, D>(deserializer: D) -> Result<NonEmpty<ManifestConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<ManifestConfig> = Vec::deserialize(deserializer)?;
    NonEmpty::from_vec(values)
        .ok_or_else(|| serde::de::Error::custom("at least one manifest is required"))
}
