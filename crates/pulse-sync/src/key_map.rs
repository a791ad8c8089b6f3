use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Built-in platform key → canonical KPI key table. Mirrors `rules/metric_keys.yaml`.
pub const BUILTIN_KEY_MAP: [(&str, &str); 6] = [
    ("spend", "cost"),
    ("average_cpc", "cpc"),
    ("totalUsers", "users"),
    ("screenPageViews", "page_views"),
    ("bounceRate", "bounce_rate"),
    ("averageSessionDuration", "avg_session_duration"),
];

#[derive(Debug, Clone, Deserialize)]
struct KeyMapFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    mappings: BTreeMap<String, String>,
}

/// Extensible mapping applied before the KPI allow-list check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricKeyMap {
    mappings: BTreeMap<String, String>,
}

impl Default for MetricKeyMap {
    fn default() -> Self {
        Self {
            mappings: BUILTIN_KEY_MAP
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }
}

impl MetricKeyMap {
    /// Built-in table with the file's entries layered on top.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: KeyMapFile = serde_yaml::from_str(text).context("parsing metric key map")?;
        let mut map = Self::default();
        for (from, to) in file.mappings {
            map.insert(from, to);
        }
        Ok(map)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn insert(&mut self, platform_key: impl Into<String>, canonical_key: impl Into<String>) {
        self.mappings.insert(platform_key.into(), canonical_key.into());
    }

    /// Identity when the key has no entry.
    pub fn canonical<'a>(&'a self, platform_key: &'a str) -> &'a str {
        self.mappings
            .get(platform_key)
            .map(String::as_str)
            .unwrap_or(platform_key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.mappings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_keys_pass_through() {
        let map = MetricKeyMap::default();
        assert_eq!(map.canonical("spend"), "cost");
        assert_eq!(map.canonical("bounceRate"), "bounce_rate");
        assert_eq!(map.canonical("impressions"), "impressions");
    }

    #[test]
    fn yaml_file_extends_and_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metric_keys.yaml");
        std::fs::write(
            &path,
            "version: 1\nmappings:\n  spend: ad_spend\n  newUsers: new_users\n",
        )
        .unwrap();

        let map = MetricKeyMap::from_yaml_file(&path).unwrap();
        assert_eq!(map.canonical("spend"), "ad_spend");
        assert_eq!(map.canonical("newUsers"), "new_users");
        assert_eq!(map.canonical("totalUsers"), "users");
        assert_eq!(map.entries().count(), BUILTIN_KEY_MAP.len() + 1);
    }

    #[test]
    fn shipped_rules_file_matches_builtin_table() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/metric_keys.yaml");
        let map = MetricKeyMap::from_yaml_file(&path).unwrap();
        assert_eq!(map, MetricKeyMap::default());
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        assert!(MetricKeyMap::from_yaml_str("mappings: [1, 2]").is_err());
    }
}
