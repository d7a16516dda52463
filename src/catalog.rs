//! Collector catalog.
//!
//! `catalog.json` names the upstream endpoints of every network and the
//! collectors of every platform:
//!
//! ```json
//! {
//!   "endpoints": {"mainnet": {"_blocks": "<id>", "daostack": "<id>"}},
//!   "platforms": {"daostack": {"collectors": [
//!     {"name": "daos", "fields": ["id", "name"]}
//!   ]}}
//! }
//! ```
//!
//! A platform runs on every network whose endpoints mention it. Keys starting
//! with `_` are not platforms.

use crate::graphql::{GraphQlBlocks, GraphQlClient, GraphQlSource};
use crate::postprocess::{Pipeline, StageSpec};
use crate::runner::Runner;
use crate::source::{DatasetQuery, RecordSource};
use crate::collector::{NetworkCollector, SnapshotCollector};
use crate::{Result, SyncError};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const BLOCKS_ENDPOINT: &str = "_blocks";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Catalog {
    /// network -> (platform or `_blocks`) -> subgraph id or URL
    pub endpoints: BTreeMap<String, BTreeMap<String, String>>,
    pub platforms: BTreeMap<String, PlatformSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlatformSpec {
    pub collectors: Vec<CollectorSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CollectorSpec {
    pub name: String,
    /// Upstream entity; defaults to the collector name
    #[serde(default)]
    pub entity: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub postprocess: Vec<StageSpec>,
    /// Unscoped collector reading a fixed endpoint
    #[serde(default)]
    pub snapshot: Option<SnapshotSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SnapshotSpec {
    pub endpoint: String,
    #[serde(default = "default_label")]
    pub label: String,
}

fn default_label() -> String {
    "global".to_string()
}

impl CollectorSpec {
    pub fn query(&self) -> DatasetQuery {
        DatasetQuery {
            entity: self.entity.clone().unwrap_or_else(|| self.name.clone()),
            fields: self.fields.clone(),
            filters: self.filters.clone(),
        }
    }

    fn pipeline(&self, runner_dir: &Path) -> Pipeline {
        let mut pipeline = Pipeline::new();
        for stage in &self.postprocess {
            stage.append_to(&mut pipeline, runner_dir);
        }
        pipeline
    }
}

/// Upstream access shared by every runner built from a catalog
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub api_key: Option<String>,
    pub page_size: usize,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| SyncError::Config(format!("cannot read catalog {}: {}", path.display(), e)))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let catalog: Catalog = serde_json::from_slice(bytes)?;
        catalog.check()?;
        Ok(catalog)
    }

    fn check(&self) -> Result<()> {
        for (platform, spec) in &self.platforms {
            if platform.starts_with('_') {
                return Err(SyncError::Config(format!("platform name {} is reserved", platform)));
            }
            let mut seen = BTreeSet::new();
            for collector in &spec.collectors {
                if !seen.insert(collector.name.as_str()) {
                    return Err(SyncError::Config(format!(
                        "platform {} declares collector {} twice",
                        platform, collector.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn platform_names(&self) -> Vec<String> {
        self.platforms.keys().cloned().collect()
    }

    /// Every network that has at least one platform endpoint
    pub fn networks(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|(network, _)| !network.starts_with('_'))
            .map(|(network, _)| network.clone())
            .collect()
    }

    /// Networks a platform runs on, with the subgraph id for each
    pub fn platform_networks(&self, platform: &str) -> Vec<(String, String)> {
        self.endpoints
            .iter()
            .filter(|(network, _)| !network.starts_with('_'))
            .filter_map(|(network, ids)| ids.get(platform).map(|id| (network.clone(), id.clone())))
            .collect()
    }

    /// Block lookups for every network that declares a blocks endpoint
    pub fn block_source(&self, settings: &SourceSettings) -> Result<GraphQlBlocks> {
        let mut blocks = GraphQlBlocks::new();
        for network in self.networks() {
            if let Some(id) = self.endpoints.get(&network).and_then(|e| e.get(BLOCKS_ENDPOINT)) {
                blocks.insert(&network, GraphQlClient::new(id, settings.api_key.as_deref())?);
            }
        }
        Ok(blocks)
    }

    /// Runners for `platforms` (all when empty) rooted at `datawarehouse`,
    /// fetching through GraphQL
    pub fn build_runners(&self, datawarehouse: &Path, platforms: &[String], settings: &SourceSettings) -> Result<Vec<Runner>> {
        self.build_runners_with(datawarehouse, platforms, |endpoint| {
            let client = GraphQlClient::new(endpoint, settings.api_key.as_deref())?;
            Ok(Arc::new(GraphQlSource::new(client, settings.page_size)) as Arc<dyn RecordSource>)
        })
    }

    /// Same as [`build_runners`](Self::build_runners) with a caller-chosen
    /// source per endpoint. Collectors on one endpoint share a source.
    pub fn build_runners_with<F>(&self, datawarehouse: &Path, platforms: &[String], mut connect: F) -> Result<Vec<Runner>>
    where
        F: FnMut(&str) -> Result<Arc<dyn RecordSource>>,
    {
        let selected = if platforms.is_empty() {
            self.platform_names()
        } else {
            platforms.to_vec()
        };

        let mut sources: BTreeMap<String, Arc<dyn RecordSource>> = BTreeMap::new();
        let mut source_for = |endpoint: &str| -> Result<Arc<dyn RecordSource>> {
            if let Some(source) = sources.get(endpoint) {
                return Ok(source.clone());
            }
            let source = connect(endpoint)?;
            sources.insert(endpoint.to_string(), source.clone());
            Ok(source)
        };

        let mut runners = Vec::with_capacity(selected.len());
        for platform in &selected {
            let spec = self
                .platforms
                .get(platform)
                .ok_or_else(|| SyncError::Config(format!("unknown platform {}", platform)))?;

            let mut runner = Runner::new(platform, datawarehouse);
            let runner_dir = runner.basedir().to_path_buf();
            let networks = self.platform_networks(platform);

            for collector in &spec.collectors {
                match &collector.snapshot {
                    Some(snapshot) => {
                        let source = source_for(&snapshot.endpoint)?;
                        runner.add(Box::new(
                            SnapshotCollector::new(platform, &collector.name, &snapshot.label, collector.query(), source, &runner_dir)
                                .with_pipeline(collector.pipeline(&runner_dir)),
                        ));
                    }
                    None => {
                        for (network, endpoint) in &networks {
                            let source = source_for(endpoint)?;
                            runner.add(Box::new(
                                NetworkCollector::new(platform, &collector.name, network, collector.query(), source, &runner_dir)
                                    .with_pipeline(collector.pipeline(&runner_dir)),
                            ));
                        }
                    }
                }
            }
            runners.push(runner);
        }
        Ok(runners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::record::Record;
    use crate::source::{FetchRequest, SourceError};

    const CATALOG: &str = r#"{
        "endpoints": {
            "mainnet": {"_blocks": "blocks-main", "daostack": "ds-main", "aragon": "ar-main"},
            "xdai": {"_blocks": "blocks-xdai", "daostack": "ds-xdai"}
        },
        "platforms": {
            "daostack": {"collectors": [
                {"name": "daos", "fields": ["id", "name"]},
                {"name": "proposals", "fields": ["id", "dao.id"],
                 "postprocess": [{"rename": {"daoId": "dao"}}, {"retain_known": {"column": "dao", "dataset": "daos"}}]}
            ]},
            "aragon": {"collectors": [
                {"name": "apps", "entity": "repos", "fields": ["id"], "filters": {"active": true}},
                {"name": "prices", "fields": ["id", "usd"], "snapshot": {"endpoint": "https://prices.example/q"}}
            ]}
        }
    }"#;

    struct Empty;

    impl RecordSource for Empty {
        fn fetch(&self, _request: &FetchRequest<'_>) -> std::result::Result<Vec<Record>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_networks_per_platform() {
        let catalog = Catalog::from_slice(CATALOG.as_bytes()).unwrap();
        assert_eq!(catalog.networks(), vec!["mainnet", "xdai"]);
        assert_eq!(
            catalog.platform_networks("daostack"),
            vec![("mainnet".to_string(), "ds-main".to_string()), ("xdai".to_string(), "ds-xdai".to_string())]
        );
        assert_eq!(catalog.platform_networks("aragon").len(), 1);
    }

    #[test]
    fn test_build_runners_expands_networks() {
        let catalog = Catalog::from_slice(CATALOG.as_bytes()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut connected = Vec::new();
        let runners = catalog
            .build_runners_with(dir.path(), &[], |endpoint| {
                connected.push(endpoint.to_string());
                Ok(Arc::new(Empty) as Arc<dyn RecordSource>)
            })
            .unwrap();

        let ids: Vec<Vec<String>> = runners
            .iter()
            .map(|r| r.collectors().iter().map(|c| c.collector_id()).collect())
            .collect();
        assert_eq!(ids[0], vec!["aragon/apps-mainnet", "aragon/prices"]);
        assert_eq!(
            ids[1],
            vec!["daostack/daos-mainnet", "daostack/daos-xdai", "daostack/proposals-mainnet", "daostack/proposals-xdai"]
        );
        connected.sort();
        assert_eq!(connected, vec!["ar-main", "ds-main", "ds-xdai", "https://prices.example/q"]);
    }

    #[test]
    fn test_unknown_platform_is_config_error() {
        let catalog = Catalog::from_slice(CATALOG.as_bytes()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = catalog
            .build_runners_with(dir.path(), &["moloch".to_string()], |_| Ok(Arc::new(Empty) as Arc<dyn RecordSource>))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_duplicate_collector_rejected() {
        let text = r#"{"endpoints": {}, "platforms": {"p": {"collectors": [
            {"name": "a", "fields": ["id"]}, {"name": "a", "fields": ["id"]}
        ]}}}"#;
        assert!(matches!(Catalog::from_slice(text.as_bytes()), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_query_uses_entity_override() {
        let catalog = Catalog::from_slice(CATALOG.as_bytes()).unwrap();
        let apps = &catalog.platforms["aragon"].collectors[0];
        let query = apps.query();
        assert_eq!(query.entity, "repos");
        assert_eq!(query.filters["active"], serde_json::json!(true));
    }
}
