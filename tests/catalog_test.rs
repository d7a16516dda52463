mod common;

use common::*;
use dwsync::catalog::Catalog;
use dwsync::collector::Collector;
use dwsync::metadata::FileMetadataStore;
use dwsync::record::{Record, Value};
use dwsync::record_store::DatasetStore;
use dwsync::runner::{RunContext, RunOptions};
use dwsync::source::{FetchRequest, RecordSource, SourceError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Answers by entity name, as a subgraph would
struct EntitySource(BTreeMap<&'static str, Vec<Record>>);

impl RecordSource for EntitySource {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<Vec<Record>, SourceError> {
        Ok(self.0.get(request.query.entity.as_str()).cloned().unwrap_or_default())
    }
}

fn demo_catalog() -> Catalog {
    Catalog::load(&Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join("catalog.json")).unwrap()
}

#[test]
fn test_demo_catalog_builds_every_collector() {
    let catalog = demo_catalog();
    let dir = tempfile::tempdir().unwrap();
    let runners = catalog
        .build_runners_with(dir.path(), &[], |_| Ok(Arc::new(EntitySource(BTreeMap::new())) as Arc<dyn RecordSource>))
        .unwrap();

    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].name(), "daostack");
    assert_eq!(runners[0].collectors().len(), 10);
    assert!(runners[0].collectors().iter().all(|c| c.verify().unwrap()));
}

#[test]
fn test_phantom_daos_are_dropped_from_proposals() {
    let catalog = demo_catalog();
    let dir = tempfile::tempdir().unwrap();

    let mut fixtures = BTreeMap::new();
    fixtures.insert("daos", vec![Record::new("mainnet", "0xa").with("name", "Genesis")]);
    fixtures.insert(
        "proposals",
        vec![
            Record::new("mainnet", "p1")
                .with("daoId", "0xa")
                .with("genesisProtocolParamsThresholdConst", "2")
                .with("competitionId", "c1"),
            Record::new("mainnet", "p2").with("daoId", "0xghost"),
        ],
    );
    let source: Arc<dyn RecordSource> = Arc::new(EntitySource(fixtures));

    let mut runners = catalog
        .build_runners_with(dir.path(), &["daostack".to_string()], |_| Ok(source.clone()))
        .unwrap();
    let runner = &mut runners[0];

    let blocks = FixedBlocks::new(&[("mainnet", 100)]);
    let resolver = blocks.resolver();
    let mut metadata = FileMetadataStore::open(runner.basedir()).unwrap();
    let mut ctx = RunContext {
        metadata: &mut metadata,
        resolver: &resolver,
    };
    let options = RunOptions {
        networks: vec!["mainnet".into()],
        ..RunOptions::default()
    };
    let report = runner.run(&mut ctx, &options).unwrap();
    assert!(report.is_clean(), "{:?}", report);

    let daos = DatasetStore::in_dir(runner.basedir(), "daos").read().unwrap();
    assert_eq!(daos[0].get("dao"), Some(&Value::from("0xa")));

    let proposals = DatasetStore::in_dir(runner.basedir(), "proposals").read().unwrap();
    assert_eq!(proposals.len(), 1);
    let kept = &proposals[0];
    assert_eq!(kept.id, "p1");
    assert_eq!(kept.get("dao"), Some(&Value::from("0xa")));
    assert_eq!(kept.get("thresholdConst"), Some(&Value::from("2")));
    assert!(kept.get("competitionId").is_none());
    assert!(kept.get("daoId").is_none());
}
