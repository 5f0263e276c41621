use std::path::PathBuf;

use mrb_storage::{CacheSlot, FileCacheStore};
use mrb_sync::{Briefing, BriefingConfig, FetchOutcome, FetchPhase};
use tempfile::tempdir;

fn sample_fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample/upstream.json")
}

#[tokio::test]
async fn fixture_cycle_succeeds_then_serves_cache_when_offline() {
    let cache_dir = tempdir().expect("cache dir");
    let root = tempdir().expect("workspace root");
    std::fs::write(
        root.path().join("briefing.yaml"),
        "workflow_prefixes:\n  - \"Capital Projects: \"\nutc_offset_minutes: 0\n",
    )
    .expect("briefing.yaml");

    let config = BriefingConfig {
        fixture_path: Some(sample_fixture_path()),
        cache_dir: cache_dir.path().to_path_buf(),
        workspace_root: root.path().to_path_buf(),
        max_attempts: 1,
        ..BriefingConfig::default()
    };
    let briefing = Briefing::from_config(config.clone()).expect("briefing");
    assert!(briefing.enrichment.is_some());
    assert_eq!(briefing.strategies.len(), 1);

    let mut orchestrator = briefing.orchestrator();
    let outcome = orchestrator.run_cycle().await;
    let FetchOutcome::Success { tasks, .. } = &outcome else {
        panic!("expected success, got {outcome:?}");
    };
    // The draft request has no workflow reference and is filtered out.
    assert_eq!(tasks.len(), 3);
    let unit_214 = tasks
        .iter()
        .find(|t| t.title == "Unit 214 make-ready")
        .expect("unit 214");
    assert_eq!(unit_214.status, "In Progress");
    assert_eq!(unit_214.details, "Make Ready");
    assert_eq!(unit_214.service_request_id.as_deref(), Some("90412"));
    assert_eq!(unit_214.evs.as_deref(), Some("Scheduled"));
    let clubhouse = tasks
        .iter()
        .find(|t| t.title == "Clubhouse HVAC inspection")
        .expect("clubhouse");
    assert_eq!(clubhouse.status, "On Hold");
    assert_eq!(clubhouse.date, mrb_core::NO_DATE);

    let store = FileCacheStore::new(cache_dir.path());
    assert!(store.slot_path(CacheSlot::Dataset).exists());
    assert!(store.slot_path(CacheSlot::Timestamp).exists());

    let offline = Briefing::from_config(BriefingConfig {
        fixture_path: None,
        ..config
    })
    .expect("offline briefing");
    assert!(offline.strategies.is_empty());
    let degraded = offline.orchestrator().run_cycle().await;
    assert_eq!(degraded.phase(), FetchPhase::Degraded);
    assert_eq!(degraded.tasks(), outcome.tasks());
}
