//! End-to-end pipeline flow tests.
//!
//! These tests run whole projects against mock sources and processors:
//! - Download progress independent of downstream failures
//! - Full propagation to summaries
//! - Resuming from a persisted cache without redoing work

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use terrapipe_core::{
    testing::{fixtures, MockDownloadFactory, MockUnitProcessor},
    Orchestrator, OrchestratorConfig, PersistenceStore, SchedulerStatus, SqlitePersistenceStore,
    SummaryDefinition,
};

fn orchestrator(
    root: &Path,
    store: Arc<dyn PersistenceStore>,
    factory: Arc<MockDownloadFactory>,
    processor: Arc<MockUnitProcessor>,
) -> Arc<Orchestrator> {
    let registry = fixtures::registry_with_processor("modis", factory, &["ndvi"], processor);
    let config = OrchestratorConfig {
        poll_interval_ms: 0,
        download_root: root.join("downloads"),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, store, Arc::new(registry));
    orchestrator.start().unwrap();
    orchestrator
}

fn status(orchestrator: &Orchestrator, name: &str) -> SchedulerStatus {
    orchestrator.get_scheduler_status(name).unwrap()
}

#[tokio::test]
async fn test_download_completes_while_processing_fails() {
    let tmp = TempDir::new().unwrap();
    let factory = Arc::new(MockDownloadFactory::new("modis:data", "data"));
    factory.lister.set_days(2024, 1..=10);
    let processor = Arc::new(MockUnitProcessor::new("process"));
    processor.set_fail(true);

    let orch = orchestrator(
        tmp.path(),
        Arc::new(SqlitePersistenceStore::in_memory().unwrap()),
        Arc::clone(&factory),
        Arc::clone(&processor),
    );
    orch.request_new_scheduler(fixtures::descriptor("p", tmp.path(), "modis", &["ndvi"]), true)
        .unwrap();

    assert!(
        fixtures::wait_until(Duration::from_secs(5), || {
            status(&orch, "p").plugins[0].download["data"].percent == Some(100.0)
        })
        .await
    );
    assert!(fixtures::wait_until(Duration::from_secs(5), || processor.calls() >= 10).await);

    orch.attempt_update("p");
    let status = status(&orch, "p");
    let plugin = &status.plugins[0];
    assert_eq!(plugin.download["data"].produced, 10);
    assert_eq!(plugin.download["data"].expected, Some(10));
    assert_eq!(plugin.process.produced, 0);
    assert_eq!(plugin.process.percent, Some(0.0));
    assert_ne!(plugin.index.percent, Some(100.0));
    assert!(!plugin.is_complete());
    assert!(!status.up_to_date);
}

#[tokio::test]
async fn test_outputs_propagate_to_summaries() {
    let tmp = TempDir::new().unwrap();
    let factory = Arc::new(MockDownloadFactory::new("modis:data", "data"));
    factory.lister.set_days(2024, 1..=10);

    let orch = orchestrator(
        tmp.path(),
        Arc::new(SqlitePersistenceStore::in_memory().unwrap()),
        factory,
        Arc::new(MockUnitProcessor::new("process")),
    );
    let descriptor = fixtures::descriptor("p", tmp.path(), "modis", &["ndvi"])
        .with_summary(SummaryDefinition::new("zones"));
    orch.request_new_scheduler(descriptor, true).unwrap();

    assert!(
        fixtures::wait_until(Duration::from_secs(5), || {
            status(&orch, "p").plugins[0].summary["zones"].produced == 10
        })
        .await
    );

    orch.attempt_update("p");
    let status = status(&orch, "p");
    let plugin = &status.plugins[0];
    assert_eq!(plugin.process.percent, Some(100.0));
    assert_eq!(plugin.index.percent, Some(100.0));
    assert_eq!(plugin.summary["zones"].percent, Some(100.0));
    assert!(status.up_to_date);
    assert!(tmp.path().join("p/modis/summary/2024/001").is_dir());
}

#[tokio::test]
async fn test_restart_resumes_without_redoing_work() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("terrapipe.db");

    {
        let factory = Arc::new(MockDownloadFactory::new("modis:data", "data"));
        factory.lister.set_days(2024, 1..=5);
        let orch = orchestrator(
            tmp.path(),
            Arc::new(SqlitePersistenceStore::new(&db).unwrap()),
            factory,
            Arc::new(MockUnitProcessor::new("process")),
        );
        orch.request_new_scheduler(fixtures::descriptor("p", tmp.path(), "modis", &["ndvi"]), true)
            .unwrap();
        assert!(
            fixtures::wait_until(Duration::from_secs(5), || {
                status(&orch, "p").plugins[0].index.produced == 5
            })
            .await
        );
        orch.close();
    }

    let factory = Arc::new(MockDownloadFactory::new("modis:data", "data"));
    factory.lister.set_days(2024, 1..=6);
    let processor = Arc::new(MockUnitProcessor::new("process"));
    let orch = orchestrator(
        tmp.path(),
        Arc::new(SqlitePersistenceStore::new(&db).unwrap()),
        Arc::clone(&factory),
        Arc::clone(&processor),
    );
    orch.request_new_scheduler(fixtures::descriptor("p", tmp.path(), "modis", &["ndvi"]), true)
        .unwrap();

    assert!(
        fixtures::wait_until(Duration::from_secs(5), || {
            status(&orch, "p").plugins[0].index.produced == 6
        })
        .await
    );
    assert_eq!(factory.downloader.downloads(), 1);
    assert_eq!(processor.calls(), 1);
}
