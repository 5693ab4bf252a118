//! Extract-mode runs: spooling, consolidation and failure isolation

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use solbatch::batch::{BatchRunner, OperationStatus, RunMode};
use solbatch::config::{AppConfig, RunConfig};
use solbatch::spool::{ConsolidationOutcome, OutputConsolidator, SpoolDirectory};
use solbatch::transport::memory::MemoryTransport;
use solbatch::transport::Row;

fn row(values: &[&str]) -> Row {
    values.iter().map(|v| Some(v.to_string())).collect()
}

fn write_template(dir: &Path, operation: &str, body: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{}.csv", operation)), body).unwrap();
}

fn configs(dir: &Path, format: &str, procedures: &[&str]) -> (AppConfig, RunConfig) {
    let app = AppConfig {
        concurrency: 2,
        log_file_path: dir.join("logs"),
        ..AppConfig::default()
    };
    let mut run = RunConfig::new("PKG", procedures.iter().map(|p| p.to_string()).collect());
    run.template_path = dir.join("templates");
    run.spool_output_path = dir.join("spool");
    run.format = format.to_string();
    run.delimiter = ";".to_string();
    run.worker_count = 2;
    (app, run)
}

#[tokio::test]
async fn test_fixed_width_single_row_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (app, run) = configs(dir.path(), "fixed", &["P1"]);
    write_template(
        &run.template_path,
        "P1",
        "name,length,align\nID,5,left\nAMT,6,right\n",
    );
    let transport = Arc::new(MemoryTransport::new().with_rows("P1", "S1", vec![row(&["7", "42"])]));

    let report = BatchRunner::new(app, run, RunMode::Extract, transport)
        .run(vec!["S1".to_string()])
        .await
        .unwrap();

    assert_eq!(report.failures, 0);
    let output = dir.path().join("spool").join("P1.txt");
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "7        42\n");
    assert!(report.log_path.ends_with("PKG_extract.csv"));
    assert!(matches!(
        report.consolidation[0].result,
        Ok(ConsolidationOutcome::Merged { files: 1, .. })
    ));
    assert!(!dir.path().join("spool").join("P1").join("S1.spool").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_are_isolated_and_output_is_in_entity_order() {
    let dir = tempfile::tempdir().unwrap();
    let (app, run) = configs(dir.path(), "delimited", &["P1", "P2"]);
    write_template(&run.template_path, "P1", "NAME,LENGTH\nID,0\nNOTE,0\n");
    // No template for P2.
    let transport = Arc::new(
        MemoryTransport::new()
            .with_rows("P1", "S3", vec![row(&["3", "c"])])
            .with_rows("P1", "S1", vec![row(&["1", "a\nb"]), row(&["1", "z"])])
            .with_rows("P1", "S2", vec![row(&["2", "x"]), row(&["2", "y"])])
            .with_scan_failure("P1", "S2", 1),
    );
    let entities = vec!["S3".to_string(), "S1".to_string(), "S2".to_string()];

    let report = BatchRunner::new(app, run, RunMode::Extract, transport)
        .run(entities)
        .await
        .unwrap();

    assert_eq!(report.outcomes, 6);
    assert_eq!(report.failures, 4);
    assert_eq!(report.summary["P1"].status, OperationStatus::Fail);
    assert_eq!(report.summary["P2"].status, OperationStatus::Fail);

    let spool = dir.path().join("spool");
    assert_eq!(
        std::fs::read_to_string(spool.join("P1.txt")).unwrap(),
        "1;a b\n1;z\n3;c\n"
    );
    assert!(!spool.join("P2.txt").exists());
    assert!(matches!(
        report.consolidation[1].result,
        Ok(ConsolidationOutcome::NothingToMerge)
    ));
}

#[tokio::test]
async fn test_second_consolidation_leaves_output_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (app, run) = configs(dir.path(), "delimited", &["P1"]);
    write_template(&run.template_path, "P1", "name\nID\n");
    let spool_root = run.spool_output_path.clone();
    let transport = Arc::new(
        MemoryTransport::new()
            .with_rows("P1", "S1", vec![row(&["1"])])
            .with_rows("P1", "S2", vec![row(&["2"])]),
    );

    BatchRunner::new(app, run, RunMode::Extract, transport)
        .run(vec!["S1".to_string(), "S2".to_string()])
        .await
        .unwrap();

    let output = spool_root.join("P1.txt");
    let first = std::fs::read(&output).unwrap();
    assert_eq!(first, b"1\n2\n");

    let consolidator = OutputConsolidator::new(SpoolDirectory::new(&spool_root));
    assert_eq!(
        consolidator.consolidate("P1").unwrap(),
        ConsolidationOutcome::NothingToMerge
    );
    assert_eq!(std::fs::read(&output).unwrap(), first);
}

#[tokio::test]
async fn test_unknown_format_fails_operations_but_not_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (app, run) = configs(dir.path(), "xml", &["P1"]);
    write_template(&run.template_path, "P1", "name\nID\n");
    let transport = Arc::new(MemoryTransport::new().with_rows("P1", "S1", vec![row(&["1"])]));

    let report = BatchRunner::new(app, run, RunMode::Extract, transport.clone())
        .run(vec!["S1".to_string(), "S2".to_string()])
        .await
        .unwrap();

    assert_eq!(report.failures, 2);
    assert_eq!(transport.call_count(), 0);
    let log = std::fs::read_to_string(&report.log_path).unwrap();
    assert_eq!(log.matches("Unknown output format 'xml'").count(), 2);
}

#[tokio::test]
async fn test_previous_output_replaced_by_new_run() {
    let dir = tempfile::tempdir().unwrap();
    let (app, run) = configs(dir.path(), "delimited", &["P1"]);
    write_template(&run.template_path, "P1", "name\nID\n");
    std::fs::create_dir_all(&run.spool_output_path).unwrap();
    let output = run.spool_output_path.join("P1.txt");
    std::fs::write(&output, "stale\n").unwrap();
    let transport = Arc::new(MemoryTransport::new().with_rows("P1", "S1", vec![row(&["fresh"])]));

    BatchRunner::new(app, run, RunMode::Extract, transport)
        .run(vec!["S1".to_string()])
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "fresh\n");
}

#[tokio::test]
async fn test_failed_rerun_does_not_merge_earlier_spool() {
    let dir = tempfile::tempdir().unwrap();
    let (app, run) = configs(dir.path(), "delimited", &["P1"]);
    write_template(&run.template_path, "P1", "name\nID\n");
    // Left by an earlier run whose consolidation never happened.
    let stale = run.spool_output_path.join("P1").join("S1.spool");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "STALE\n").unwrap();
    let output = run.spool_output_path.join("P1.txt");
    let transport = Arc::new(
        MemoryTransport::new()
            .with_failure("P1", "S1")
            .with_rows("P1", "S2", vec![row(&["fresh"])]),
    );

    let report = BatchRunner::new(app, run, RunMode::Extract, transport)
        .run(vec!["S1".to_string(), "S2".to_string()])
        .await
        .unwrap();

    assert_eq!(report.failures, 1);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "fresh\n");
    assert!(!stale.exists());
}
