//! Integration tests for the Orchestrator
//!
//! Full runs against a simulated toolchain: stage ordering, artifacts and
//! reports, failure attribution, admission, deduplication, cancellation and
//! timeouts.

mod common;

use common::{no_options, options, orchestrator, settings, SimulatedToolchain};
use recovery_builder::artifacts::sha256_file;
use recovery_builder::orchestrator::{BuildEvent, ToolStep};
use recovery_builder::{
    ArtifactFilter, ArtifactKind, BuildOutcome, BuildStage, DeviceInfo, RecoveryFlavor,
    StageStatus, StageTimeouts, SubmitError, ValidationError,
};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_successful_build_produces_artifacts_report_and_stats() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    assert!(handle.run_id.starts_with("twrp_redfin_"));

    let report = orch.wait(&handle.run_id).await.unwrap();
    assert_eq!(report.outcome, BuildOutcome::Success, "{:?}", report.error);
    assert_eq!(report.failed_stage, None);
    assert_eq!(report.stages.len(), 7);
    let stage_names: Vec<BuildStage> = report.stages.iter().map(|s| s.name).collect();
    assert_eq!(stage_names, BuildStage::PIPELINE.to_vec());
    assert!(report
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Succeeded));

    let ts = &handle.timestamp;
    let expect = [
        (ArtifactKind::Image, format!("twrp_redfin_{}.img", ts)),
        (ArtifactKind::Archive, format!("twrp_redfin_{}.zip", ts)),
        (ArtifactKind::Log, format!("twrp_redfin_{}_build.log", ts)),
    ];
    for (kind, name) in &expect {
        let artifact = report
            .artifacts
            .iter()
            .find(|a| a.kind == *kind)
            .unwrap_or_else(|| panic!("missing {:?}", kind));
        assert_eq!(&artifact.file_name(), name);
        assert!(artifact.path.is_file());
        assert_eq!(artifact.path.parent().unwrap(), temp.path().join("artifacts"));
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(artifact.build_run_id, handle.run_id);
        if *kind != ArtifactKind::Log {
            assert_eq!(sha256_file(&artifact.path).unwrap(), artifact.sha256);
        }
    }

    let report_path = temp
        .path()
        .join("artifacts")
        .join(format!("build_report_{}.json", ts));
    assert!(report_path.is_file());

    let stats = orch.statistics();
    assert_eq!(stats.total_builds, 1);
    assert_eq!(stats.successful_builds, 1);
    let redfin = stats.device("redfin").unwrap();
    assert_eq!((redfin.builds, redfin.successes), (1, 1));

    let status = orch.status(&handle.run_id).unwrap();
    assert_eq!(status.stage, BuildStage::Done);
    assert_eq!(status.outcome, Some(BuildOutcome::Success));
    assert!(status.log_tail.iter().any(|l| l.contains("==>")));
}

#[tokio::test]
async fn test_archive_carries_image_and_metadata() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("beryllium", "orange_fox", "12.1", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();
    assert!(report.is_success(), "{:?}", report.error);

    let archive = report
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Archive)
        .unwrap();
    let mut zip = zip::ZipArchive::new(std::fs::File::open(&archive.path).unwrap()).unwrap();
    let names: Vec<String> = zip.file_names().map(str::to_string).collect();
    assert!(names.contains(&format!("orange_fox_beryllium_{}.img", handle.timestamp)));
    assert!(names.contains(&"build_info.json".to_string()));

    let metadata: serde_json::Value =
        serde_json::from_reader(zip.by_name("build_info.json").unwrap()).unwrap();
    assert_eq!(metadata["device"], "beryllium");
    assert_eq!(metadata["version"], "12.1");
}

#[tokio::test]
async fn test_compile_failure_is_attributed_and_leaves_no_image() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.fail_on(ToolStep::Compile);
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();

    assert_eq!(report.outcome, BuildOutcome::Failed);
    assert_eq!(report.failed_stage, Some(BuildStage::Compile));
    assert_eq!(report.error_kind.as_deref(), Some("stage_failure"));
    assert_eq!(report.stages.last().unwrap().status, StageStatus::Failed);
    assert!(!report
        .artifacts
        .iter()
        .any(|a| matches!(a.kind, ArtifactKind::Image | ArtifactKind::Archive)));
    assert!(report.artifacts.iter().any(|a| a.kind == ArtifactKind::Log));

    let images: Vec<_> = std::fs::read_dir(temp.path().join("artifacts"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |x| x == "img" || x == "zip"))
        .collect();
    assert!(images.is_empty());

    let stats = orch.statistics();
    assert_eq!(stats.failed_builds, 1);
    assert_eq!(stats.device("redfin").unwrap().failures, 1);
}

#[tokio::test]
async fn test_architecture_mismatch_fails_device_detect() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.board_arch("x86_64");
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("sunfish", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();

    assert_eq!(report.failed_stage, Some(BuildStage::DeviceDetect));
    assert_eq!(report.error_kind.as_deref(), Some("compatibility"));
    assert!(tools.calls(ToolStep::Compile).is_empty());
}

#[tokio::test]
async fn test_missing_tool_fails_env_setup() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.remove_tool("repo");
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();

    assert_eq!(report.failed_stage, Some(BuildStage::EnvSetup));
    assert!(report.error.unwrap().contains("repo"));
    assert!(tools.calls(ToolStep::ManifestInit).is_empty());
}

#[tokio::test]
async fn test_unrecognized_option_is_rejected_synchronously() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let err = orch
        .submit("redfin", "twrp", "3.7.0_12", &options(&[("turbo_mode", true)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::UnrecognizedOption(_))
    ));

    // Also reported for an unknown device.
    let err = orch
        .submit("nokia3310", "twrp", "3.7.0_12", &options(&[("turbo_mode", false)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::UnrecognizedOption(_))
    ));

    assert!(orch.history().unwrap().is_empty());
    assert_eq!(orch.statistics().total_builds, 0);
}

#[tokio::test]
async fn test_validation_errors() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let err = orch
        .submit("nokia3310", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::UnknownDevice(_))
    ));

    let err = orch
        .submit("redfin", "orange_fox", "12.1", &no_options())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::IncompatibleFlavor { .. })
    ));

    let err = orch
        .submit("redfin", "twrp", "latest", &no_options())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::InvalidVersion { .. })
    ));

    let err = orch
        .submit("redfin", "lineage", "20", &no_options())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Validation(ValidationError::UnknownFlavor(_))
    ));
}

#[tokio::test]
async fn test_duplicate_fingerprint_rejected_while_running() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::ManifestSync, Duration::from_millis(400));
    let orch = orchestrator(settings(temp.path()), &tools);

    let first = orch
        .submit("lmi", "twrp", "3.7.0_12", &options(&[("ccache", true)]))
        .await
        .unwrap();
    let err = orch
        .submit("lmi", "twrp", "3.7.0_12", &options(&[("ccache", true)]))
        .await
        .unwrap_err();
    match err {
        SubmitError::DuplicateRun { run_id, fingerprint } => {
            assert_eq!(run_id, first.run_id);
            assert_eq!(fingerprint, first.fingerprint);
        }
        other => panic!("expected DuplicateRun, got {:?}", other),
    }

    // A different option set is a different build.
    let other = orch
        .submit("lmi", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    assert_ne!(other.fingerprint, first.fingerprint);

    orch.wait(&first.run_id).await.unwrap();
    orch.wait(&other.run_id).await.unwrap();

    // Terminated runs no longer block resubmission.
    let again = orch
        .submit("lmi", "twrp", "3.7.0_12", &options(&[("ccache", true)]))
        .await
        .unwrap();
    assert_ne!(again.run_id, first.run_id);
    orch.wait(&again.run_id).await.unwrap();
}

#[tokio::test]
async fn test_cancel_between_stages() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::ManifestSync, Duration::from_millis(400));
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    orch.cancel(&handle.run_id).unwrap();

    let report = orch.wait(&handle.run_id).await.unwrap();
    assert_eq!(report.outcome, BuildOutcome::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("cancelled"));
    // SOURCE_SYNC completes; the run stops before DEVICE_DETECT starts.
    let sync = report
        .stages
        .iter()
        .find(|s| s.name == BuildStage::SourceSync)
        .unwrap();
    assert_eq!(sync.status, StageStatus::Succeeded);
    assert_eq!(report.failed_stage, Some(BuildStage::DeviceDetect));
    let last = report.stages.last().unwrap();
    assert_eq!(last.name, BuildStage::DeviceDetect);
    assert_eq!(last.status, StageStatus::Cancelled);
    assert!(!report.stages.iter().any(|s| s.name == BuildStage::Compile));
    assert!(tools.calls(ToolStep::Compile).is_empty());

    // Cancelling a finished run is a no-op.
    orch.cancel(&handle.run_id).unwrap();
    assert_eq!(orch.statistics().failed_builds, 1);
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::ManifestSync, Duration::from_millis(400));
    let mut s = settings(temp.path());
    s.max_concurrent_builds = 1;
    let orch = orchestrator(s, &tools);

    let running = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let queued = orch
        .submit("lmi", "orange_fox", "12.1", &no_options())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orch.status(&queued.run_id).unwrap().stage, BuildStage::Queued);

    orch.cancel(&queued.run_id).unwrap();
    let report = orch.wait(&queued.run_id).await.unwrap();
    assert_eq!(report.failed_stage, Some(BuildStage::Queued));
    assert!(report.stages.is_empty());

    let report = orch.wait(&running.run_id).await.unwrap();
    assert!(report.is_success(), "{:?}", report.error);
}

#[tokio::test]
async fn test_hanging_tool_times_out() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.hang_on(ToolStep::ManifestSync);
    let mut s = settings(temp.path());
    s.timeouts = StageTimeouts::uniform(1);
    let orch = orchestrator(s, &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), orch.wait(&handle.run_id))
        .await
        .expect("run should time out on its own")
        .unwrap();

    assert_eq!(report.failed_stage, Some(BuildStage::SourceSync));
    assert_eq!(report.error_kind.as_deref(), Some("stage_timeout"));
    assert_eq!(report.stages.last().unwrap().status, StageStatus::TimedOut);
}

#[tokio::test]
async fn test_sync_retry_counts_attempts() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.fail_times(ToolStep::ManifestSync, 1);
    let mut s = settings(temp.path());
    s.sync_retries = 1;
    let orch = orchestrator(s, &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    let sync = report
        .stages
        .iter()
        .find(|s| s.name == BuildStage::SourceSync)
        .unwrap();
    assert_eq!(sync.attempts, 2);
    assert_eq!(tools.calls(ToolStep::ManifestSync).len(), 2);
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.fail_times(ToolStep::ManifestSync, 1);
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();
    assert_eq!(report.failed_stage, Some(BuildStage::SourceSync));
    assert_eq!(tools.calls(ToolStep::ManifestSync).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_builds_keep_statistics_exact() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::Compile, Duration::from_millis(50));
    let orch = orchestrator(settings(temp.path()), &tools);

    let devices = ["redfin", "sunfish", "bluejay", "beryllium", "lmi", "guacamole"];
    let mut handles = Vec::new();
    for device in devices {
        handles.push(
            orch.submit(device, "twrp", "3.7.0_12", &no_options())
                .await
                .unwrap(),
        );
    }
    let reports =
        futures::future::join_all(handles.iter().map(|h| orch.wait(&h.run_id))).await;
    for report in &reports {
        assert!(report.as_ref().unwrap().is_success());
    }

    let stats = orch.statistics();
    assert_eq!(stats.total_builds, devices.len() as u64);
    assert_eq!(stats.successful_builds, devices.len() as u64);
    for device in devices {
        assert_eq!(stats.device(device).unwrap().builds, 1);
    }

    // Every run got its own timestamp, so no report was overwritten.
    assert_eq!(orch.history().unwrap().len(), devices.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_flavor_syncs_are_serialized() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::ManifestSync, Duration::from_millis(150));
    let orch = orchestrator(settings(temp.path()), &tools);

    let mut handles = Vec::new();
    for device in ["redfin", "sunfish", "bluejay"] {
        handles.push(
            orch.submit(device, "twrp", "3.7.0_12", &no_options())
                .await
                .unwrap(),
        );
    }
    for handle in &handles {
        assert!(orch.wait(&handle.run_id).await.unwrap().is_success());
    }

    assert_eq!(tools.max_concurrent_syncs(), 1);
    // The flavor checkout is initialized once and reused.
    assert_eq!(tools.calls(ToolStep::ManifestInit).len(), 1);
    assert_eq!(tools.calls(ToolStep::ManifestSync).len(), 3);
}

#[tokio::test]
async fn test_existing_device_tree_is_updated_not_recloned() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let first = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    orch.wait(&first.run_id).await.unwrap();
    let second = orch
        .submit("redfin", "twrp", "3.7.0_12", &options(&[("clean_build", true)]))
        .await
        .unwrap();
    assert!(orch.wait(&second.run_id).await.unwrap().is_success());

    assert_eq!(tools.calls(ToolStep::TreeClone).len(), 1);
    assert_eq!(tools.calls(ToolStep::TreeUpdate).len(), 1);
    assert!(temp
        .path()
        .join("sources/device_trees/device_redfin/BoardConfig.mk")
        .is_file());
}

#[tokio::test]
async fn test_compile_environment() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit(
            "lmi",
            "orange_fox",
            "12.1",
            &options(&[("ccache", true), ("verbose_logs", true)]),
        )
        .await
        .unwrap();
    assert!(orch.wait(&handle.run_id).await.unwrap().is_success());

    let compile = tools.calls(ToolStep::Compile).pop().unwrap();
    assert_eq!(compile.env_var("TARGET_DEVICE"), Some("lmi"));
    assert_eq!(compile.env_var("FOX_VERSION"), Some("12.1"));
    assert_eq!(compile.env_var("USE_CCACHE"), Some("1"));
    assert!(compile.env_var("CCACHE_DIR").unwrap().ends_with("cache/ccache"));
    assert!(compile.args[1].contains("lunch twrp_lmi-eng"));
    assert!(compile.cwd.ends_with("sources/orange_fox"));

    let sync_init = tools.calls(ToolStep::ManifestInit).pop().unwrap();
    assert!(sync_init.args.contains(&"fox_12.1".to_string()));
}

#[tokio::test]
async fn test_events_follow_stage_order() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);
    let mut events = orch.subscribe();

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();

    let mut stages = Vec::new();
    let mut saw_queued = false;
    let mut log_lines = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if event.run_id() != handle.run_id {
            continue;
        }
        match event {
            BuildEvent::Queued { .. } => saw_queued = true,
            BuildEvent::StageChanged { stage, .. } => stages.push(stage),
            BuildEvent::Log { .. } => log_lines += 1,
            BuildEvent::Finished { outcome, .. } => {
                assert_eq!(outcome, BuildOutcome::Success);
                break;
            }
        }
    }

    assert!(saw_queued);
    assert!(log_lines > 0);
    assert_eq!(stages, BuildStage::PIPELINE.to_vec());
}

#[tokio::test]
async fn test_history_and_artifact_filters() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    let orch = orchestrator(settings(temp.path()), &tools);

    let twrp = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    orch.wait(&twrp.run_id).await.unwrap();
    let fox = orch
        .submit("lmi", "orange_fox", "12.1", &no_options())
        .await
        .unwrap();
    orch.wait(&fox.run_id).await.unwrap();

    let history = orch.history().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].run_id, fox.run_id);

    let redfin = orch
        .list_artifacts(&ArtifactFilter {
            device: Some("redfin".into()),
            flavor: None,
        })
        .unwrap();
    assert_eq!(redfin.len(), 4);
    assert!(redfin.iter().all(|a| a.build_run_id == twrp.run_id));
    assert!(redfin.iter().any(|a| a.kind == ArtifactKind::Report));

    let fox_only = orch
        .list_artifacts(&ArtifactFilter {
            device: None,
            flavor: Some(RecoveryFlavor::OrangeFox),
        })
        .unwrap();
    assert!(fox_only.iter().all(|a| a.build_run_id == fox.run_id));

    // Deleted files drop out of the listing.
    let image = redfin.iter().find(|a| a.kind == ArtifactKind::Image).unwrap();
    std::fs::remove_file(&image.path).unwrap();
    let redfin = orch
        .list_artifacts(&ArtifactFilter {
            device: Some("redfin".into()),
            flavor: None,
        })
        .unwrap();
    assert_eq!(redfin.len(), 3);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();

    let run_id = {
        let orch = orchestrator(settings(temp.path()), &tools);
        let handle = orch
            .submit("redfin", "twrp", "3.7.0_12", &no_options())
            .await
            .unwrap();
        orch.wait(&handle.run_id).await.unwrap();
        handle.run_id
    };

    let orch = orchestrator(settings(temp.path()), &tools);
    let status = orch.status(&run_id).unwrap();
    assert_eq!(status.stage, BuildStage::Done);
    assert_eq!(status.stages.len(), 7);
    assert_eq!(orch.wait(&run_id).await.unwrap().run_id, run_id);
    assert_eq!(orch.statistics().total_builds, 1);

    let next = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    assert_ne!(next.run_id, run_id);
    orch.wait(&next.run_id).await.unwrap();
    assert_eq!(orch.history().unwrap().len(), 2);
}

#[tokio::test]
async fn test_custom_device_builds_under_custom_trees() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();

    {
        let orch = orchestrator(settings(temp.path()), &tools);
        let mut device: DeviceInfo = orch.device("redfin").unwrap();
        device.codename = "lavender".into();
        device.display_name = "Redmi Note 7".into();
        device.vendor = "Xiaomi".into();
        device.compatible_flavors = vec![RecoveryFlavor::Twrp, RecoveryFlavor::OrangeFox];
        orch.add_custom_device(
            device,
            "https://example.invalid/device_xiaomi_lavender",
            None,
        )
        .unwrap();
    }

    let orch = orchestrator(settings(temp.path()), &tools);
    let listed = orch
        .list_devices()
        .into_iter()
        .find(|d| d.codename == "lavender")
        .unwrap();
    assert!(listed.custom);

    let handle = orch
        .submit("lavender", "orange_fox", "12.1", &no_options())
        .await
        .unwrap();
    assert!(orch.wait(&handle.run_id).await.unwrap().is_success());

    assert!(temp
        .path()
        .join("sources/custom_trees/device_lavender/.git")
        .is_dir());
    assert!(temp.path().join("builds/custom").join(&handle.run_id).is_dir());
    let clone = tools.calls(ToolStep::TreeClone).pop().unwrap();
    assert!(clone
        .args
        .contains(&"https://example.invalid/device_xiaomi_lavender".to_string()));
}

#[tokio::test]
async fn test_tool_overrunning_its_deadline_times_out() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::Compile, Duration::from_secs(3));
    let mut s = settings(temp.path());
    s.timeouts.compile = 1;
    let orch = orchestrator(s, &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();

    assert_eq!(report.failed_stage, Some(BuildStage::Compile));
    assert_eq!(report.error_kind.as_deref(), Some("stage_timeout"));
    assert_eq!(report.stages.last().unwrap().status, StageStatus::TimedOut);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_filesystem_stage_is_bounded_by_its_timeout() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.board_config_as_pipe();
    let mut s = settings(temp.path());
    s.timeouts.device_detect = 1;
    let orch = orchestrator(s, &tools);

    let device = orch.device("redfin").unwrap();
    let board_config = orch
        .workspace()
        .device_tree_dir(&device)
        .unwrap()
        .join("BoardConfig.mk");

    // Opening the pipe for writing waits for DEVICE_DETECT to open it for
    // reading; the content only arrives well after the stage deadline.
    let writer = std::thread::spawn(move || {
        let started = std::time::Instant::now();
        while !board_config.exists() {
            if started.elapsed() > Duration::from_secs(10) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut pipe = std::fs::OpenOptions::new()
            .write(true)
            .open(&board_config)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2500));
        use std::io::Write;
        let _ = pipe.write_all(b"TARGET_ARCH := arm64\n");
    });

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let report = orch.wait(&handle.run_id).await.unwrap();

    assert_eq!(report.failed_stage, Some(BuildStage::DeviceDetect));
    assert_eq!(report.error_kind.as_deref(), Some("stage_timeout"));
    let detect = report.stages.last().unwrap();
    assert_eq!(detect.status, StageStatus::TimedOut);
    assert!(
        detect.duration_secs.unwrap() < 2.0,
        "stage ran {:?}s past a 1s limit",
        detect.duration_secs
    );
    assert!(tools.calls(ToolStep::Compile).is_empty());
    writer.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiting_for_a_shared_checkout_does_not_use_the_sync_timeout() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::ManifestSync, Duration::from_millis(1500));
    let mut s = settings(temp.path());
    s.timeouts.source_sync = 2;
    let orch = orchestrator(s, &tools);

    let first = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let second = orch
        .submit("sunfish", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();

    for handle in [&first, &second] {
        let report = orch.wait(&handle.run_id).await.unwrap();
        assert!(report.is_success(), "{}: {:?}", handle.run_id, report.error);
    }
    assert_eq!(tools.max_concurrent_syncs(), 1);
    assert_eq!(tools.calls(ToolStep::ManifestSync).len(), 2);
}

#[tokio::test]
async fn test_package_failure_keeps_image_out_of_artifacts() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::Compile, Duration::from_millis(500));
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let device = orch.device("redfin").unwrap();
    let staging = orch
        .workspace()
        .run_staging_dir(&device, RecoveryFlavor::Twrp, &handle.run_id)
        .unwrap();
    // A directory squatting on the archive name makes PACKAGE unable to write it.
    std::fs::create_dir_all(staging.join(format!("twrp_redfin_{}.zip", handle.timestamp)))
        .unwrap();

    let report = orch.wait(&handle.run_id).await.unwrap();
    assert_eq!(report.outcome, BuildOutcome::Failed);
    assert_eq!(report.failed_stage, Some(BuildStage::Package));
    assert_eq!(report.error_kind.as_deref(), Some("resource"));

    let image = report
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Image)
        .unwrap();
    assert!(image.path.starts_with(&staging));
    assert!(image.path.is_file());
    assert!(!temp
        .path()
        .join("artifacts")
        .join(format!("twrp_redfin_{}.img", handle.timestamp))
        .exists());
    assert_eq!(orch.statistics().failed_builds, 1);
}

#[tokio::test]
async fn test_verify_failure_promotes_nothing() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::Compile, Duration::from_millis(500));
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let artifacts_dir = temp.path().join("artifacts");
    let archive_name = format!("twrp_redfin_{}.zip", handle.timestamp);
    std::fs::create_dir_all(artifacts_dir.join(&archive_name)).unwrap();

    let report = orch.wait(&handle.run_id).await.unwrap();
    assert_eq!(report.failed_stage, Some(BuildStage::Verify));
    assert_eq!(report.error_kind.as_deref(), Some("stage_failure"));
    assert!(report.error.as_deref().unwrap().contains(&archive_name));

    assert!(!artifacts_dir
        .join(format!("twrp_redfin_{}.img", handle.timestamp))
        .exists());
    for kind in [ArtifactKind::Image, ArtifactKind::Archive] {
        let staged = report.artifacts.iter().find(|a| a.kind == kind).unwrap();
        assert!(!staged.path.starts_with(&artifacts_dir));
        assert!(staged.path.is_file());
    }
}

#[tokio::test]
async fn test_finished_runs_leave_the_active_set() {
    let temp = TempDir::new().unwrap();
    let tools = SimulatedToolchain::new();
    tools.delay(ToolStep::Compile, Duration::from_millis(300));
    let orch = orchestrator(settings(temp.path()), &tools);

    let handle = orch
        .submit("redfin", "twrp", "3.7.0_12", &no_options())
        .await
        .unwrap();
    let active = orch.active_runs();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].run_id, handle.run_id);

    orch.wait(&handle.run_id).await.unwrap();
    let finished = async {
        while !orch.active_runs().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), finished)
        .await
        .expect("finished run should be evicted");

    let status = orch.status(&handle.run_id).unwrap();
    assert_eq!(status.stage, BuildStage::Done);
    assert!(status.log_tail.iter().any(|l| l.contains("==>")));
}
