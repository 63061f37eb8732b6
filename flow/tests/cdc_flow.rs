use std::time::Duration;

use flow::catalog::{Catalog, MemoryCatalog};
use flow::concurrency::shutdown::create_shutdown_channel;
use flow::error::ErrorKind;
use flow::model::{
    FlowConfigUpdate, FlowStateChangeRequest, FlowStatus, TableMapping,
};
use flow::signals::{MaintenancePhase, create_maintenance_channel};
use flow::test_utils::activities::{RecordingActivities, SyncOutcome};
use flow::test_utils::catalog::GatedCatalog;
use flow::test_utils::children::StubChildFlows;
use flow::test_utils::workflow::{TestFlow, test_flow_config};
use flow::workers::{CdcFlowWorker, Worker, WorkerHandle};
use flow_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn clean_start_reaches_running_and_starts_sync() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("clean_start", &[("public.users", "users")]);
    let sync_started = fixture.activities.notify_on_sync_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();

    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    sync_started.notified().await;

    // Setup populated the source table id mapping before sync started.
    let state = controller.state();
    assert_eq!(state.sync_flow_options.src_table_id_name_mapping.len(), 1);
    assert!(
        state
            .sync_flow_options
            .src_table_id_name_mapping
            .values()
            .any(|name| name == "public.users")
    );

    // Every transition reached the catalog before it became observable.
    let history = fixture.catalog.status_history("clean_start");
    assert_eq!(
        history[..3],
        [FlowStatus::Setup, FlowStatus::Snapshot, FlowStatus::Running]
    );

    fixture.shutdown_tx.shutdown();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FlowCancelled);
    assert_eq!(
        fixture.catalog.current_status("clean_start"),
        Some(FlowStatus::Terminated)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn initial_snapshot_only_completes_without_sync() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let mut cfg = test_flow_config("snapshot_only", &[("public.users", "users")]);
    cfg.initial_snapshot_only = true;

    let handle = fixture.start(cfg).await.unwrap();
    let state = handle.wait().await.unwrap();

    assert_eq!(state.current_flow_status, FlowStatus::Completed);
    assert!(fixture.activities.sync_calls().is_empty());
    assert_eq!(
        fixture.catalog.status_history("snapshot_only"),
        vec![FlowStatus::Setup, FlowStatus::Snapshot, FlowStatus::Completed]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rerunning_the_same_mirror_reaches_the_same_terminal_state() {
    init_test_tracing();

    let mut terminal_states = Vec::new();
    for _ in 0..2 {
        let fixture = TestFlow::new();
        let mut cfg = test_flow_config("idempotent", &[("public.users", "users")]);
        cfg.initial_snapshot_only = true;

        let handle = fixture.start(cfg).await.unwrap();
        terminal_states.push(handle.wait().await.unwrap());
    }

    assert_eq!(terminal_states[0], terminal_states[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn additional_tables_are_snapshotted_and_joined() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("add_tables", &[("public.users", "users")]);
    let first_sync = fixture.activities.notify_on_sync_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    first_sync.notified().await;

    let second_sync = fixture.activities.notify_on_sync_start();
    controller
        .update_properties(FlowConfigUpdate {
            additional_tables: vec![TableMapping::new("public.orders", "orders")],
            ..Default::default()
        })
        .unwrap();

    second_sync.notified().await;
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    // The live mappings grew by exactly the added tables.
    let state = controller.state();
    let sources: Vec<&str> = state
        .sync_flow_options
        .table_mappings
        .iter()
        .map(|mapping| mapping.source_table_identifier.as_str())
        .collect();
    assert_eq!(sources, vec!["public.users", "public.orders"]);
    assert_eq!(state.sync_flow_options.src_table_id_name_mapping.len(), 2);

    // The publication was extended and the catalog config reflects both.
    assert_eq!(
        fixture.activities.publication_added(),
        vec![vec!["public.orders".to_string()]]
    );
    let stored = fixture
        .catalog
        .get_flow_config("add_tables")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.table_mappings.len(), 2);

    // The snapshot ran through a child flow in snapshot-only mode.
    let setup_calls = fixture.children.setup_calls();
    assert_eq!(setup_calls.len(), 2);
    assert!(setup_calls[1].initial_snapshot_only);
    assert_eq!(
        setup_calls[1].table_mappings[0].source_table_identifier,
        "public.orders"
    );

    assert_eq!(
        fixture.catalog.status_history("add_tables"),
        vec![
            FlowStatus::Setup,
            FlowStatus::Snapshot,
            FlowStatus::Running,
            FlowStatus::Running,
            FlowStatus::Snapshot,
            FlowStatus::Running,
        ]
    );

    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_additional_tables_are_skipped() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("overlap", &[("public.users", "users")]);
    let first_sync = fixture.activities.notify_on_sync_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    first_sync.notified().await;

    let second_sync = fixture.activities.notify_on_sync_start();
    controller
        .update_properties(FlowConfigUpdate {
            additional_tables: vec![TableMapping::new("public.users", "users_copy")],
            ..Default::default()
        })
        .unwrap();

    second_sync.notified().await;
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    assert_eq!(controller.state().sync_flow_options.table_mappings.len(), 1);
    assert_eq!(fixture.children.setup_calls().len(), 1);
    assert!(fixture.activities.publication_added().is_empty());

    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_tables_are_cleaned_up_in_order() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config(
        "remove_tables",
        &[("public.users", "users"), ("public.orders", "orders")],
    );
    let first_sync = fixture.activities.notify_on_sync_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    first_sync.notified().await;

    let second_sync = fixture.activities.notify_on_sync_start();
    controller
        .update_properties(FlowConfigUpdate {
            removed_tables: vec![TableMapping::new("public.orders", "orders")],
            ..Default::default()
        })
        .unwrap();

    second_sync.notified().await;
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    // Publication, raw table, catalog, in that order.
    let removals = fixture.activities.removals();
    let order: Vec<&str> = removals.iter().map(|(activity, _)| *activity).collect();
    assert_eq!(order, vec!["publication", "raw_table", "catalog"]);
    for (_, tables) in &removals {
        assert_eq!(tables, &vec!["public.orders".to_string()]);
    }

    // No trace of the removed table remains in the live options.
    let state = controller.state();
    assert_eq!(state.sync_flow_options.table_mappings.len(), 1);
    assert_eq!(
        state.sync_flow_options.table_mappings[0].source_table_identifier,
        "public.users"
    );
    assert!(
        state
            .sync_flow_options
            .src_table_id_name_mapping
            .values()
            .all(|name| name != "public.orders")
    );

    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_then_terminate_hands_over_to_drop_flow() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("pause_terminate", &[("public.users", "users")]);

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    controller.pause().unwrap();
    controller.wait_for_status(FlowStatus::Paused).await.unwrap();

    controller
        .request_state_change(FlowStateChangeRequest::new(FlowStatus::Terminating))
        .unwrap();

    let state = handle.wait().await.unwrap();
    assert_eq!(state.current_flow_status, FlowStatus::Terminated);

    let drops = fixture.children.drop_calls();
    assert_eq!(drops.len(), 1);
    assert!(!drops[0].resync);
    assert_eq!(drops[0].flow_job_name, "pause_terminate");

    let history = fixture.catalog.status_history("pause_terminate");
    assert_eq!(
        history[history.len() - 3..],
        [
            FlowStatus::Paused,
            FlowStatus::Terminating,
            FlowStatus::Terminated
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_processes_config_update_and_resumes() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("pause_update", &[("public.users", "users")]);

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    controller.pause().unwrap();
    controller.wait_for_status(FlowStatus::Paused).await.unwrap();

    // A config update wakes a paused mirror and resumes it.
    controller
        .update_properties(FlowConfigUpdate {
            batch_size: 500,
            ..Default::default()
        })
        .unwrap();

    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    assert_eq!(controller.state().sync_flow_options.batch_size, 500);

    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resync_shadows_and_renames_destination_tables() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("resync", &[("public.users", "users")]);
    let first_sync = fixture.activities.notify_on_sync_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    first_sync.notified().await;

    let drop_done = fixture.children.notify_on_drop();
    let rename_done = fixture.activities.notify_on_rename();
    controller
        .request_state_change(FlowStateChangeRequest::new(FlowStatus::Resync))
        .unwrap();

    drop_done.notified().await;
    rename_done.notified().await;
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    // The drop flow was asked to resync with the flags set for re-entry.
    let drops = fixture.children.drop_calls();
    assert_eq!(drops.len(), 1);
    assert!(drops[0].resync);
    let drop_cfg = drops[0].flow_connection_configs.as_ref().unwrap();
    assert!(drop_cfg.resync);
    assert!(drop_cfg.do_initial_snapshot);

    // Setup and snapshot ran against the shadow tables.
    let setup_calls = fixture.children.setup_calls();
    assert_eq!(setup_calls.len(), 2);
    assert_eq!(
        setup_calls[1].table_mappings[0].destination_table_identifier,
        "users_resync"
    );

    // The rename swapped the shadow back over the original.
    let renames = fixture.activities.renames();
    assert_eq!(renames.len(), 1);
    assert_eq!(renames[0].rename_table_options.len(), 1);
    assert_eq!(renames[0].rename_table_options[0].current_name, "users_resync");
    assert_eq!(renames[0].rename_table_options[0].new_name, "users");

    // Post-resync, the destination identifiers equal their pre-resync
    // values.
    let state = controller.state();
    assert_eq!(
        state.sync_flow_options.table_mappings[0].destination_table_identifier,
        "users"
    );

    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_count_cap_pauses_after_clean_completion() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("sync_cap", &[("public.users", "users")]);
    let first_sync = fixture.activities.notify_on_sync_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    first_sync.notified().await;

    fixture.activities.push_sync_outcome(SyncOutcome::Complete);
    controller
        .update_properties(FlowConfigUpdate {
            number_of_syncs: 1,
            ..Default::default()
        })
        .unwrap();

    controller.wait_for_status(FlowStatus::Paused).await.unwrap();
    let state = controller.state();
    assert_eq!(state.sync_flow_options.number_of_syncs, 1);
    assert_eq!(state.error_count, 0);

    controller.resume().unwrap();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn terminate_during_setup_skips_snapshot() {
    init_test_tracing();

    let fixture = TestFlow::new();
    fixture.children.hold_setup();
    let cfg = test_flow_config("early_terminate", &[("public.users", "users")]);
    let setup_started = fixture.children.notify_on_setup_start();

    let handle = fixture.start(cfg).await.unwrap();
    let controller = handle.controller();
    setup_started.notified().await;

    controller
        .request_state_change(FlowStateChangeRequest::new(FlowStatus::Terminating))
        .unwrap();

    let state = handle.wait().await.unwrap();
    assert_eq!(state.current_flow_status, FlowStatus::Terminated);
    assert!(fixture.children.snapshot_calls().is_empty());

    let drops = fixture.children.drop_calls();
    assert_eq!(drops.len(), 1);
    assert!(!drops[0].resync);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reaches_the_catalog_before_it_is_observable() {
    init_test_tracing();

    let memory = MemoryCatalog::new();
    let catalog = GatedCatalog::wrap(memory.clone());
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let write_started = catalog.notify_on_status_write_start();
    catalog.hold_status_writes();

    let cfg = test_flow_config("gated", &[("public.users", "users")]);
    let handle = CdcFlowWorker::new(
        catalog.clone(),
        RecordingActivities::new(),
        StubChildFlows::new(),
        cfg,
        None,
        shutdown_rx,
    )
    .start()
    .await
    .unwrap();
    let controller = handle.controller();

    // The initial Setup write is held first; let it through.
    write_started.notified().await;
    catalog.release_status_write();

    // The next transition is Snapshot. While its catalog write is held in
    // flight, observers must still see the previous status, and the
    // catalog must still hold the previous row.
    write_started.notified().await;
    assert_eq!(controller.status(), FlowStatus::Setup);
    assert_eq!(memory.current_status("gated"), Some(FlowStatus::Setup));

    // Once the write completes, the watch may move; by the time it does,
    // the catalog already reflects the transition.
    catalog.release_status_write();
    controller.wait_for_status(FlowStatus::Snapshot).await.unwrap();
    assert_eq!(memory.current_status("gated"), Some(FlowStatus::Snapshot));

    catalog.release_all_status_writes();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();

    shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn maintenance_mode_rotates_the_running_pass() {
    init_test_tracing();

    let fixture = TestFlow::new();
    let cfg = test_flow_config("maintenance", &[("public.users", "users")]);
    let (maintenance_tx, maintenance_rx) = create_maintenance_channel();
    let first_sync = fixture.activities.notify_on_sync_start();

    let handle = CdcFlowWorker::new(
        fixture.catalog.clone(),
        fixture.activities.clone(),
        fixture.children.clone(),
        cfg,
        None,
        fixture.shutdown_tx.subscribe(),
    )
    .with_maintenance_rx(maintenance_rx)
    .start()
    .await
    .unwrap();
    let controller = handle.controller();
    controller.wait_for_status(FlowStatus::Running).await.unwrap();
    first_sync.notified().await;

    // Enabling maintenance makes the next selector step rotate the pass,
    // which relaunches the sync activity.
    let second_sync = fixture.activities.notify_on_sync_start();
    maintenance_tx.send(MaintenancePhase::Enabled).unwrap();
    controller.resume().unwrap();
    second_sync.notified().await;

    maintenance_tx.send(MaintenancePhase::End).unwrap();
    fixture.shutdown_tx.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test(start_paused = true)]
async fn sync_failures_back_off_and_the_flow_recovers() {
    init_test_tracing();

    let fixture = TestFlow::new();
    fixture
        .activities
        .push_sync_outcome(SyncOutcome::Fail(ErrorKind::SyncFlowFailed));
    fixture.activities.push_sync_outcome(SyncOutcome::Complete);

    let cfg = test_flow_config("backoff", &[("public.users", "users")]);
    let handle = fixture.start(cfg).await.unwrap();

    // First sync fails and sleeps its backoff (auto-advanced), the second
    // completes cleanly, the third runs until shutdown.
    while fixture.activities.sync_calls().len() < 3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fixture.shutdown_tx.shutdown();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FlowCancelled);
}

#[tokio::test(start_paused = true)]
async fn sync_panic_is_contained_and_retried() {
    init_test_tracing();

    let fixture = TestFlow::new();
    fixture.activities.push_sync_outcome(SyncOutcome::Panic);

    let cfg = test_flow_config("panic", &[("public.users", "users")]);
    let handle = fixture.start(cfg).await.unwrap();

    // The panic is mapped to an error, slept on, and the sync restarted.
    while fixture.activities.sync_calls().len() < 2 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fixture.shutdown_tx.shutdown();
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FlowCancelled);
}
