use serde_json::json;
use std::sync::Arc;
use worker_ipc::events::ChannelSink;
use worker_ipc::models::TransportKind;
use worker_ipc::notify::TracingNotifier;

// One test per binary: bootstrap installs the global subscriber.
#[tokio::test]
async fn commands_round_trip_through_bootstrap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sink, _events) = ChannelSink::new();
    let state = worker_ipc::bootstrap(dir.path(), Arc::new(sink), Arc::new(TracingNotifier))
        .await
        .expect("bootstrap");
    assert!(dir.path().join("logs").is_dir());

    let settings = worker_ipc::get_settings(&state).expect("settings");
    assert_eq!(settings.advanced.transport, TransportKind::Stdio);
    assert!(!worker_ipc::is_task_running(&state).await.expect("status"));

    // Nothing is configured yet, so tasks report the missing transport.
    let error = worker_ipc::exec(&state, vec!["GetRunningGame".to_string()])
        .await
        .expect_err("no transport");
    assert!(error.starts_with("NO_TRANSPORT_AVAILABLE"));

    let updated = worker_ipc::update_settings(&state, json!({ "logging": { "action_log_limit": 3 } }))
        .await
        .expect("update");
    assert_eq!(updated.logging.action_log_limit, 3);
    let persisted = std::fs::read_to_string(dir.path().join(worker_ipc::SETTINGS_FILE_NAME)).expect("config.toml");
    assert!(persisted.contains("action_log_limit = 3"));

    worker_ipc::game_settings_updated(&state).await.expect("game settings");
    worker_ipc::stop_task(&state, None).await.expect("idle stop");
    worker_ipc::shutdown(&state).await.expect("shutdown");
}
