use cadre_server::{dispatch, AppState, AppStateOptions};
use cadre_types::{CommandCard, RiskLevel};
use serde_json::{json, Value};

async fn build_state(dir: &tempfile::TempDir) -> AppState {
    AppState::build(AppStateOptions {
        state_dir: dir.path().join("state"),
        db_path: dir.path().join("state").join("cadre.db"),
        workspace_root_dir: dir.path().join("workspaces"),
        project_root: dir.path().to_path_buf(),
        user_config_path: dir.path().join("user-config.toml"),
        workspace_config_path: Some(dir.path().join("ws-config.toml")),
        agent_launch: None,
    })
    .await
    .expect("state builds")
}

#[tokio::test]
async fn thread_lifecycle_over_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir).await;

    let started = dispatch(&state, "thread/start", json!({"title": "demo", "cwd": "/tmp"}))
        .await
        .expect("thread/start");
    let thread_id = started["threadId"].as_str().unwrap().to_string();
    assert!(started["conversation"]["id"].as_str().is_some());
    // No agent binary configured: the thread runs detached.
    assert_eq!(started["agent"], Value::Null);

    let listed = dispatch(&state, "thread/list", json!({})).await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let messages = dispatch(&state, "thread/messages", json!({"threadId": thread_id}))
        .await
        .unwrap();
    assert_eq!(messages["messages"].as_array().unwrap().len(), 0);

    let err = dispatch(&state, "thread/messages", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code, -32602);

    let err = dispatch(&state, "no/such/method", json!({})).await.unwrap_err();
    assert_eq!(err.code, -32601);
}

#[tokio::test]
async fn config_round_trip_with_scopes() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir).await;

    dispatch(
        &state,
        "config/write",
        json!({"key": "sandbox.policy", "value": "sandbox"}),
    )
    .await
    .expect("user write");
    dispatch(
        &state,
        "config/write",
        json!({"key": "sandbox.policy", "value": "no-sandbox", "scope": "workspace"}),
    )
    .await
    .expect("workspace write");

    let read = dispatch(&state, "config/read", json!({"key": "sandbox.policy"}))
        .await
        .unwrap();
    assert_eq!(read["value"], json!("no-sandbox"));

    let err = dispatch(
        &state,
        "config/write",
        json!({"key": "x", "value": 1, "scope": "galaxy"}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, -32602);
}

#[tokio::test]
async fn workspace_flow_over_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir).await;
    let source = dir.path().join("src-tree");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("a.txt"), "v1").unwrap();

    let run = dispatch(
        &state,
        "workspace/create",
        json!({
            "run_key": "run-alpha",
            "dag_key": "dag-1",
            "source_root": source.to_string_lossy(),
            "paths": ["a.txt"],
        }),
    )
    .await
    .expect("workspace/create");
    assert_eq!(run["status"], json!("active"));
    let workspace_path = run["workspace_path"].as_str().unwrap().to_string();

    std::fs::write(std::path::Path::new(&workspace_path).join("a.txt"), "v2").unwrap();
    let report = dispatch(
        &state,
        "workspace/merge",
        json!({"run_key": "run-alpha", "dry_run": false, "delete_removed": false}),
    )
    .await
    .expect("workspace/merge");
    assert_eq!(report["merged"], json!(1));
    assert_eq!(report["conflicts"], json!(0));
    assert_eq!(report["status"], json!("merged"));
    assert_eq!(std::fs::read_to_string(source.join("a.txt")).unwrap(), "v2");

    // A second merge loses the status race and surfaces a policy error.
    let err = dispatch(
        &state,
        "workspace/merge",
        json!({"run_key": "run-alpha", "dry_run": false, "delete_removed": false}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, -32001);
    assert!(err.message.contains("expected active"));

    let listed = dispatch(&state, "workspace/run/list", json!({})).await.unwrap();
    assert_eq!(listed["runs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn command_cards_over_rpc_enforce_review_policy() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir).await;
    state
        .store
        .upsert_card(&CommandCard {
            key: "wipe_dir".into(),
            title: "Wipe a directory".into(),
            template: "rm -rf {path}".into(),
            risk_level: RiskLevel::Normal,
            enabled: true,
            timeout_sec: None,
        })
        .await
        .unwrap();
    state
        .store
        .upsert_card(&CommandCard {
            key: "greet".into(),
            title: "Echo".into(),
            template: "echo {name}".into(),
            risk_level: RiskLevel::Normal,
            enabled: true,
            timeout_sec: None,
        })
        .await
        .unwrap();

    // Clean card executes straight through.
    let outcome = dispatch(
        &state,
        "command/runOne",
        json!({"cardKey": "greet", "params": {"name": "cadre"}, "autoApprove": true, "timeoutSecs": 10}),
    )
    .await
    .expect("runOne");
    assert_eq!(outcome["success"], json!(true));
    assert_eq!(outcome["exit_code"], json!(0));

    // Dangerous card is parked for review even with autoApprove.
    let refused = dispatch(
        &state,
        "command/runOne",
        json!({"cardKey": "wipe_dir", "params": {"path": "/tmp/x"}, "autoApprove": true}),
    )
    .await
    .expect("refusal is a structured outcome, not an error");
    assert_eq!(refused["ok"], json!(true));
    assert_eq!(refused["exit_code"], json!(-1));
    assert!(refused["message"].as_str().unwrap().contains("禁止自动审批"));

    // Executing a pending-review run by hand is a policy error.
    let prepared = dispatch(
        &state,
        "command/prepare",
        json!({"cardKey": "wipe_dir", "params": {"path": "/tmp/x"}}),
    )
    .await
    .unwrap();
    assert_eq!(prepared["status"], json!("pending_review"));
    let err = dispatch(
        &state,
        "command/execute",
        json!({"runId": prepared["run_id"]}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, -32001);
}

#[tokio::test]
async fn turn_start_without_any_agent_fails_and_releases_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir).await;
    let started = dispatch(&state, "thread/start", json!({})).await.unwrap();
    let thread_id = started["threadId"].as_str().unwrap().to_string();

    let err = dispatch(
        &state,
        "turn/start",
        json!({"threadId": thread_id, "prompt": "do the thing"}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, -32004);

    // The single-flight slot was released, so a retry reaches the same
    // delivery error instead of an already-running answer.
    let err = dispatch(
        &state,
        "turn/start",
        json!({"threadId": thread_id, "prompt": "again"}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, -32004);

    // The optimistic user message is still recorded for the transcript.
    let messages = dispatch(&state, "thread/messages", json!({"threadId": thread_id}))
        .await
        .unwrap();
    assert_eq!(messages["messages"].as_array().unwrap().len(), 2);
}
