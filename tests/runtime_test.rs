mod common;

use agent_runtime::error::{LlmError, RuntimeError};
use agent_runtime::agent::events::Phase;
use agent_runtime::runtime::{
    CreateSession, PersistedState, PromptRequest, Run, RunStatus, STATE_VERSION, Session, SessionUpdate,
};
use agent_runtime::store::{FileSessionStore, SessionStore};
use common::{MODEL, ScriptedLlm, answer, drain, runtime, tool_call};
use serde_json::{Map, json};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::Builder;
use tokio::sync::Notify;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn prompt(session_id: &str, message: &str, auto_apply: bool) -> PromptRequest {
    PromptRequest {
        session_id: session_id.to_string(),
        message: message.to_string(),
        auto_apply,
        ..PromptRequest::default()
    }
}

fn model_session() -> CreateSession {
    CreateSession {
        model_id: Some(MODEL.to_string()),
        ..CreateSession::default()
    }
}

#[tokio::test]
async fn test_native_tool_call_run_completes() {
    let tmp_dir = Builder::new().prefix("test-runtime-native").tempdir().unwrap();
    fs::write(tmp_dir.path().join("main.py"), "print('hi')\n").unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .turn(tool_call("list_files", json!({"path": "."})))
            .turn(answer("The project has main.py.")),
    );
    let (runtime, mut events) = runtime(tmp_dir.path(), llm.clone());

    let session = runtime.create_session(model_session()).await;
    let run = runtime
        .start_prompt(prompt(&session.id, "What files are in the project?", true))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Queued);

    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let result = run.result.unwrap();
    assert_eq!(result["tool_steps"], 1);
    assert_eq!(result["model_id"], MODEL);
    assert_eq!(result["fallback_used"], false);
    assert!(
        result["assistant_message"]
            .as_str()
            .unwrap()
            .contains("main.py")
    );
    assert_eq!(result["verification"]["checks"]["tool_steps_recorded"], true);
    assert_eq!(result["verification"]["workspace_summary"]["total"], 0);

    let events = drain(&mut events);
    let names: Vec<&str> = events.iter().map(|e| e.event).collect();
    assert_eq!(names.first(), Some(&"run.started"));
    assert_eq!(names.last(), Some(&"run.completed"));
    assert!(names.contains(&"run.verified"));
    let first_act = events
        .iter()
        .position(|e| e.event == "run.progress" && e.phase == Phase::Act)
        .expect("act progress event");
    let first_final = events
        .iter()
        .position(|e| e.event == "run.progress" && e.phase == Phase::Final)
        .expect("final progress event");
    assert!(first_act < first_final);

    // The tool catalog went out with every completion.
    let completions = llm.completions.lock().unwrap();
    assert_eq!(completions.len(), 2);
    assert!(completions[0].tools.iter().any(|t| t.name == "list_files"));

    let session = runtime.get_session(&session.id).await.unwrap();
    assert!(session.active_run_id.is_none());
    assert!(session.chat_id.is_some());
}

#[tokio::test]
async fn test_text_protocol_prepares_pending_change() {
    let tmp_dir = Builder::new().prefix("test-runtime-fallback").tempdir().unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .failure(LlmError::RequestFailed {
                status: 422,
                body: "tools not supported".into(),
            })
            .failure(LlmError::RequestFailed {
                status: 422,
                body: "tools not supported".into(),
            })
            .reply(r#"{"actions": [{"tool": "write_file", "args": {"path": "app.py", "content": "print(1)\n"}}]}"#),
    );
    let (runtime, _events) = runtime(tmp_dir.path(), llm);

    let session = runtime.create_session(model_session()).await;
    let run = runtime
        .start_prompt(prompt(&session.id, "Implement app.py that prints 1", false))
        .await
        .unwrap();
    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let result = run.result.unwrap();
    assert_eq!(result["fallback_used"], true);
    let pending = result["pending_changes"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["operation"], "write_file");
    assert_eq!(pending[0]["path"], "app.py");
    assert!(result["pending_id"].is_string());
    assert!(!tmp_dir.path().join("app.py").exists());

    // Applying the pending set writes the file, undo removes it again.
    let pending_id = result["pending_id"].as_str().unwrap();
    let applied = runtime.agent().apply_pending_changes(pending_id).unwrap();
    assert_eq!(applied.applied_files, vec!["app.py"]);
    assert_eq!(
        fs::read_to_string(tmp_dir.path().join("app.py")).unwrap(),
        "print(1)\n"
    );
    let undo = runtime
        .agent()
        .undo_applied_changes(applied.applied_change_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(undo.undone_count, 1);
    assert!(!tmp_dir.path().join("app.py").exists());
    assert!(runtime.agent().apply_pending_changes(pending_id).is_err());
}

#[tokio::test]
async fn test_denied_tool_leaves_file_untouched() {
    let tmp_dir = Builder::new().prefix("test-runtime-policy").tempdir().unwrap();
    fs::write(tmp_dir.path().join("keep.txt"), "precious").unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .turn(tool_call("delete_file", json!({"path": "keep.txt"})))
            .turn(answer("I was not allowed to delete keep.txt.")),
    );
    let (runtime, mut events) = runtime(tmp_dir.path(), llm);

    let mut metadata = Map::new();
    metadata.insert("tool_policy".into(), json!({"deny_tools": ["delete_file"]}));
    let session = runtime
        .create_session(CreateSession {
            model_id: Some(MODEL.to_string()),
            metadata,
            ..CreateSession::default()
        })
        .await;
    let run = runtime
        .start_prompt(prompt(&session.id, "Remove keep.txt", true))
        .await
        .unwrap();
    assert_eq!(run.tool_policy.deny_tools, vec!["delete_file"]);
    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        fs::read_to_string(tmp_dir.path().join("keep.txt")).unwrap(),
        "precious"
    );
    let tool_result = drain(&mut events)
        .into_iter()
        .find(|e| e.event == "tool.result")
        .expect("tool.result event");
    assert_eq!(tool_result.phase, Phase::Act);
    assert_eq!(tool_result.payload["name"], "delete_file");
    assert_eq!(tool_result.payload["ok"], false);
    assert_eq!(tool_result.payload["decision"], "deny");
    assert_eq!(tool_result.payload["source"], "deny_tools");
}

#[tokio::test]
async fn test_prompt_override_beats_session_metadata() {
    let tmp_dir = Builder::new().prefix("test-runtime-override").tempdir().unwrap();
    let (runtime, _events) = runtime(tmp_dir.path(), Arc::new(ScriptedLlm::new()));
    let mut metadata = Map::new();
    metadata.insert("tool_policy".into(), json!({"deny_mutations": true}));
    metadata.insert("verify_commands".into(), json!(["true"]));
    let session = runtime
        .create_session(CreateSession {
            model_id: Some(MODEL.to_string()),
            metadata,
            ..CreateSession::default()
        })
        .await;

    let run = runtime
        .start_prompt(PromptRequest {
            tool_policy: Some(json!({"deny_tools": ["read_file"]})),
            ..prompt(&session.id, "hello", true)
        })
        .await
        .unwrap();
    assert_eq!(run.tool_policy.deny_tools, vec!["read_file"]);
    assert!(!run.tool_policy.deny_mutations);
    assert_eq!(run.verify_commands, vec!["true"]);

    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();
    let verification = &run.result.unwrap()["verification"];
    assert_eq!(verification["workspace_summary"]["passed"], 1);
}

#[tokio::test]
async fn test_second_prompt_is_rejected_while_running() {
    let tmp_dir = Builder::new().prefix("test-runtime-busy").tempdir().unwrap();
    let hold = Arc::new(Notify::new());
    let llm = Arc::new(ScriptedLlm::new().held(hold.clone()).turn(answer("ok")));
    let (runtime, _events) = runtime(tmp_dir.path(), llm);
    let session = runtime.create_session(model_session()).await;

    let first = runtime
        .start_prompt(prompt(&session.id, "first", true))
        .await
        .unwrap();
    let err = runtime
        .start_prompt(prompt(&session.id, "second", true))
        .await
        .unwrap_err();
    match err {
        RuntimeError::RunInProgress { run_id } => assert_eq!(run_id, first.id),
        other => panic!("unexpected error: {other:?}"),
    }

    // Waiting with a short timeout does not stop the run.
    let err = runtime
        .wait_run(&first.id, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");

    hold.notify_one();
    let done = runtime.wait_run(&first.id, WAIT).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(
        runtime
            .start_prompt(prompt(&session.id, "third", true))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_cancel_reasons() {
    let tmp_dir = Builder::new().prefix("test-runtime-cancel").tempdir().unwrap();
    let hold = Arc::new(Notify::new());
    let llm = Arc::new(ScriptedLlm::new().held(hold.clone()).turn(answer("ok")));
    let (runtime, mut events) = runtime(tmp_dir.path(), llm);
    let session = runtime.create_session(model_session()).await;

    let idle = runtime.cancel_run(&session.id, None).await.unwrap();
    assert!(!idle.cancelled);
    assert_eq!(idle.reason.as_deref(), Some("no_active_run"));

    let run = runtime
        .start_prompt(prompt(&session.id, "long task", true))
        .await
        .unwrap();
    let cancel = runtime.cancel_run(&session.id, None).await.unwrap();
    assert!(cancel.cancelled);
    assert_eq!(cancel.run_id.as_deref(), Some(run.id.as_str()));

    hold.notify_one();
    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_ref().unwrap().kind, "Cancelled");
    assert!(drain(&mut events).iter().any(|e| e.event == "run.cancelled"));

    let finished = runtime.cancel_run(&session.id, Some(&run.id)).await.unwrap();
    assert!(!finished.cancelled);
    assert_eq!(finished.reason.as_deref(), Some("run_already_finished"));
    let idle = runtime.cancel_run(&session.id, None).await.unwrap();
    assert_eq!(idle.reason.as_deref(), Some("no_active_run"));
}

#[tokio::test]
async fn test_unknown_model_fails_run() {
    let tmp_dir = Builder::new().prefix("test-runtime-model").tempdir().unwrap();
    let (runtime, _events) = runtime(tmp_dir.path(), Arc::new(ScriptedLlm::new()));
    let session = runtime
        .create_session(CreateSession {
            model_id: Some("missing-model".into()),
            ..CreateSession::default()
        })
        .await;
    let run = runtime
        .start_prompt(prompt(&session.id, "hello", true))
        .await
        .unwrap();
    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().kind, "ModelNotFound");
}

#[tokio::test]
async fn test_repeated_auth_failure_fails_run() {
    let tmp_dir = Builder::new().prefix("test-runtime-auth").tempdir().unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .failure(LlmError::Authentication("token expired".into()))
            .failure(LlmError::Authentication("token expired".into())),
    );
    let (runtime, _events) = runtime(tmp_dir.path(), llm.clone());
    let session = runtime.create_session(model_session()).await;

    let run = runtime
        .start_prompt(prompt(&session.id, "hello", true))
        .await
        .unwrap();
    let run = runtime.wait_run(&run.id, WAIT).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().kind, "AuthenticationError");
    assert_eq!(llm.login_count(), 1);
    assert!(runtime.get_session(&session.id).await.unwrap().active_run_id.is_none());
}

#[tokio::test]
async fn test_restart_marks_running_run_interrupted() {
    let tmp_dir = Builder::new().prefix("test-runtime-restart").tempdir().unwrap();
    let root = tmp_dir.path();
    let store = FileSessionStore::new(root, root.join(".agent-runtime"));

    let mut session = Session::new(Some(MODEL.into()), None, Map::new());
    let run: Run = serde_json::from_value(json!({
        "id": "run-1",
        "session_id": session.id,
        "message": "hello",
        "auto_apply": true,
        "status": "running",
        "created_at": "2026-01-01T00:00:00Z",
        "started_at": "2026-01-01T00:00:01Z",
    }))
    .unwrap();
    session.active_run_id = Some(run.id.clone());
    let state = PersistedState {
        version: STATE_VERSION,
        sessions: vec![session.clone()],
        runs: vec![run],
    };
    store.save_protocol_state(&json!(state)).unwrap();

    let (runtime, _events) = runtime(root, Arc::new(ScriptedLlm::new()));
    let run = runtime.get_run("run-1").await.unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
    assert_eq!(run.error.unwrap().kind, "Interrupted");
    assert!(run.finished_at.is_some());

    let session = runtime.get_session(&session.id).await.unwrap();
    assert!(session.active_run_id.is_none());
    // The session accepts new prompts after recovery.
    let next = runtime
        .start_prompt(prompt(&session.id, "again", true))
        .await
        .unwrap();
    assert_eq!(
        runtime.wait_run(&next.id, WAIT).await.unwrap().status,
        RunStatus::Completed
    );

    // The recovered state was written back.
    let saved = store.load_protocol_state().unwrap().unwrap();
    assert!(
        saved["runs"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r["id"] == "run-1" && r["status"] == "interrupted")
    );
}

#[tokio::test]
async fn test_session_update_and_listing() {
    let tmp_dir = Builder::new().prefix("test-runtime-sessions").tempdir().unwrap();
    let (runtime, _events) = runtime(tmp_dir.path(), Arc::new(ScriptedLlm::new()));
    let session = runtime
        .create_session(CreateSession {
            model_id: Some(MODEL.into()),
            chat_id: Some("chat-1".into()),
            ..CreateSession::default()
        })
        .await;

    let updated = runtime
        .update_session(
            &session.id,
            SessionUpdate {
                chat_id: Some(None),
                ..SessionUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.model_id.as_deref(), Some(MODEL));
    assert!(updated.chat_id.is_none());

    let updated = runtime
        .update_session(
            &session.id,
            SessionUpdate {
                model_id: Some(Some("  ".into())),
                ..SessionUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.model_id.is_none());

    runtime.create_session(CreateSession::default()).await;
    assert_eq!(runtime.list_sessions().await.len(), 2);
    assert_eq!(
        runtime.get_session("nope").await.unwrap_err().code(),
        "not_found"
    );
    assert!(runtime.latest_run(&session.id).await.unwrap().is_none());

    let err = runtime
        .start_prompt(prompt(&session.id, "   ", true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_params");
}
