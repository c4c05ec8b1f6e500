mod common;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use agent_session_engine::{
    channels, AgentType, ContractAnalysis, ContractAnalyzer, CreateSessionRequest, Engine,
    EngineError, EngineResult, EngineSettings, Session,
};
use common::git_repo_builder::write_file;
use common::{drain_events, GitRepoBuilder};
use tempfile::TempDir;

fn quiet_settings() -> EngineSettings {
    EngineSettings {
        auto_commit: false,
        auto_lock: false,
        push_on_commit: false,
        ..EngineSettings::default()
    }
}

/// Analyzer that records its calls and reports one contract change per commit.
#[derive(Default)]
struct RecordingAnalyzer {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl ContractAnalyzer for RecordingAnalyzer {
    async fn analyze(
        &self,
        session: &Session,
        commit_hash: &str,
    ) -> EngineResult<ContractAnalysis> {
        self.calls
            .lock()
            .unwrap()
            .push((session.session_id.clone(), commit_hash.to_string()));
        Ok(ContractAnalysis {
            contract_changes: 1,
            breaking_changes: 0,
        })
    }
}

/// Analyzer that fails on a chosen commit.
struct FailingAnalyzer {
    fail_on: String,
    calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ContractAnalyzer for FailingAnalyzer {
    async fn analyze(
        &self,
        _session: &Session,
        commit_hash: &str,
    ) -> EngineResult<ContractAnalysis> {
        self.calls.lock().unwrap().push(commit_hash.to_string());
        if commit_hash == self.fail_on {
            return Err(EngineError::Internal("analyzer crashed".to_string()));
        }
        Ok(ContractAnalysis {
            contract_changes: 1,
            breaking_changes: 1,
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_recovery_processes_unseen_commits_in_order() {
    let repo = GitRepoBuilder::new()
        .with_file("README.md", "# r\n")
        .commit("Initial commit")
        .build();
    let base = repo.head();
    let state = TempDir::new().unwrap();

    // First engine run: a session with two commits past the watermark.
    let (session_id, c1, c2) = {
        let engine =
            Engine::new(Some(state.path().to_path_buf()), quiet_settings()).expect("engine");
        let session = engine
            .create_session(CreateSessionRequest::new(
                repo.path(),
                AgentType::Claude,
                "task",
            ))
            .await
            .expect("create session");
        let worktree = Path::new(&session.worktree_path).to_path_buf();

        write_file(&worktree, "one.txt", "1\n");
        let c1 = repo.commit_all_in(&worktree, "feat: one");
        write_file(&worktree, "two.txt", "2\n");
        let c2 = repo.commit_all_in(&worktree, "feat: two");

        engine
            .store()
            .update_processing_state(&session.session_id, |processing| {
                processing.last_processed_commit = Some(base.clone());
            })
            .expect("set watermark");

        engine.shutdown().await;
        (session.session_id, c1, c2)
    };

    // Second engine run against the same durable state.
    let engine = Engine::new(Some(state.path().to_path_buf()), quiet_settings()).expect("engine");
    let analyzer = RecordingAnalyzer::default();
    let report = engine.recover(&analyzer).await.expect("recover");

    let calls = analyzer.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            (session_id.clone(), c1.clone()),
            (session_id.clone(), c2.clone())
        ],
        "analyzer runs once per unseen commit, oldest first"
    );

    let processed = report
        .processed
        .iter()
        .find(|(id, _)| *id == session_id)
        .expect("session processed");
    assert_eq!(processed.1, vec![c1, c2.clone()]);

    let processing = engine.store().processing_state(&session_id);
    assert_eq!(processing.last_processed_commit.as_deref(), Some(c2.as_str()));
    assert_eq!(processing.contract_changes_count, 2);
    assert_eq!(processing.breaking_changes_count, 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_with_no_new_commits_reports_zero() {
    let repo = GitRepoBuilder::new()
        .with_file("README.md", "# r\n")
        .commit("Initial commit")
        .build();
    let state = TempDir::new().unwrap();
    let engine = Engine::new(Some(state.path().to_path_buf()), quiet_settings()).expect("engine");

    let session = engine
        .create_session(CreateSessionRequest::new(
            repo.path(),
            AgentType::Warp,
            "task",
        ))
        .await
        .expect("create session");
    let branch_tip = repo.git(&["rev-parse", &session.branch_name]);
    engine
        .store()
        .update_processing_state(&session.session_id, |processing| {
            processing.last_processed_commit = Some(branch_tip);
        })
        .expect("set watermark");

    let analyzer = RecordingAnalyzer::default();
    let report = engine.recover(&analyzer).await.expect("recover");

    assert!(analyzer.calls.lock().unwrap().is_empty());
    let processed = report
        .processed
        .iter()
        .find(|(id, _)| *id == session.session_id)
        .expect("session still swept");
    assert!(processed.1.is_empty());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_commit_is_skipped_and_sweep_continues() {
    let repo = GitRepoBuilder::new()
        .with_file("README.md", "# r\n")
        .commit("Initial commit")
        .build();
    let base = repo.head();
    let state = TempDir::new().unwrap();
    let engine = Engine::new(Some(state.path().to_path_buf()), quiet_settings()).expect("engine");

    let session = engine
        .create_session(CreateSessionRequest::new(
            repo.path(),
            AgentType::Claude,
            "task",
        ))
        .await
        .expect("create session");
    let worktree = Path::new(&session.worktree_path).to_path_buf();
    write_file(&worktree, "one.txt", "1\n");
    let c1 = repo.commit_all_in(&worktree, "feat: one");
    write_file(&worktree, "two.txt", "2\n");
    let c2 = repo.commit_all_in(&worktree, "feat: two");

    engine
        .store()
        .update_processing_state(&session.session_id, |processing| {
            processing.last_processed_commit = Some(base.clone());
        })
        .expect("set watermark");

    let analyzer = FailingAnalyzer {
        fail_on: c1.clone(),
        calls: Mutex::new(Vec::new()),
    };
    engine.recover(&analyzer).await.expect("recover");

    assert_eq!(*analyzer.calls.lock().unwrap(), vec![c1, c2.clone()]);
    // The failed commit did not advance the watermark; the next one did.
    let processing = engine.store().processing_state(&session.session_id);
    assert_eq!(processing.last_processed_commit.as_deref(), Some(c2.as_str()));
    assert_eq!(processing.contract_changes_count, 1);
    assert_eq!(processing.breaking_changes_count, 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn orphaned_descriptors_are_reported() {
    let repo = GitRepoBuilder::new()
        .with_file("README.md", "# r\n")
        .commit("Initial commit")
        .build();
    let state = TempDir::new().unwrap();
    let engine = Engine::new(Some(state.path().to_path_buf()), quiet_settings()).expect("engine");

    let session = engine
        .create_session(CreateSessionRequest::new(
            repo.path(),
            AgentType::Claude,
            "task",
        ))
        .await
        .expect("create session");

    // A descriptor on disk with no stored session.
    std::fs::write(
        repo.path().join(".devops-agent/sessions/sess_orphan.json"),
        r#"{"sessionId": "sess_orphan"}"#,
    )
    .unwrap();

    let mut rx = engine.events().subscribe();
    let analyzer = RecordingAnalyzer::default();
    let report = engine.recover(&analyzer).await.expect("recover");

    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].session_id, "sess_orphan");
    // The live session's descriptor is not an orphan.
    assert!(!report
        .orphans
        .iter()
        .any(|orphan| orphan.session_id == session.session_id));

    let events = drain_events(&mut rx, Duration::from_millis(500)).await;
    let orphan_event = events
        .iter()
        .find(|e| e.channel == channels::RECOVERY_ORPHANS_FOUND)
        .expect("orphans event");
    assert!(orphan_event.payload["sessionIds"]
        .as_array()
        .unwrap()
        .iter()
        .any(|id| id == "sess_orphan"));

    engine.shutdown().await;
}
