//! Session manager tests against an in-process fake backend.
//!
//! Tests cover:
//! - Lifecycle states and teardown on every exit path
//! - Copy validation and transfer semantics
//! - Command execution, exit codes and timeouts
//! - Library installation and its failure handling

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{ExecStagingBackend, FakeBackend, WORKDIR, host_tree, test_config};
use sbx::{
    BackendError, EventKind, ExecutionRequest, SandboxBackend, SandboxSession, SessionConfig,
    SessionError, SessionState,
};

fn backend(fake: &Arc<FakeBackend>) -> Arc<dyn SandboxBackend> {
    Arc::clone(fake) as Arc<dyn SandboxBackend>
}

async fn open(fake: &Arc<FakeBackend>, config: SessionConfig) -> SandboxSession {
    SandboxSession::open_with_backend(config, backend(fake))
        .await
        .expect("session should provision")
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_open_provisions_and_close_tears_down_once() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.handle().await.is_some());
        let runtime = session.runtime_environment().await.unwrap();
        assert_eq!(runtime.interpreter, "/bin/sh");
        assert_eq!(
            runtime.bin_dir.as_deref(),
            Some("/sandbox/.sandbox-venv/bin")
        );
        assert_eq!(fake.created(), 1);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fake.destroyed(), 1);
        assert_eq!(fake.live(), 0);

        drop(session);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_ready_session() {
        let fake = FakeBackend::new();
        let session = SandboxSession::new(test_config(), backend(&fake));

        let err = session.execute("true").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::StateViolation {
                state: SessionState::Uninitialized,
                ..
            }
        ));

        session.provision().await.unwrap();
        assert!(matches!(
            session.provision().await,
            Err(SessionError::StateViolation { .. })
        ));

        session.close().await.unwrap();
        let err = session.execute_command("true", None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::StateViolation {
                state: SessionState::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_never_reaches_backend() {
        let fake = FakeBackend::new();
        let config = test_config().with_workdir("/");
        let err = SandboxSession::open_with_backend(config, backend(&fake))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::InvalidConfig(_)));
        assert_eq!(fake.created(), 0);
        assert!(fake.commands().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_is_provision_error() {
        let fake = FakeBackend::new();
        fake.fail_create("python:0.0-missing");
        let session = SandboxSession::new(test_config(), backend(&fake));

        let err = session.provision().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Provision {
                source: BackendError::ImageNotFound(_),
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Failed);

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        // Nothing was created, so there is nothing to remove.
        assert_eq!(fake.destroyed(), 0);
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let fake = FakeBackend::new();
        let session = SandboxSession::new(test_config(), backend(&fake));
        let mut events = session.subscribe();
        let watch = session.watch_state();

        session.provision().await.unwrap();
        assert_eq!(*watch.borrow(), SessionState::Ready);
        session.execute("true").await.unwrap();
        session.close().await.unwrap();

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.session_id, session.id());
            if let EventKind::StateChanged { from, to } = event.kind {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (SessionState::Uninitialized, SessionState::Provisioning),
                (SessionState::Provisioning, SessionState::Ready),
                (SessionState::Ready, SessionState::Executing),
                (SessionState::Executing, SessionState::Ready),
                (SessionState::Ready, SessionState::TearingDown),
                (SessionState::TearingDown, SessionState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_workdir_outside_permitted_roots_is_rejected() {
        let fake = FakeBackend::new();
        let config = test_config().with_workdir("/etc/sbx");
        let err = SandboxSession::open_with_backend(config, backend(&fake))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::InvalidConfig(_)));
        assert_eq!(fake.created(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_close_leaves_teardown_to_drop() {
        let fake = FakeBackend::new();
        let session = Arc::new(open(&fake, test_config()).await);

        let busy = Arc::clone(&session);
        let running = tokio::spawn(async move { busy.execute("sleep 1").await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let closing = tokio::time::timeout(Duration::from_millis(100), session.close()).await;
        assert!(closing.is_err());
        assert_eq!(fake.destroyed(), 0);

        running.await.unwrap().unwrap();
        drop(session);
        assert!(fake.wait_destroyed(1).await);
        assert_eq!(fake.live(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_provisioning_is_cleaned_up() {
        let fake = FakeBackend::new();
        fake.delay_create(Duration::from_secs(2));
        let session = SandboxSession::new(test_config(), backend(&fake));

        let interrupted =
            tokio::time::timeout(Duration::from_millis(100), session.provision()).await;
        assert!(interrupted.is_err());
        assert_eq!(session.state(), SessionState::Failed);

        // The environment name is known before create returns.
        session.close().await.unwrap();
        assert_eq!(fake.destroyed(), 1);
    }
}

// ============================================================================
// Scoped sessions
// ============================================================================

mod scoped {
    use super::*;

    #[tokio::test]
    async fn test_scope_tears_down_on_success() {
        let fake = FakeBackend::new();
        let out = SandboxSession::scoped_with_backend(test_config(), backend(&fake), |s| async move {
            let result = s.execute("echo scoped").await?;
            Ok::<_, SessionError>(result.stdout)
        })
        .await
        .unwrap();

        assert_eq!(out, "scoped\n");
        assert_eq!(fake.created(), 1);
        assert_eq!(fake.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_scope_tears_down_on_error() {
        let fake = FakeBackend::new();
        let result = SandboxSession::scoped_with_backend(test_config(), backend(&fake), |s| async move {
            s.copy_to_runtime("/definitely/not/here", "in.txt").await?;
            Ok::<_, SessionError>(())
        })
        .await;

        assert!(matches!(result, Err(SessionError::SourceNotFound { .. })));
        assert_eq!(fake.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_scope_tears_down_on_panic() {
        let fake = FakeBackend::new();
        let task_backend = backend(&fake);
        let joined = tokio::spawn(async move {
            SandboxSession::scoped_with_backend(test_config(), task_backend, |_s| async move {
                if WORKDIR.starts_with('/') {
                    panic!("body failed");
                }
                Ok::<_, SessionError>(())
            })
            .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(fake.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_scope_tears_down_when_cancelled() {
        let fake = FakeBackend::new();
        let scope = SandboxSession::scoped_with_backend(test_config(), backend(&fake), |s| async move {
            s.execute("sleep 5").await
        });

        assert!(
            tokio::time::timeout(Duration::from_millis(500), scope)
                .await
                .is_err()
        );
        assert!(fake.wait_destroyed(1).await);
        assert_eq!(fake.live(), 0);
    }
}

// ============================================================================
// Copy
// ============================================================================

mod copy {
    use super::*;

    #[tokio::test]
    async fn test_file_round_trip() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let host = host_tree(&[("input.csv", "a,b\n1,2\n")]);

        session
            .copy_to_runtime(host.path().join("input.csv"), "/sandbox/input.csv")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fake.host_path("/sandbox/input.csv")).unwrap(),
            "a,b\n1,2\n"
        );

        let back = host.path().join("out/copy.csv");
        session.copy_from_runtime("input.csv", &back).await.unwrap();
        assert_eq!(std::fs::read_to_string(back).unwrap(), "a,b\n1,2\n");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_tree_is_preserved_and_replaced() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let host = host_tree(&[
            ("project/main.py", "print('hi')\n"),
            ("project/pkg/util.py", "X = 1\n"),
            ("project/pkg/data/table.txt", "rows\n"),
        ]);

        session
            .execute("mkdir -p project && touch project/stale.txt")
            .await
            .unwrap();
        session
            .copy_to_runtime(host.path().join("project"), "project")
            .await
            .unwrap();

        let listing = session
            .execute("find project -type f | sort")
            .await
            .unwrap();
        assert_eq!(
            listing.stdout,
            "project/main.py\nproject/pkg/data/table.txt\nproject/pkg/util.py\n"
        );

        let back = host.path().join("returned");
        session.copy_from_runtime("project", &back).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(back.join("pkg/data/table.txt")).unwrap(),
            "rows\n"
        );
        assert!(!back.join("stale.txt").exists());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_touches_nothing() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let before = fake.commands().len();

        let err = session
            .copy_to_runtime("/definitely/not/here.txt", "/sandbox/here.txt")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::SourceNotFound { .. }));
        assert_eq!(fake.commands().len(), before);
        assert!(!fake.host_path("/sandbox/here.txt").exists());
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_remote_leaves_host_untouched() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let host = host_tree(&[]);
        let dest = host.path().join("result.json");

        let err = session
            .copy_from_runtime("/sandbox/result.json", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::RemoteNotFound { .. }));
        assert!(!dest.exists());
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_outside_permitted_roots_are_rejected() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let host = host_tree(&[("payload.sh", "echo pwned\n")]);
        let source = host.path().join("payload.sh");

        for remote in ["/etc/profile.d/payload.sh", "../../etc/cron.d/payload", "/"] {
            let err = session.copy_to_runtime(&source, remote).await.unwrap_err();
            assert!(
                matches!(err, SessionError::InvalidPath { .. }),
                "{remote} should be rejected, got {err:?}"
            );
        }
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_staging_round_trips_nested_tree() {
        let fake = FakeBackend::new();
        let staging = ExecStagingBackend::new(Arc::clone(&fake));
        let session = SandboxSession::open_with_backend(test_config(), staging)
            .await
            .unwrap();
        let host = host_tree(&[("r/x.txt", "top\n"), ("r/b/y.txt", "nested\n")]);

        session
            .copy_to_runtime(host.path().join("r"), "r")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fake.host_path("/sandbox/r/b/y.txt")).unwrap(),
            "nested\n"
        );

        let back = host.path().join("back");
        session.copy_from_runtime("r", &back).await.unwrap();
        assert_eq!(std::fs::read_to_string(back.join("x.txt")).unwrap(), "top\n");
        assert_eq!(
            std::fs::read_to_string(back.join("b/y.txt")).unwrap(),
            "nested\n"
        );

        let leftovers: Vec<_> = std::fs::read_dir(fake.host_path(WORKDIR))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".sbx-stage-"))
            .collect();
        assert!(leftovers.is_empty());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_staging_missing_remote() {
        let fake = FakeBackend::new();
        let staging = ExecStagingBackend::new(Arc::clone(&fake));
        let session = SandboxSession::open_with_backend(test_config(), staging)
            .await
            .unwrap();
        let host = host_tree(&[]);
        let dest = host.path().join("missing");

        let err = session
            .copy_from_runtime("/sandbox/missing", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RemoteNotFound { .. }), "{err:?}");
        assert!(!dest.exists());
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_emits_event() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let mut events = session.subscribe();
        let host = host_tree(&[("a.txt", "a")]);

        session
            .copy_to_runtime(host.path().join("a.txt"), "a.txt")
            .await
            .unwrap();

        let copied = std::iter::from_fn(|| events.try_recv().ok())
            .find_map(|event| match event.kind {
                EventKind::Copied { remote, .. } => Some(remote),
                _ => None,
            });
        assert_eq!(copied.as_deref(), Some("/sandbox/a.txt"));

        session.close().await.unwrap();
    }
}

// ============================================================================
// Execution
// ============================================================================

mod execution {
    use super::*;

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;

        let result = session
            .execute("echo out; echo err >&2; exit 7")
            .await
            .unwrap();

        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.timed_out);
        assert!(!result.success());
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_argv_is_not_reinterpreted() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;

        let result = session
            .execute(ExecutionRequest::argv(["printf", "%s|%s", "a b", "$HOME"]))
            .await
            .unwrap();
        assert_eq!(result.stdout, "a b|$HOME");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_workdir_env_and_merged_output() {
        let fake = FakeBackend::new();
        let config = test_config().with_env("GREETING", "hello");
        let session = open(&fake, config).await;

        session
            .execute("mkdir -p job && echo data > job/input.txt")
            .await
            .unwrap();
        let result = session
            .execute_command("cat input.txt", Some("job"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "data\n");

        let result = session
            .execute(ExecutionRequest::shell("echo \"$GREETING $NAME\"").env("NAME", "sbx"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello sbx\n");

        let result = session
            .execute(ExecutionRequest::shell("echo a; echo b >&2").merge_output(true))
            .await
            .unwrap();
        assert!(result.stdout.contains('a') && result.stdout.contains('b'));
        assert!(result.stderr.is_empty());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_returns_promptly_and_stops_workload() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;

        let started = Instant::now();
        let result = session
            .execute(
                ExecutionRequest::shell("sleep 3; touch /sandbox/late.txt")
                    .timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, 124);
        assert!(matches!(
            result.clone().ensure_completed(),
            Err(SessionError::Timeout { .. })
        ));
        assert_eq!(session.state(), SessionState::Ready);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!fake.host_path("/sandbox/late.txt").exists());

        let result = session.execute("echo still-usable").await.unwrap();
        assert_eq!(result.stdout, "still-usable\n");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_default_timeout_applies() {
        let fake = FakeBackend::new();
        let config = test_config().with_default_timeout(Duration::from_secs(1));
        let session = open(&fake, config).await;

        let result = session.execute("sleep 3").await.unwrap();
        assert!(result.timed_out);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let fake = FakeBackend::new();
        let session = Arc::new(open(&fake, test_config()).await);

        let a = Arc::clone(&session);
        let b = Arc::clone(&session);
        let (first, second) = tokio::join!(
            async move { a.execute("echo first").await },
            async move { b.execute("echo second").await },
        );

        assert_eq!(first.unwrap().stdout, "first\n");
        assert_eq!(second.unwrap().stdout, "second\n");
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_source_with_pinned_interpreter() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;
        let mut events = session.subscribe();

        let result = session.run("echo from-source\nexit 3\n").await.unwrap();
        assert_eq!(result.stdout, "from-source\n");
        assert_eq!(result.exit_code, 3);

        let ran = fake
            .commands()
            .into_iter()
            .any(|argv| argv.iter().any(|a| a == "/bin/sh") && argv.iter().any(|a| a == "-u"));
        assert!(ran);

        let leftovers = std::fs::read_dir(fake.host_path("/sandbox/.sbx"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);

        let finished = std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
            matches!(
                event.kind,
                EventKind::CommandFinished { exit_code: 3, .. }
            )
        });
        assert!(finished);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_environment_fails_session() {
        let fake = FakeBackend::new();
        let session = open(&fake, test_config()).await;

        // Remove the environment behind the session's back.
        let handle = session.handle().await.unwrap();
        fake.destroy(&handle).await.unwrap();

        let err = session.execute("true").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Failed);

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}

// ============================================================================
// Library installation
// ============================================================================

mod install {
    use super::*;

    #[tokio::test]
    async fn test_libraries_install_in_one_batch() {
        let fake = FakeBackend::new();
        let config = test_config()
            .with_libraries(["pandas", "numpy>=1.26", "pandas"])
            .unwrap();
        let session = SandboxSession::new(config, backend(&fake));
        let mut events = session.subscribe();

        session.provision().await.unwrap();

        let installs: Vec<Vec<String>> = fake
            .commands()
            .into_iter()
            .filter(|argv| argv.iter().any(|a| a == "pip"))
            .collect();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0][0], "/bin/sh");
        assert!(installs[0].ends_with(&["pandas".to_string(), "numpy>=1.26".to_string()]));

        let count = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| {
            match event.kind {
                EventKind::LibrariesInstalled { count, .. } => Some(count),
                _ => None,
            }
        });
        assert_eq!(count, Some(2));

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_install_blocks_the_session() {
        let fake = FakeBackend::new();
        fake.fail_install("ERROR: No matching distribution found for nosuchpkg");
        let config = test_config().with_libraries(["nosuchpkg"]).unwrap();
        let session = SandboxSession::new(config, backend(&fake));

        let err = session.provision().await.unwrap_err();
        match err {
            SessionError::Install {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 1);
                assert!(output.contains("nosuchpkg"));
            }
            other => panic!("expected install error, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Failed);

        let host = host_tree(&[("main.py", "print(1)\n")]);
        assert!(matches!(
            session
                .copy_to_runtime(host.path().join("main.py"), "main.py")
                .await,
            Err(SessionError::StateViolation {
                state: SessionState::Failed,
                ..
            })
        ));
        assert!(matches!(
            session.execute("true").await,
            Err(SessionError::StateViolation { .. })
        ));

        session.close().await.unwrap();
        assert_eq!(fake.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_open_cleans_up_after_failed_install() {
        let fake = FakeBackend::new();
        fake.fail_install("resolver failed");
        let config = test_config().with_libraries(["pandas"]).unwrap();

        let err = SandboxSession::open_with_backend(config, backend(&fake))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Install { .. }));
        assert_eq!(fake.created(), 1);
        assert_eq!(fake.destroyed(), 1);
        assert_eq!(fake.live(), 0);
    }
}
