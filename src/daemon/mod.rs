use std::{future::Future, path::PathBuf, pin::pin, sync::Arc, time::Duration};

use anyhow::Result;
use classify::RuleClassifier;
use collection::Sampler;
use config::TrackerConfig;
use lifecycle::{recover_open_session, InstanceLock};
use storage::{journal::JournalStore, Store, UnreadableStore};
use tokio::{
    select,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracking::{Engine, EngineMessage, SessionMachine};

use crate::{
    control::ControlServer,
    error::TrackerError,
    utils::{
        clock::{Clock, DefaultClock},
        dir::AppPaths,
    },
    window_api::{GenericWindowProbe, WindowProbe},
};

pub mod args;
pub mod classify;
pub mod collection;
pub mod config;
pub mod lifecycle;
pub mod shutdown;
pub mod storage;
pub mod tracking;

const ENGINE_QUEUE_SIZE: usize = 64;

/// Runs `future` to completion on a fresh current-thread runtime. Blocking calls still running
/// afterwards, like a window lookup stuck on the display server, get `grace` to finish before they
/// are abandoned.
pub fn block_on_bounded<F: Future>(future: F, grace: Duration) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

/// Represents the starting point for the daemon. Blocks until the daemon has stopped.
pub fn serve_daemon(paths: AppPaths, config_path: Option<PathBuf>) -> Result<()> {
    let config_path = std::path::absolute(config_path.unwrap_or_else(|| paths.config_file()))?;
    let config = TrackerConfig::load(&config_path)?;
    let grace = config.shutdown_grace();
    block_on_bounded(start_daemon(paths, config_path, config), grace)?
}

async fn start_daemon(
    paths: AppPaths,
    config_path: PathBuf,
    config: TrackerConfig,
) -> Result<()> {
    let lock = InstanceLock::acquire(paths.pid_file())?;
    std::env::set_current_dir("/")?;
    let probe = GenericWindowProbe::new()?;

    let result = run_daemon(
        &paths,
        config_path,
        config,
        Box::new(probe),
        DefaultClock,
        CancellationToken::new(),
    )
    .await;
    lock.release();
    result
}

/// Opens the store and runs every module until `shutdown_token` is cancelled, either by a signal
/// or by the caller. A journal that can't be read leaves the daemon up in degraded mode.
async fn run_daemon(
    paths: &AppPaths,
    config_path: PathBuf,
    config: TrackerConfig,
    probe: Box<dyn WindowProbe>,
    clock: impl Clock + Clone,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let config = Arc::new(config);

    match JournalStore::open(&paths.store_dir()).await {
        Ok(mut store) => {
            for session in recover_open_session(&mut store).await? {
                info!(session_id = %session.id, "Closed session left open by the previous run");
            }
            let machine = SessionMachine::new(store, config.clone(), Box::new(clock.clone()));
            run_modules(paths, config_path, config, machine, probe, clock, shutdown_token).await
        }
        Err(TrackerError::Corrupted(reason)) => {
            error!("Journal is unreadable, only serving status: {reason}");
            let machine = SessionMachine::new(
                UnreadableStore::new(reason.clone()),
                config.clone(),
                Box::new(clock.clone()),
            )
            .degraded(reason);
            run_modules(paths, config_path, config, machine, probe, clock, shutdown_token).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_modules<S: Store>(
    paths: &AppPaths,
    config_path: PathBuf,
    config: Arc<TrackerConfig>,
    machine: SessionMachine<S>,
    probe: Box<dyn WindowProbe>,
    clock: impl Clock + Clone,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let (config_sender, config_receiver) = watch::channel(config.clone());

    let classifier = Arc::new(RuleClassifier::new(config.rules.clone()));
    let (sender, receiver) = mpsc::channel(ENGINE_QUEUE_SIZE);
    let (engine, status) = Engine::new(
        machine,
        receiver,
        &sender,
        config_receiver.clone(),
        classifier,
    );

    let sampler = Sampler::new(
        sender.clone(),
        probe,
        shutdown_token.clone(),
        config_receiver,
        Box::new(clock),
    );
    let server = ControlServer::bind(
        paths.socket(),
        sender.clone(),
        status,
        shutdown_token.clone(),
    )?;

    let stop_token = shutdown_token.clone();
    let stop_engine = async move {
        stop_token.cancelled().await;
        if sender.send(EngineMessage::Shutdown).await.is_err() {
            debug!("Engine was already gone at shutdown");
        }
    };

    let engine_task = async {
        let mut run = pin!(engine.run());
        select! {
            result = &mut run => result,
            _ = shutdown_token.cancelled() => {
                let grace = config_sender.borrow().shutdown_grace();
                match tokio::time::timeout(grace, run).await {
                    Ok(result) => result,
                    Err(_) => {
                        error!("Engine didn't finish within {grace:?}, pending writes are lost");
                        Ok(())
                    }
                }
            }
        }
    };

    let (signal_result, sampler_result, server_result, engine_result, ()) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone(), &config_path, &config_sender),
        sampler.run(),
        server.run(),
        engine_task,
        stop_engine,
    );

    if let Err(signal_result) = signal_result {
        error!("Signal handling got an error {:?}", signal_result);
    }

    if let Err(sampler_result) = sampler_result {
        error!("Sampler got an error {:?}", sampler_result);
    }

    if let Err(server_result) = server_result {
        error!("Control server got an error {:?}", server_result);
    }

    if let Err(engine_result) = engine_result {
        error!("Engine got an error {:?}", engine_result);
    }

    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod daemon_tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;
    use tokio::sync::{mpsc, watch};
    use tokio_util::sync::CancellationToken;

    use crate::{
        control::{
            protocol::{Health, Reply, Request},
            ControlClient,
        },
        daemon::{
            block_on_bounded,
            collection::Sampler,
            config::TrackerConfig,
            run_daemon,
            storage::{
                entities::{EndReason, OutcomeType},
                journal::{JournalStore, JOURNAL_FILE},
                Store,
            },
        },
        error::ErrorKind,
        utils::{clock::testing::TestClock, dir::AppPaths, logging::TEST_LOGGING},
        window_api::{MockWindowProbe, WindowSample},
    };

    /// Drives a real daemon over its socket: ticks open a session, commands land in it, and
    /// cancellation ends it cleanly.
    #[tokio::test]
    async fn smoke_test_daemon() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = AppPaths::new(dir.path());

        let mut probe = MockWindowProbe::new();
        probe.expect_idle_time().returning(|| Ok(Duration::ZERO));
        probe.expect_sample().returning(|| {
            Ok(WindowSample {
                app_name: "/usr/bin/nvim".into(),
                window_title: "main.rs".into(),
                project_path: Some("/src/worktally".into()),
            })
        });

        let config = TrackerConfig {
            tick_interval_ms: 200,
            ..Default::default()
        };
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2018, 7, 4, 9, 0, 0).unwrap());
        let shutdown_token = CancellationToken::new();
        let client = ControlClient::new(paths.socket());

        let (daemon_result, session_id) = tokio::join!(
            run_daemon(
                &paths,
                paths.config_file(),
                config,
                Box::new(probe),
                clock,
                shutdown_token.clone(),
            ),
            async {
                tokio::time::sleep(Duration::from_millis(1100)).await;

                let Reply::Status(status) = client.call(&Request::Status).await? else {
                    anyhow::bail!("expected a status reply");
                };
                let session = status
                    .session
                    .ok_or_else(|| anyhow::anyhow!("ticks should have started a session"))?
                    .session;
                let open = status
                    .open_span
                    .ok_or_else(|| anyhow::anyhow!("a span should be open"))?;
                assert_eq!(open.app_name.as_ref(), "/usr/bin/nvim");

                let Reply::Session(started) = client.call(&Request::Start { project: None }).await?
                else {
                    anyhow::bail!("expected a session reply");
                };
                assert_eq!(started.id, session.id);

                let outcome = client
                    .call(&Request::SessionOutcome {
                        id: session.id.to_string(),
                        kind: OutcomeType::Commit,
                        reference: Some("abc123".into()),
                        description: "wire up the daemon".into(),
                    })
                    .await?;
                assert!(matches!(outcome, Reply::Outcome { created: true, .. }));

                tokio::time::sleep(Duration::from_millis(500)).await;
                shutdown_token.cancel();
                anyhow::Ok(session.id.to_string())
            }
        );
        daemon_result?;
        let session_id = session_id?;
        assert!(!paths.socket().exists());

        let store = JournalStore::open(&paths.store_dir()).await?;
        let session = store.session(&session_id).await?.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::Shutdown));
        let spans = store.session_spans(&session_id).await?;
        assert!(!spans.is_empty());
        assert!(spans.iter().all(|v| !v.is_open()));
        assert_eq!(store.session_outcomes(&session_id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_journal_keeps_status_available() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = AppPaths::new(dir.path());
        std::fs::create_dir_all(paths.store_dir())?;
        let journal = paths.store_dir().join(JOURNAL_FILE);
        let garbage = "not json at all\n{\"op\":\"upsert_session\"}\n";
        std::fs::write(&journal, garbage)?;

        let mut probe = MockWindowProbe::new();
        probe.expect_idle_time().returning(|| Ok(Duration::ZERO));
        probe.expect_sample().returning(|| {
            Ok(WindowSample {
                app_name: "/usr/bin/nvim".into(),
                window_title: "main.rs".into(),
                project_path: None,
            })
        });
        let config = TrackerConfig {
            tick_interval_ms: 100,
            ..Default::default()
        };
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2018, 7, 4, 9, 0, 0).unwrap());
        let shutdown_token = CancellationToken::new();
        let client = ControlClient::new(paths.socket());

        let (daemon_result, client_result) = tokio::join!(
            run_daemon(
                &paths,
                paths.config_file(),
                config,
                Box::new(probe),
                clock,
                shutdown_token.clone(),
            ),
            async {
                tokio::time::sleep(Duration::from_millis(400)).await;

                let Reply::Status(status) = client.call(&Request::Status).await? else {
                    anyhow::bail!("expected a status reply");
                };
                assert_eq!(status.health, Health::Degraded);
                assert!(status.degraded_reason.is_some());
                assert!(status.session.is_none());
                assert!(status.last_observation_at.is_some());

                let response = client.send(&Request::Start { project: None }).await?;
                assert!(!response.ok);
                assert_eq!(response.error.map(|v| v.kind), Some(ErrorKind::Corrupted));

                shutdown_token.cancel();
                anyhow::Ok(())
            }
        );
        daemon_result?;
        client_result?;
        assert!(!paths.socket().exists());
        // Nothing was written over the damaged journal.
        assert_eq!(std::fs::read_to_string(&journal)?, garbage);
        Ok(())
    }

    #[test]
    fn test_stuck_window_read_does_not_hold_up_exit() -> Result<()> {
        *TEST_LOGGING;
        let mut probe = MockWindowProbe::new();
        probe.expect_idle_time().returning(|| Ok(Duration::ZERO));
        probe.expect_sample().returning(|| {
            std::thread::sleep(Duration::from_secs(4));
            Ok(WindowSample {
                app_name: "/usr/bin/nvim".into(),
                window_title: "main.rs".into(),
                project_path: None,
            })
        });
        let config = Arc::new(TrackerConfig {
            tick_interval_ms: 20,
            probe_timeout_ms: 10,
            ..Default::default()
        });

        let started = Instant::now();
        block_on_bounded(
            async {
                let (sender, mut receiver) = mpsc::channel(64);
                let (_config_tx, config_rx) = watch::channel(config);
                let shutdown = CancellationToken::new();
                let clock =
                    TestClock::starting_at(Utc.with_ymd_and_hms(2018, 7, 4, 9, 0, 0).unwrap());
                let sampler = Sampler::new(
                    sender,
                    Box::new(probe),
                    shutdown.clone(),
                    config_rx,
                    Box::new(clock),
                );
                let drain = async { while receiver.recv().await.is_some() {} };
                let stop = async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    shutdown.cancel();
                };
                let (result, _, _) = tokio::join!(sampler.run(), drain, stop);
                result
            },
            Duration::from_millis(200),
        )??;

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "exit took {:?}",
            started.elapsed()
        );
        Ok(())
    }
}
