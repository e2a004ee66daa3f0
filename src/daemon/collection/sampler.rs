use std::{
    sync::{Arc, Mutex, TryLockError},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    daemon::{config::TrackerConfig, storage::entities::SpanContext, tracking::EngineMessage},
    utils::clock::Clock,
    window_api::{WindowProbe, WindowSample},
};

use super::{Activity, IdleDetector, Observation};

type SharedProbe = Arc<Mutex<Box<dyn WindowProbe>>>;

struct ProbeReading {
    sample: Result<WindowSample>,
    idle_time: Option<Duration>,
}

/// Periodic producer of [Observation]s. Ticks are scheduled against the previous tick's target
/// time, so slow probes don't make the schedule drift.
pub struct Sampler {
    next: mpsc::Sender<EngineMessage>,
    probe: SharedProbe,
    shutdown: CancellationToken,
    config: watch::Receiver<Arc<TrackerConfig>>,
    idle: IdleDetector,
    clock: Box<dyn Clock>,
}

impl Sampler {
    pub fn new(
        next: mpsc::Sender<EngineMessage>,
        probe: Box<dyn WindowProbe>,
        shutdown: CancellationToken,
        config: watch::Receiver<Arc<TrackerConfig>>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let idle = IdleDetector::new(config.borrow().idle_threshold());
        Self {
            next,
            probe: Arc::new(Mutex::new(probe)),
            shutdown,
            config,
            idle,
            clock,
        }
    }

    /// Runs the probe off the async threads. A probe that is still busy from an earlier tick is
    /// not called again, the tick just comes back empty. A panic in an earlier read leaves it usable.
    async fn read_probe(&self, timeout: Duration) -> Result<ProbeReading> {
        let probe = self.probe.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut probe = match probe.try_lock() {
                Ok(probe) => probe,
                Err(TryLockError::WouldBlock) => bail!("Previous probe call is still running"),
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("Previous window read panicked, reusing the source");
                    let guard = poisoned.into_inner();
                    probe.clear_poison();
                    guard
                }
            };
            let sample = probe.sample();
            let idle_time = probe
                .idle_time()
                .inspect_err(|e| debug!("Input idle time unavailable {e:?}"))
                .ok();
            Ok(ProbeReading { sample, idle_time })
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.context("Probe task failed")?,
            Err(_) => bail!("Probe didn't answer within {timeout:?}"),
        }
    }

    async fn tick(&mut self, config: &TrackerConfig) -> Observation {
        let captured_at = self.clock.time();

        let (activity, input_idle) = match self.read_probe(config.probe_timeout()).await {
            Ok(ProbeReading { sample, idle_time }) => {
                let activity = match sample {
                    Ok(sample) if config.is_excluded(&sample.app_name) => Activity::Excluded,
                    Ok(sample) => Activity::Tracked(SpanContext {
                        app_name: sample.app_name,
                        window_title: sample.window_title,
                        project_path: sample.project_path,
                    }),
                    Err(e) => {
                        warn!("Window probe failed {e:?}");
                        Activity::Unknown
                    }
                };
                (activity, idle_time)
            }
            Err(e) => {
                warn!("Window probe unavailable {e:?}");
                (Activity::Unknown, None)
            }
        };

        let last_signal_at = self.idle.observe(captured_at, &activity, input_idle);
        Observation {
            captured_at,
            is_idle_signal: self.idle.is_idle(captured_at, last_signal_at),
            activity,
            last_signal_at,
        }
    }

    /// Executes the sampler event loop.
    pub async fn run(mut self) -> Result<()> {
        let mut config = self.config.borrow_and_update().clone();
        let mut collection_point = self.clock.instant();
        loop {
            if self.config.has_changed().unwrap_or(false) {
                config = self.config.borrow_and_update().clone();
                self.idle.set_threshold(config.idle_threshold());
                info!("Sampler picked up new configuration");
            }
            collection_point += config.tick_interval();

            let observation = self.tick(&config).await;
            debug!("Sending observation {observation:?}");
            if self.next.send(EngineMessage::Observe(observation)).await.is_err() {
                info!("Engine is gone, stopping the sampler");
                return Ok(());
            }

            // After a suspension don't replay every missed tick, carry on from now.
            let now = self.clock.instant();
            if collection_point < now {
                debug!("Sampler fell behind by {:?}", now - collection_point);
                collection_point = now;
            }

            tokio::select! {
                // Cancellation means no further ticks. The engine seals whatever is open when it
                // receives the shutdown message.
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                _ = self.clock.sleep_until(collection_point) => ()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::{anyhow, Result};
    use chrono::{TimeZone, Utc};
    use tokio::sync::{mpsc, watch};
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{
            collection::Activity, config::TrackerConfig, tracking::EngineMessage,
        },
        utils::{clock::testing::TestClock, logging::TEST_LOGGING},
        window_api::{MockWindowProbe, WindowProbe, WindowSample},
    };

    use super::Sampler;

    fn sample(app: &str, title: &str) -> WindowSample {
        WindowSample {
            app_name: app.into(),
            window_title: title.into(),
            project_path: None,
        }
    }

    async fn collect(
        probe: Box<dyn WindowProbe>,
        config: TrackerConfig,
        run_for: Duration,
    ) -> Result<Vec<crate::daemon::collection::Observation>> {
        let (sender, mut receiver) = mpsc::channel(64);
        let (_config_tx, config_rx) = watch::channel(Arc::new(config));
        let shutdown = CancellationToken::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap());
        let sampler = Sampler::new(
            sender,
            probe,
            shutdown.clone(),
            config_rx,
            Box::new(clock),
        );

        let (result, _) = tokio::join!(sampler.run(), async {
            tokio::time::sleep(run_for).await;
            shutdown.cancel();
        });
        result?;

        let mut observations = vec![];
        while let Ok(message) = receiver.try_recv() {
            if let EngineMessage::Observe(observation) = message {
                observations.push(observation);
            }
        }
        Ok(observations)
    }

    #[tokio::test]
    async fn test_failures_and_exclusions_still_produce_ticks() -> Result<()> {
        *TEST_LOGGING;
        let mut probe = MockWindowProbe::new();
        let mut step = 0;
        probe.expect_sample().returning(move || {
            step += 1;
            match step % 3 {
                1 => Ok(sample("/usr/bin/nvim", "main.rs")),
                2 => Ok(sample("/usr/bin/keepassxc", "Passwords.kdbx")),
                _ => Err(anyhow!("no active window")),
            }
        });
        probe
            .expect_idle_time()
            .returning(|| Ok(Duration::from_millis(0)));

        let config = TrackerConfig {
            tick_interval_ms: 20,
            excluded_apps: vec!["keepassxc".into()],
            ..Default::default()
        };
        let observations = collect(Box::new(probe), config, Duration::from_millis(150)).await?;

        assert!(observations.len() >= 3, "got {observations:?}");
        assert!(matches!(observations[0].activity, Activity::Tracked(_)));
        assert_eq!(observations[1].activity, Activity::Excluded);
        assert_eq!(observations[2].activity, Activity::Unknown);
        assert!(observations
            .windows(2)
            .all(|v| v[0].captured_at <= v[1].captured_at));
        assert!(observations.iter().all(|v| !v.is_idle_signal));
        Ok(())
    }

    /// Panics on its first sample, like a backend hitting a broken display connection once.
    struct FlakyWindow {
        calls: usize,
    }

    impl WindowProbe for FlakyWindow {
        fn sample(&mut self) -> Result<WindowSample> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("display connection went away");
            }
            Ok(sample("/usr/bin/nvim", "main.rs"))
        }

        fn idle_time(&mut self) -> Result<Duration> {
            Ok(Duration::ZERO)
        }
    }

    #[tokio::test]
    async fn test_sampling_recovers_after_window_read_panic() -> Result<()> {
        *TEST_LOGGING;
        let config = TrackerConfig {
            tick_interval_ms: 20,
            ..Default::default()
        };
        let observations = collect(
            Box::new(FlakyWindow { calls: 0 }),
            config,
            Duration::from_millis(150),
        )
        .await?;

        assert!(observations.len() >= 3, "got {observations:?}");
        assert_eq!(observations[0].activity, Activity::Unknown);
        assert!(observations[1..]
            .iter()
            .all(|v| matches!(v.activity, Activity::Tracked(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_stuck_probe_is_not_called_concurrently() -> Result<()> {
        *TEST_LOGGING;
        let mut probe = MockWindowProbe::new();
        probe.expect_sample().times(1).returning(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(sample("/usr/bin/nvim", "main.rs"))
        });
        probe
            .expect_idle_time()
            .returning(|| Ok(Duration::from_millis(0)));

        let config = TrackerConfig {
            tick_interval_ms: 20,
            probe_timeout_ms: 10,
            ..Default::default()
        };
        let observations = collect(Box::new(probe), config, Duration::from_millis(120)).await?;

        assert!(observations.len() >= 2);
        assert!(observations.iter().all(|v| v.activity == Activity::Unknown));
        Ok(())
    }
}
