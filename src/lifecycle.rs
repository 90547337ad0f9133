//! # Lifecycle Controller
//!
//! Startup bookkeeping and the ordered teardown of every long-running
//! service.
//!
//! ```text
//! Starting ──mark_running()──► Running ──shutdown()──► Stopping (terminal)
//!     └──────────────────shutdown()──────────────────────┘
//! ```
//!
//! ## Shutdown Order
//!
//! Each step is best-effort: failures are logged and the sequence carries on.
//!
//! 1. Release the external port-forwarding reservation
//! 2. Fire the quit token (exactly once)
//! 3. Disconnect from the discovery service
//! 4. Stop accepting intercom connections
//! 5. Stop the inbound protocol server
//! 6. Grace sleep for in-flight handlers
//! 7. Join every registered service task
//!
//! A second `shutdown` after the first has begun is a no-op.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Stopping,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Starting,
            1 => State::Running,
            _ => State::Stopping,
        }
    }
}

/// What the process should do once teardown completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownKind {
    Terminate,
    /// Re-execute the current binary with its original arguments.
    Restart,
}

/// Service-specific teardown steps, invoked in order by
/// [`Lifecycle::shutdown`].
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn release_port_mapping(&self) -> anyhow::Result<()>;
    async fn disconnect_discovery(&self) -> anyhow::Result<()>;
    async fn stop_intercom(&self) -> anyhow::Result<()>;
    async fn stop_protocol_server(&self) -> anyhow::Result<()>;
}

pub struct Lifecycle {
    quit: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    state: AtomicU8,
    grace: Duration,
}

impl Lifecycle {
    pub fn new(grace: Duration) -> Self {
        Self {
            quit: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            state: AtomicU8::new(State::Starting as u8),
            grace,
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Token fired once at shutdown step 2. Service loops select on it.
    pub fn quit_signal(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn mark_running(&self) {
        if self
            .state
            .compare_exchange(
                State::Starting as u8,
                State::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!("daemon running");
        }
    }

    /// Register a long-running service task with the join barrier.
    ///
    /// Returns `false`, without spawning, once shutdown has begun.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.state() == State::Stopping {
            warn!(task = name, "refusing to start service during shutdown");
            return false;
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                task.await;
                debug!(task = name, "service task exited");
            });
        debug!(task = name, "service task started");
        true
    }

    /// Run the ordered teardown. Returns `false` if shutdown had already
    /// begun.
    pub async fn shutdown(&self, parts: &dyn Teardown) -> bool {
        let previous = self.state.swap(State::Stopping as u8, Ordering::SeqCst);
        if State::from_u8(previous) == State::Stopping {
            debug!("shutdown already in progress");
            return false;
        }
        info!("shutting down");

        if let Err(e) = parts.release_port_mapping().await {
            warn!(error = %e, "failed to release port mapping");
        }

        self.quit.cancel();

        if let Err(e) = parts.disconnect_discovery().await {
            warn!(error = %e, "failed to disconnect from discovery service");
        }
        if let Err(e) = parts.stop_intercom().await {
            warn!(error = %e, "failed to stop intercom");
        }
        if let Err(e) = parts.stop_protocol_server().await {
            warn!(error = %e, "failed to stop protocol server");
        }

        tokio::time::sleep(self.grace).await;

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let mut joined = 0usize;
        while let Some(result) = tasks.join_next().await {
            joined += 1;
            if let Err(e) = result
                && e.is_panic()
            {
                warn!(error = %e, "service task panicked");
            }
        }
        info!(tasks = joined, "all services stopped");
        true
    }
}

/// Wait for SIGHUP (restart), SIGTERM, or Ctrl-C (terminate).
pub async fn wait_for_signal() -> anyhow::Result<ShutdownKind> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let kind = tokio::select! {
        _ = hangup.recv() => {
            info!("SIGHUP received, restarting");
            ShutdownKind::Restart
        }
        _ = terminate.recv() => {
            info!("SIGTERM received, stopping");
            ShutdownKind::Terminate
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping");
            ShutdownKind::Terminate
        }
    };
    Ok(kind)
}

/// Replace the process image with the current executable and its original
/// arguments. The environment is inherited. Only returns on failure.
pub fn reexec() -> anyhow::Error {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return anyhow::Error::new(e).context("failed to locate current executable"),
    };
    info!(exe = %exe.display(), "re-executing");
    let err = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    anyhow::Error::new(err).context(format!("failed to exec {}", exe.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        steps: Mutex<Vec<&'static str>>,
        fail_discovery: bool,
    }

    impl Recorder {
        fn push(&self, step: &'static str) {
            self.steps.lock().unwrap().push(step);
        }
    }

    #[async_trait]
    impl Teardown for Recorder {
        async fn release_port_mapping(&self) -> anyhow::Result<()> {
            self.push("port");
            Ok(())
        }
        async fn disconnect_discovery(&self) -> anyhow::Result<()> {
            self.push("discovery");
            if self.fail_discovery {
                anyhow::bail!("discovery unreachable");
            }
            Ok(())
        }
        async fn stop_intercom(&self) -> anyhow::Result<()> {
            self.push("intercom");
            Ok(())
        }
        async fn stop_protocol_server(&self) -> anyhow::Result<()> {
            self.push("server");
            Ok(())
        }
    }

    #[tokio::test]
    async fn teardown_runs_in_order() {
        let lifecycle = Lifecycle::new(Duration::from_millis(1));
        lifecycle.mark_running();
        let recorder = Recorder::default();

        assert!(lifecycle.shutdown(&recorder).await);
        assert_eq!(
            *recorder.steps.lock().unwrap(),
            vec!["port", "discovery", "intercom", "server"]
        );
        assert_eq!(lifecycle.state(), State::Stopping);
    }

    #[tokio::test]
    async fn failed_step_does_not_stop_sequence() {
        let lifecycle = Lifecycle::new(Duration::ZERO);
        let recorder = Recorder {
            fail_discovery: true,
            ..Default::default()
        };

        assert!(lifecycle.shutdown(&recorder).await);
        assert_eq!(recorder.steps.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn every_loop_observes_quit_and_is_joined() {
        let lifecycle = Lifecycle::new(Duration::from_millis(1));
        let exited = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let quit = lifecycle.quit_signal();
            let exited = exited.clone();
            assert!(lifecycle.spawn("loop", async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(5));
                loop {
                    tokio::select! {
                        _ = quit.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                }
                exited.fetch_add(1, Ordering::SeqCst);
            }));
        }
        lifecycle.mark_running();

        tokio::time::timeout(Duration::from_secs(2), lifecycle.shutdown(&Recorder::default()))
            .await
            .expect("shutdown did not complete");
        assert_eq!(exited.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn quit_fires_before_discovery_disconnect() {
        struct Probe {
            quit: CancellationToken,
            seen: Mutex<Option<bool>>,
        }

        #[async_trait]
        impl Teardown for Probe {
            async fn release_port_mapping(&self) -> anyhow::Result<()> {
                assert!(!self.quit.is_cancelled());
                Ok(())
            }
            async fn disconnect_discovery(&self) -> anyhow::Result<()> {
                *self.seen.lock().unwrap() = Some(self.quit.is_cancelled());
                Ok(())
            }
            async fn stop_intercom(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn stop_protocol_server(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let lifecycle = Lifecycle::new(Duration::ZERO);
        let probe = Probe {
            quit: lifecycle.quit_signal(),
            seen: Mutex::new(None),
        };
        lifecycle.shutdown(&probe).await;
        assert_eq!(*probe.seen.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn second_shutdown_is_noop() {
        let lifecycle = Lifecycle::new(Duration::ZERO);
        let recorder = Recorder::default();

        assert!(lifecycle.shutdown(&recorder).await);
        assert!(!lifecycle.shutdown(&recorder).await);
        assert_eq!(recorder.steps.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_refused() {
        let lifecycle = Lifecycle::new(Duration::ZERO);
        lifecycle.shutdown(&Recorder::default()).await;
        assert!(!lifecycle.spawn("late", async {}));
    }

    #[tokio::test]
    async fn mark_running_only_from_starting() {
        let lifecycle = Lifecycle::new(Duration::ZERO);
        assert_eq!(lifecycle.state(), State::Starting);
        lifecycle.mark_running();
        assert_eq!(lifecycle.state(), State::Running);
        lifecycle.shutdown(&Recorder::default()).await;
        lifecycle.mark_running();
        assert_eq!(lifecycle.state(), State::Stopping);
    }
}
