//! Lifecycle supervision for auxiliary local services.
//!
//! A `ServiceSupervisor` owns exactly one externally-specified executable:
//! it allocates a free port, spawns the child with `--port <n>`, verifies
//! health, keeps a recurring health check running, and restarts the service
//! on unexpected exit or missed health checks. Deliberate `stop()` calls are
//! distinguished from crashes by the `stop_requested` flag.
//!
//! Background work is modelled as explicit cancellable tasks (one recurring
//! health check, one task awaiting process exit) sharing a single
//! lock-guarded state object. `start()` is a no-op while a process handle is
//! attached, so racing restart requests collapse into one.

pub mod error;
pub mod managed_process;
pub mod state_machine;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ServiceConfig, SupervisorTimings};
use crate::health::HealthProbe;
use crate::ports;
use error::SupervisorError;
use managed_process::ManagedProcess;
use state_machine::{State, StateMachine};

/// Launch description for one supervised service, supplied by the host
/// collaborator. The assigned port is appended as `--port <n>`.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: String,
    pub health_path: String,
    pub port_range: (u16, u16),
    pub env: Vec<(String, String)>,
}

impl ServiceSpec {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir.clone(),
            health_path: cfg.health_path.clone(),
            port_range: cfg.port_range,
            env: Vec::new(),
        }
    }
}

/// Timing and restart policy knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay after spawn before the first health probe.
    pub settle_delay: Duration,
    /// Total budget for the service to become healthy after a start.
    pub start_timeout: Duration,
    /// Delay between health probes during startup verification.
    pub probe_retry_delay: Duration,
    /// Interval of the recurring health check while running.
    pub health_interval: Duration,
    /// Per-probe timeout.
    pub health_timeout: Duration,
    /// Consecutive automatic restart attempts before the service is marked
    /// degraded. An explicit `ensure_available()` resets the breaker.
    pub max_restart_attempts: u32,
    /// Base delay of the exponential restart backoff.
    pub restart_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_timings(&SupervisorTimings::default())
    }
}

impl SupervisorConfig {
    pub fn from_timings(t: &SupervisorTimings) -> Self {
        Self {
            settle_delay: t.settle_delay(),
            start_timeout: t.start_timeout(),
            probe_retry_delay: Duration::from_millis(500),
            health_interval: t.health_interval(),
            health_timeout: t.health_timeout(),
            max_restart_attempts: t.max_restart_attempts,
            restart_backoff: t.restart_backoff(),
        }
    }
}

/// Point-in-time snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: State,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

struct ServiceState {
    port: Option<u16>,
    process: Option<ManagedProcess>,
    machine: StateMachine,
    restart_count: u32,
    consecutive_failures: u32,
    stop_requested: bool,
    /// Bumped by every deliberate `stop()`. An in-flight restart cycle
    /// captures the value on entry and aborts once it no longer matches.
    stop_epoch: u64,
    tasks: Option<CancellationToken>,
}

struct Inner {
    spec: ServiceSpec,
    config: SupervisorConfig,
    probe: HealthProbe,
    state: Mutex<ServiceState>,
}

#[derive(Clone)]
pub struct ServiceSupervisor {
    inner: Arc<Inner>,
}

impl ServiceSupervisor {
    pub fn new(spec: ServiceSpec, config: SupervisorConfig) -> Self {
        let probe = HealthProbe::new(config.health_timeout);
        Self {
            inner: Arc::new(Inner {
                spec,
                config,
                probe,
                state: Mutex::new(ServiceState {
                    port: None,
                    process: None,
                    machine: StateMachine::new(),
                    restart_count: 0,
                    consecutive_failures: 0,
                    stop_requested: false,
                    stop_epoch: 0,
                    tasks: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Start the service on `port` and verify health.
    ///
    /// Returns `Ok(false)` when a process handle is already attached, when
    /// the spawn fails, or when the service does not become healthy within
    /// the start timeout (in which case it is stopped again). Only a healthy
    /// service yields `Ok(true)`.
    pub async fn start(&self, port: u16) -> anyhow::Result<bool> {
        let spec = &self.inner.spec;
        let exit_rx;
        {
            let mut st = self.inner.state.lock().await;
            if st.process.is_some() {
                tracing::warn!(
                    "Service '{}' already has a live process handle, ignoring start",
                    spec.name
                );
                return Ok(false);
            }
            st.stop_requested = false;

            let mut args = spec.args.clone();
            args.push("--port".to_string());
            args.push(port.to_string());

            let process = match ManagedProcess::spawn(
                &spec.program,
                &args,
                &spec.working_dir,
                &spec.env,
                &spec.name,
            )
            .await
            {
                Ok(p) => p,
                Err(e @ SupervisorError::SpawnFailed { .. }) => {
                    tracing::error!("{}", e);
                    st.machine.force(State::Stopped);
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };

            if st.machine.transition(State::Starting).is_err() {
                st.machine.force(State::Starting);
            }
            st.port = Some(port);
            exit_rx = process.exit_signal();
            st.process = Some(process);
        }

        // Let the child settle, then poll health until the start timeout.
        tokio::time::sleep(self.inner.config.settle_delay).await;
        let deadline = Instant::now() + self.inner.config.start_timeout;
        let mut healthy = false;
        loop {
            if self.inner.probe.check(port, &spec.health_path).await {
                healthy = true;
                break;
            }
            if Instant::now() >= deadline || !*exit_rx.borrow() {
                break;
            }
            tokio::time::sleep(self.inner.config.probe_retry_delay).await;
        }

        if !healthy {
            tracing::warn!(
                "{} (port {})",
                SupervisorError::HealthTimeout(spec.name.clone()),
                port
            );
            self.teardown().await;
            return Ok(false);
        }

        {
            let mut st = self.inner.state.lock().await;
            // A deliberate stop may have raced in while we were probing.
            if st.stop_requested || st.process.is_none() {
                return Ok(false);
            }
            if st.machine.transition(State::Running).is_err() {
                st.machine.force(State::Running);
            }
            st.consecutive_failures = 0;
            let token = CancellationToken::new();
            st.tasks = Some(token.clone());
            drop(st);
            self.spawn_health_task(token.clone());
            self.spawn_exit_watcher(exit_rx, token);
        }

        tracing::info!("Service '{}' is healthy on port {}", spec.name, port);
        Ok(true)
    }

    /// `true` only if a port is assigned and the health probe succeeds.
    /// A missing port assignment is `false` without a network call.
    pub async fn is_available(&self) -> bool {
        let port = {
            let st = self.inner.state.lock().await;
            st.port
        };
        match port {
            Some(p) => self.inner.probe.check(p, &self.inner.spec.health_path).await,
            None => false,
        }
    }

    /// Idempotent availability guarantee: answers `true` immediately when
    /// healthy, otherwise allocates a port and starts the service. Also
    /// resets the degraded-restart breaker, since an explicit call is the
    /// operator's way of asking for another try.
    pub async fn ensure_available(&self) -> anyhow::Result<bool> {
        if self.is_available().await {
            return Ok(true);
        }
        let port = {
            let mut st = self.inner.state.lock().await;
            if st.machine.state == State::Degraded {
                st.consecutive_failures = 0;
            }
            match st.port {
                Some(p) => p,
                None => {
                    let (start, end) = self.inner.spec.port_range;
                    ports::find_free_port(start, end)
                }
            }
        };
        self.start(port).await
    }

    /// Deliberate shutdown: cancels the background tasks, terminates the
    /// child, clears the handle and port assignment. No automatic restart
    /// fires afterwards; an in-flight restart cycle sees the epoch bump and
    /// aborts, even from inside its backoff sleep.
    pub async fn stop(&self) {
        {
            let mut st = self.inner.state.lock().await;
            st.stop_requested = true;
            st.stop_epoch += 1;
        }
        self.teardown().await;
    }

    /// Terminate the child and cancel the background tasks without touching
    /// the stop markers. Shared by `stop()` and the restart cycle.
    async fn teardown(&self) {
        let proc = {
            let mut st = self.inner.state.lock().await;
            if let Some(token) = st.tasks.take() {
                token.cancel();
            }
            st.port = None;
            if st.machine.state != State::Stopped {
                st.machine.force(State::Stopping);
            }
            st.process.take()
        };

        if let Some(proc) = proc {
            if proc.is_running() {
                if let Err(e) = proc.terminate(false) {
                    tracing::warn!("Failed to signal '{}': {}", self.inner.spec.name, e);
                }
                if !proc.wait_for_exit(Duration::from_secs(3)).await {
                    tracing::warn!(
                        "Service '{}' ignored SIGTERM, escalating",
                        self.inner.spec.name
                    );
                    let _ = proc.terminate(true);
                    proc.wait_for_exit(Duration::from_secs(2)).await;
                }
            }
        }

        let mut st = self.inner.state.lock().await;
        st.machine.force(State::Stopped);
        tracing::info!("Service '{}' stopped", self.inner.spec.name);
    }

    pub async fn status(&self) -> ServiceStatus {
        let st = self.inner.state.lock().await;
        ServiceStatus {
            name: self.inner.spec.name.clone(),
            state: st.machine.state,
            port: st.port,
            pid: st.process.as_ref().map(|p| p.pid),
            restart_count: st.restart_count,
        }
    }

    /// Most recent captured console lines of the live child, newest last.
    pub async fn recent_output(&self, count: usize) -> Vec<String> {
        let st = self.inner.state.lock().await;
        match st.process.as_ref() {
            Some(p) => p.recent_output(count).await,
            None => Vec::new(),
        }
    }

    // ── Background tasks ─────────────────────────────────────

    /// Recurring health check. A failed probe while `stop_requested` is
    /// false is treated as a crash: full stop-then-restart on a fresh port.
    fn spawn_health_task(&self, token: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(this.inner.config.health_interval) => {}
                }

                let (port, stop_requested) = {
                    let st = this.inner.state.lock().await;
                    (st.port, st.stop_requested)
                };
                if stop_requested {
                    return;
                }
                let Some(port) = port else { return };

                if this.inner.probe.check(port, &this.inner.spec.health_path).await {
                    let mut st = this.inner.state.lock().await;
                    st.consecutive_failures = 0;
                    continue;
                }

                tracing::warn!(
                    "Service '{}' missed a health check, treating as crash",
                    this.inner.spec.name
                );
                {
                    let mut st = this.inner.state.lock().await;
                    if st.stop_requested {
                        return;
                    }
                    st.machine.force(State::Unhealthy);
                }
                this.restart().await;
                // A successful restart spawned fresh tasks under a new token.
                return;
            }
        });
    }

    /// Waits for the OS to report child exit. A termination that was not
    /// requested is a crash: clear state and re-establish availability.
    fn spawn_exit_watcher(
        &self,
        mut exit_rx: tokio::sync::watch::Receiver<bool>,
        token: CancellationToken,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                res = exit_rx.wait_for(|running| !*running) => {
                    if res.is_err() {
                        return;
                    }
                }
            }

            {
                let mut st = this.inner.state.lock().await;
                if st.stop_requested {
                    return;
                }
                tracing::warn!(
                    "Service '{}' terminated unexpectedly",
                    this.inner.spec.name
                );
                st.process = None;
                st.port = None;
                st.machine.force(State::Unhealthy);
                if let Some(t) = st.tasks.take() {
                    t.cancel();
                }
            }
            this.restart().await;
        });
    }

    /// Stop-then-start cycle on a fresh port with exponential backoff and a
    /// consecutive-attempt ceiling. Exceeding the ceiling marks the service
    /// degraded instead of retrying forever. A deliberate `stop()` at any
    /// point, including during the backoff sleep, bumps the stop epoch and
    /// aborts the cycle.
    async fn restart(&self) {
        let epoch = {
            let st = self.inner.state.lock().await;
            if st.stop_requested {
                return;
            }
            st.stop_epoch
        };

        loop {
            let failures = {
                let st = self.inner.state.lock().await;
                if st.stop_requested || st.stop_epoch != epoch {
                    return;
                }
                st.consecutive_failures
            };

            if failures >= self.inner.config.max_restart_attempts {
                let mut st = self.inner.state.lock().await;
                st.machine.force(State::Degraded);
                tracing::error!(
                    "Service '{}' failed {} consecutive restarts, marking degraded",
                    self.inner.spec.name,
                    failures
                );
                return;
            }

            let backoff = self
                .inner
                .config
                .restart_backoff
                .saturating_mul(2u32.saturating_pow(failures.min(6)))
                .min(Duration::from_secs(30));
            tokio::time::sleep(backoff).await;

            self.teardown().await;
            {
                let mut st = self.inner.state.lock().await;
                // A deliberate stop may have landed during the backoff sleep
                // or the teardown.
                if st.stop_requested || st.stop_epoch != epoch {
                    return;
                }
                st.consecutive_failures += 1;
                st.restart_count += 1;
                st.machine.force(State::Restarting);
            }

            let (start, end) = self.inner.spec.port_range;
            let port = ports::find_free_port(start, end);
            match self.start(port).await {
                Ok(true) => {
                    let stale = {
                        let st = self.inner.state.lock().await;
                        st.stop_epoch != epoch
                    };
                    if stale {
                        // stop() raced with the relaunch; honor it.
                        self.teardown().await;
                        return;
                    }
                    tracing::info!(
                        "Service '{}' restarted on port {}",
                        self.inner.spec.name,
                        port
                    );
                    return;
                }
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(
                        "Restart of '{}' errored: {}",
                        self.inner.spec.name,
                        e
                    );
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            settle_delay: Duration::from_millis(50),
            start_timeout: Duration::from_millis(800),
            probe_retry_delay: Duration::from_millis(100),
            health_interval: Duration::from_millis(500),
            health_timeout: Duration::from_millis(500),
            max_restart_attempts: 2,
            restart_backoff: Duration::from_millis(50),
        }
    }

    fn ghost_spec() -> ServiceSpec {
        ServiceSpec {
            name: "ghost".to_string(),
            program: "/nonexistent/definitely-not-here".to_string(),
            args: Vec::new(),
            working_dir: ".".to_string(),
            health_path: "/ping".to_string(),
            port_range: (43000, 43100),
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_not_available_without_port() {
        let sup = ServiceSupervisor::new(ghost_spec(), fast_config());
        // No port assigned → false without any network call.
        assert!(!sup.is_available().await);
        let status = sup.status().await;
        assert_eq!(status.state, State::Stopped);
        assert_eq!(status.port, None);
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_false() {
        let sup = ServiceSupervisor::new(ghost_spec(), fast_config());
        let started = sup.start(43050).await.unwrap();
        assert!(!started);
        assert_eq!(sup.status().await.state, State::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unhealthy_start_is_stopped_again() {
        // A process that runs but never answers health checks must be torn
        // down by the failed start.
        let spec = ServiceSpec {
            name: "mute".to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            working_dir: ".".to_string(),
            health_path: "/ping".to_string(),
            port_range: (43100, 43200),
            env: Vec::new(),
        };
        let sup = ServiceSupervisor::new(spec, fast_config());
        let started = sup.ensure_available().await.unwrap();
        assert!(!started);
        let status = sup.status().await;
        assert_eq!(status.state, State::Stopped);
        assert_eq!(status.pid, None);
        assert!(!sup.is_available().await);
    }

    #[tokio::test]
    async fn test_status_snapshot_serializes() {
        let sup = ServiceSupervisor::new(ghost_spec(), fast_config());
        let status = sup.status().await;
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["name"], "ghost");
    }
}
