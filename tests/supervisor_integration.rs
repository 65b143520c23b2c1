//! Supervisor tests against the real interception-proxy binary.
//!
//! The proxy serves `GET /ping`, so it doubles as a well-behaved supervised
//! service: spawnable with `--port <n>`, health-checkable, killable.

use std::time::Duration;

use prism_core::supervisor::state_machine::State;
use prism_core::supervisor::{ServiceSpec, ServiceSupervisor, SupervisorConfig};

fn proxy_spec(name: &str, port_range: (u16, u16)) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        program: env!("CARGO_BIN_EXE_prism-proxy").to_string(),
        args: Vec::new(),
        working_dir: ".".to_string(),
        health_path: "/ping".to_string(),
        port_range,
        env: Vec::new(),
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        settle_delay: Duration::from_millis(200),
        start_timeout: Duration::from_secs(10),
        probe_retry_delay: Duration::from_millis(200),
        health_interval: Duration::from_secs(1),
        health_timeout: Duration::from_secs(2),
        max_restart_attempts: 3,
        restart_backoff: Duration::from_millis(100),
    }
}

async fn wait_until_available(sup: &ServiceSupervisor, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if sup.is_available().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[cfg(unix)]
async fn wait_until_state(sup: &ServiceSupervisor, want: State, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if sup.status().await.state == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[cfg(unix)]
fn kill_hard(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_ensure_available_then_stop() {
    let sup = ServiceSupervisor::new(proxy_spec("proxy-a", (42500, 42520)), fast_config());

    assert!(sup.ensure_available().await.unwrap());
    // ensure_available() true implies is_available() true.
    assert!(sup.is_available().await);

    let status = sup.status().await;
    assert_eq!(status.state, State::Running);
    assert!(status.port.is_some());
    assert!(status.pid.is_some());
    assert_eq!(status.restart_count, 0);

    // Idempotent while healthy: answers true without a second spawn.
    let pid_before = status.pid;
    assert!(sup.ensure_available().await.unwrap());
    assert_eq!(sup.status().await.pid, pid_before);

    sup.stop().await;
    let status = sup.status().await;
    assert_eq!(status.state, State::Stopped);
    assert_eq!(status.port, None);
    assert_eq!(status.pid, None);
    assert!(!sup.is_available().await);
}

#[tokio::test]
async fn test_start_refuses_while_process_attached() {
    let sup = ServiceSupervisor::new(proxy_spec("proxy-b", (42520, 42540)), fast_config());
    assert!(sup.ensure_available().await.unwrap());

    // A second explicit start against a live handle is a refused no-op.
    assert!(!sup.start(42539).await.unwrap());
    assert!(sup.is_available().await);

    sup.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_restart_after_external_kill() {
    let sup = ServiceSupervisor::new(proxy_spec("proxy-c", (42540, 42560)), fast_config());
    assert!(sup.ensure_available().await.unwrap());

    let pid = sup.status().await.pid.unwrap();
    kill_hard(pid);

    // The exit watcher must notice the crash and bring the service back,
    // possibly on a different port. The first healthy probe can land while
    // the relaunch is still mid-verification, so poll for the committed
    // state rather than asserting right after availability flips.
    assert!(
        wait_until_available(&sup, Duration::from_secs(15)).await,
        "service did not come back after external kill"
    );
    assert!(
        wait_until_state(&sup, State::Running, Duration::from_secs(10)).await,
        "restarted service never committed to running"
    );
    let status = sup.status().await;
    assert!(status.restart_count >= 1);
    assert_ne!(status.pid, Some(pid));

    sup.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_during_restart_backoff_wins() {
    // Long backoff so the deliberate stop reliably lands inside the
    // restart cycle's sleep.
    let mut config = fast_config();
    config.restart_backoff = Duration::from_millis(1500);
    let sup = ServiceSupervisor::new(proxy_spec("proxy-f", (42600, 42620)), config);
    assert!(sup.ensure_available().await.unwrap());

    kill_hard(sup.status().await.pid.unwrap());

    // Exit watcher fires almost immediately; the stop arrives mid-backoff.
    tokio::time::sleep(Duration::from_millis(500)).await;
    sup.stop().await;

    // The aborted cycle must not bring anything back.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let status = sup.status().await;
    assert_eq!(status.state, State::Stopped);
    assert_eq!(status.pid, None);
    assert_eq!(status.restart_count, 0);
    assert!(!sup.is_available().await);
}

#[tokio::test]
async fn test_stop_suppresses_restart() {
    let sup = ServiceSupervisor::new(proxy_spec("proxy-d", (42560, 42580)), fast_config());
    assert!(sup.ensure_available().await.unwrap());

    sup.stop().await;

    // Well past the health interval plus backoff: nothing may come back.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = sup.status().await;
    assert_eq!(status.state, State::Stopped);
    assert_eq!(status.restart_count, 0);
    assert!(!sup.is_available().await);
}

#[tokio::test]
async fn test_recent_output_empty_without_process() {
    let sup = ServiceSupervisor::new(proxy_spec("proxy-e", (42580, 42600)), fast_config());
    assert!(sup.recent_output(10).await.is_empty());
}
