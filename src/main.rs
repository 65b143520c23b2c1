use anyhow::Context;
use prism_core::config::{GlobalConfig, PROXY_URL_ENV};
use prism_core::supervisor::{ServiceSpec, ServiceSupervisor, SupervisorConfig};

/// The interception proxy binary ships next to the daemon binary.
fn proxy_program() -> anyhow::Result<String> {
    let exe = std::env::current_exe().context("cannot resolve current executable")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    let name = format!("prism-proxy{}", std::env::consts::EXE_SUFFIX);
    Ok(dir.join(name).to_string_lossy().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("Core daemon starting");

    let cfg = GlobalConfig::load()?;
    let timings = SupervisorConfig::from_timings(&cfg.supervisor);

    let mut supervisors: Vec<ServiceSupervisor> = Vec::new();

    // The interception proxy is supervised exactly like any other service.
    let proxy_spec = ServiceSpec {
        name: "proxy".to_string(),
        program: proxy_program()?,
        args: Vec::new(),
        working_dir: ".".to_string(),
        health_path: "/ping".to_string(),
        port_range: cfg.proxy.port_range,
        env: Vec::new(),
    };
    supervisors.push(ServiceSupervisor::new(proxy_spec, timings.clone()));

    for svc in &cfg.service {
        supervisors.push(ServiceSupervisor::new(
            ServiceSpec::from_config(svc),
            timings.clone(),
        ));
    }

    for sup in &supervisors {
        match sup.ensure_available().await {
            Ok(true) => {
                let status = sup.status().await;
                tracing::info!(
                    "Service '{}' available on port {:?} (pid {:?})",
                    sup.name(),
                    status.port,
                    status.pid
                );
            }
            Ok(false) => {
                tracing::warn!(
                    "Service '{}' failed to start, caller may retry via ensure_available",
                    sup.name()
                );
            }
            Err(e) => tracing::error!("Service '{}' start errored: {}", sup.name(), e),
        }
    }

    // The host collaborator is responsible for pointing clients at the
    // proxy; we only surface its absence.
    if std::env::var(PROXY_URL_ENV).is_err() {
        tracing::warn!(
            "{} is not set, clients will talk to the provider directly",
            PROXY_URL_ENV
        );
    }

    // Graceful shutdown: Ctrl+C / SIGTERM stops every supervised child.
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, stopping supervised services");
    for sup in &supervisors {
        sup.stop().await;
    }

    tracing::info!("Core daemon shutting down");
    Ok(())
}
