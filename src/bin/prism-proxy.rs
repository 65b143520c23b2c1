//! Standalone interception proxy server.
//!
//! Launched by the supervisor with `--port <n>`; serves `/ping`,
//! `/v1/chat/completions`, and the catch-all pass-through with the default
//! logging transformer. Hosts embedding the library can serve the same
//! router with their own `RequestTransformer`.

use std::sync::Arc;

use prism_core::config::GlobalConfig;
use prism_core::ports;
use prism_core::proxy::exchange_log::ExchangeLogger;
use prism_core::proxy::transformer::LoggingTransformer;
use prism_core::proxy::{self, ProxyState};

/// Supervisor launch convention: `--port <n>` or `--port=<n>`.
fn port_from_args() -> Option<u16> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--port" {
            return args.next().and_then(|v| v.parse().ok());
        }
        if let Some(v) = arg.strip_prefix("--port=") {
            return v.parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = GlobalConfig::load()?;
    let port = port_from_args().unwrap_or_else(|| {
        let (start, end) = cfg.proxy.port_range;
        ports::find_free_port(start, end)
    });

    let logger = ExchangeLogger::new(cfg.log_dir());
    let transformer = Arc::new(LoggingTransformer::new(logger));
    let state = ProxyState::new(&cfg.proxy, transformer);

    proxy::serve(port, state).await
}
