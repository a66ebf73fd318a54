use core::str::FromStr as _;
use core::time::Duration;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use httpdump::handler::{HandlerConfig, Level};
use httpdump::DumpCfg;
use tokio::runtime;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Capture and dump HTTP traffic from a live interface or a pcap file.
#[derive(Debug, Parser)]
#[command(name = "httpdump", version, about)]
struct Cli {
    /// Output level: l0 (first line), url, header, or all (headers and
    /// textual body)
    #[arg(long, default_value = "header", value_parser = Level::from_str)]
    level: Level,

    /// Interface name or pcap file; `any` captures on all interfaces
    #[arg(short = 'i', long = "interface", default_value = "any")]
    input: String,

    /// Only process packets with this source or destination ip
    #[arg(long)]
    ip: Option<std::net::IpAddr>,

    /// Only process packets with this source or destination port
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Per-stream buffer depth, in tcp segments
    #[arg(long = "chan", default_value_t = 10240)]
    chan_size: usize,

    /// Output channel depth, in records
    #[arg(long = "out-chan", default_value_t = 40960)]
    out_chan_size: usize,

    /// Filter by request host, wildcard match with * and ?
    #[arg(long)]
    host: Option<String>,

    /// Filter by request uri path, wildcard match with * and ?
    #[arg(long)]
    uri: Option<String>,

    /// Filter by request method, multiple separated by comma
    #[arg(long)]
    method: Option<String>,

    /// Print responses too
    #[arg(long)]
    resp: bool,

    /// Filter by response status code; ranges allowed, e.g. 200,300-400
    #[arg(long)]
    status: Option<String>,

    /// Print bodies even when the content type doesn't look like text
    #[arg(long)]
    force: bool,

    /// Fast mode: process requests and responses separately
    #[arg(long)]
    fast: bool,

    /// Write records to this file instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Idle time before an inactive connection is dropped
    #[arg(long, value_parser = humantime::parse_duration, default_value = "4m")]
    idle: Duration,
}

impl Cli {
    fn into_cfg(self) -> anyhow::Result<DumpCfg> {
        let status = match self.status.as_deref() {
            Some(expr) => expr.parse().context("bad --status value")?,
            None => Default::default(),
        };

        let handler_cfg = HandlerConfig {
            level: self.level,
            host_pattern: self.host,
            uri_pattern: self.uri,
            methods: self.method,
            print_responses: self.resp,
            status,
            force_body: self.force,
        };

        Ok(DumpCfg {
            input: self.input,
            handler_cfg,
            filter_ip: self.ip,
            filter_port: (self.port != 0).then_some(self.port),
            chan_size: self.chan_size,
            out_chan_size: self.out_chan_size,
            fast: self.fast,
            output: self.output,
            idle: self.idle,
        })
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logger();

    let cfg = cli.into_cfg()?;

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    let result = rt.block_on(httpdump::dump(cfg, stop_signal()));

    rt.shutdown_timeout(Duration::from_secs(1));

    result
}

/// Records go to stdout; logs go to stderr so the two never interleave.
fn setup_logger() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves once the user asks the dump to stop: SIGINT or SIGTERM on unix,
/// ctrl-c elsewhere. If no handler can be installed the dump simply runs
/// until its source is exhausted.
#[cfg(unix)]
async fn stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(error), _) | (_, Err(error)) => {
            warn!(%error, "Couldn't install signal handlers, stop with the packet source instead");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => debug!("SIGINT received"),
        _ = terminate.recv() => debug!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn stop_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Couldn't listen for ctrl-c, stop with the packet source instead");
        std::future::pending::<()>().await;
    }
}
