//! Passive HTTP/1.x traffic dumper.
//!
//! Reads timestamped packets from a live interface or a pcap file,
//! reassembles bidirectional TCP byte streams, parses them as HTTP
//! exchanges and prints filtered, human-readable records. It never
//! originates or terminates connections.

#[macro_use]
extern crate tracing;

pub mod assembler;
pub mod capture;
pub mod filter;
pub mod handler;
pub mod http;
pub mod printer;
pub mod stream;
pub mod tcp;

use core::future::Future;
use core::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;

use crate::assembler::TcpAssembler;
use crate::capture::{CaptureFilter, PacketSource};
use crate::handler::{ConnectionHandler, FastConnectionHandler, HandlerConfig, HttpConnectionHandler};
use crate::printer::Printer;

/// Interval of the idle-eviction tick.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct DumpCfg {
    /// Interface name, `any`, or a `.pcap`/`.pcapng` file path.
    pub input: String,
    pub handler_cfg: HandlerConfig,
    pub filter_ip: Option<std::net::IpAddr>,
    pub filter_port: Option<u16>,
    /// Per-stream buffer depth.
    pub chan_size: usize,
    /// Output sink channel depth.
    pub out_chan_size: usize,
    /// Independent request/response consumers instead of paired ones.
    pub fast: bool,
    /// Output file; stdout when `None`.
    pub output: Option<PathBuf>,
    /// Idle time before a connection is evicted.
    pub idle: Duration,
}

/// Run the capture → assemble → parse → print pipeline until the source is
/// exhausted or `shutdown` resolves.
///
/// On shutdown every stream is closed, consumers drain to EOF and the sink
/// is flushed before this returns.
#[instrument(skip_all)]
pub async fn dump(cfg: DumpCfg, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    info!("Start HTTP traffic dump");
    debug!(?cfg);

    let printer = Printer::new(cfg.output.as_deref(), cfg.out_chan_size).await?;

    let handler: Arc<dyn ConnectionHandler> = if cfg.fast {
        Arc::new(FastConnectionHandler::new(cfg.handler_cfg.clone(), printer.sender()))
    } else {
        Arc::new(HttpConnectionHandler::new(cfg.handler_cfg.clone(), printer.sender()))
    };

    let capture_filter = CaptureFilter {
        ip: cfg.filter_ip,
        port: cfg.filter_port,
        host: cfg.handler_cfg.host_pattern.clone(),
    };
    let mut source = PacketSource::open(&cfg.input, &capture_filter, cfg.chan_size)
        .context("couldn't open packet source")?;

    let mut assembler = TcpAssembler::new(handler, cfg.chan_size, cfg.filter_ip, cfg.filter_port);

    let idle = chrono::Duration::from_std(cfg.idle).context("idle threshold out of range")?;
    let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            captured = source.recv() => match captured {
                Some(captured) => assembler.assemble(captured.src, captured.dst, captured.segment),
                None => {
                    debug!("Packet source exhausted");
                    break;
                }
            },
            _ = flush_tick.tick() => {
                assembler.flush_older_than(Utc::now() - idle);
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    source.stop();
    assembler.finish_all().await;
    // The handler (and its record sender) lives inside the assembler; it
    // must go before the printer can observe its channel closing.
    drop(assembler);
    printer.finish().await;

    let dropped = source.dropped();
    if dropped > 0 {
        warn!(dropped, "Packets were dropped on the capture channel");
    }

    info!("HTTP traffic dump terminated");

    Ok(())
}
