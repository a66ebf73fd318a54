//! Packet acquisition: live capture or pcap file, decoded down to TCP
//! segments.
//!
//! The pcap read loop runs on a dedicated blocking thread and feeds a
//! bounded channel; when the channel is full the packet is dropped and
//! counted, because live capture cannot pause the wire.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use pcap::{Activated, Capture, Linktype};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::tcp::{Endpoint, Segment};

/// Linux cooked capture (SLL) pseudo-header length, used by the `any`
/// pseudo-device.
const SLL_HEADER_LEN: usize = 16;
/// BSD loopback pseudo-header length.
const NULL_HEADER_LEN: usize = 4;

/// Capture-level filtering, pushed down as a BPF program.
#[derive(Debug, Clone, Default)]
pub struct CaptureFilter {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    /// Request host filter; only usable at this layer when it carries no
    /// wildcard (BPF resolves plain names).
    pub host: Option<String>,
}

impl CaptureFilter {
    fn bpf(&self) -> String {
        let mut terms = vec!["tcp".to_owned()];

        if let Some(ip) = self.ip {
            terms.push(format!("host {ip}"));
        }
        if let Some(port) = self.port {
            terms.push(format!("port {port}"));
        }
        if let Some(host) = &self.host {
            if !host.contains(['*', '?']) {
                terms.push(format!("host {host}"));
            }
        }

        terms.join(" and ")
    }
}

/// One decoded TCP segment together with its network flow.
#[derive(Debug)]
pub struct CapturedSegment {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub segment: Segment,
}

pub struct PacketSource {
    rx: mpsc::Receiver<CapturedSegment>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl PacketSource {
    /// Open `input`: `any` or an interface name for live capture, a path
    /// ending in `.pcap`/`.pcapng` for an offline file.
    pub fn open(input: &str, filter: &CaptureFilter, chan_size: usize) -> anyhow::Result<Self> {
        let mut capture: Capture<dyn Activated> = if is_capture_file(input) {
            Capture::from_file(input)
                .with_context(|| format!("couldn't open capture file `{input}`"))?
                .into()
        } else {
            Capture::from_device(input)
                .with_context(|| format!("no such capture device `{input}`"))?
                .promisc(true)
                // Bounded read timeout so the loop can observe the stop flag.
                .timeout(500)
                .open()
                .with_context(|| format!("couldn't start capture on `{input}`"))?
                .into()
        };

        let program = filter.bpf();
        capture
            .filter(&program, true)
            .with_context(|| format!("couldn't install BPF filter `{program}`"))?;

        let datalink = capture.get_datalink();
        info!(input, bpf = %program, datalink = ?datalink, "Packet source opened");

        let (tx, rx) = mpsc::channel(chan_size.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        // The loop ends on its own once the file runs out, the channel is
        // dropped, or the stop flag is raised; there is nothing to join.
        {
            let stop = Arc::clone(&stop);
            let dropped = Arc::clone(&dropped);
            let _ = tokio::task::spawn_blocking(move || capture_loop(capture, datalink, tx, stop, dropped));
        }

        Ok(Self { rx, stop, dropped })
    }

    /// Next decoded segment; `None` once the source is exhausted.
    pub async fn recv(&mut self) -> Option<CapturedSegment> {
        self.rx.recv().await
    }

    /// Ask the capture loop to stop at its next timeout tick.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Packets dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn is_capture_file(input: &str) -> bool {
    input.ends_with(".pcap") || input.ends_with(".pcapng")
}

fn capture_loop(
    mut capture: Capture<dyn Activated>,
    datalink: Linktype,
    tx: mpsc::Sender<CapturedSegment>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    debug!("Capture task started");

    while !stop.load(Ordering::Relaxed) {
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(error) => {
                warn!(%error, "Capture read failed");
                break;
            }
        };

        let timestamp = packet_timestamp(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);

        let Some(captured) = decode_packet(datalink, packet.data, timestamp) else {
            continue;
        };

        match tx.try_send(captured) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    debug!("Capture task terminated");
}

fn packet_timestamp(tv_sec: i64, tv_usec: i64) -> DateTime<Utc> {
    let nsec = u32::try_from(tv_usec.clamp(0, 999_999) * 1000).unwrap_or(0);
    DateTime::from_timestamp(tv_sec, nsec).unwrap_or_else(Utc::now)
}

/// Decode one link-layer frame down to a TCP segment; anything that isn't
/// well-formed TCP/IP is skipped silently.
fn decode_packet(datalink: Linktype, data: &[u8], timestamp: DateTime<Utc>) -> Option<CapturedSegment> {
    let sliced = if datalink == Linktype::ETHERNET {
        SlicedPacket::from_ethernet(data).ok()?
    } else if datalink == Linktype::LINUX_SLL {
        SlicedPacket::from_ip(data.get(SLL_HEADER_LEN..)?).ok()?
    } else if datalink == Linktype::NULL || datalink == Linktype::LOOP {
        SlicedPacket::from_ip(data.get(NULL_HEADER_LEN..)?).ok()?
    } else if datalink == Linktype::RAW || datalink == Linktype::IPV4 || datalink == Linktype::IPV6 {
        SlicedPacket::from_ip(data).ok()?
    } else {
        trace!(?datalink, "Unsupported link type");
        return None;
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(InternetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(InternetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };

    Some(CapturedSegment {
        src: Endpoint::new(src_ip, tcp.source_port()),
        dst: Endpoint::new(dst_ip, tcp.destination_port()),
        segment: Segment {
            seq: tcp.sequence_number(),
            payload: tcp.payload().to_vec(),
            timestamp,
            uuid: Uuid::new_v4(),
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn bpf_program_combines_filter_terms() {
        let filter = CaptureFilter::default();
        assert_eq!(filter.bpf(), "tcp");

        let filter = CaptureFilter {
            ip: Some("10.0.0.1".parse().unwrap()),
            port: Some(8080),
            host: None,
        };
        assert_eq!(filter.bpf(), "tcp and host 10.0.0.1 and port 8080");
    }

    #[test]
    fn wildcard_hosts_are_not_pushed_into_bpf() {
        let filter = CaptureFilter {
            ip: None,
            port: None,
            host: Some("*.example.com".to_owned()),
        };
        assert_eq!(filter.bpf(), "tcp");

        let filter = CaptureFilter {
            ip: None,
            port: None,
            host: Some("example.com".to_owned()),
        };
        assert_eq!(filter.bpf(), "tcp and host example.com");
    }

    #[test]
    fn decodes_an_ethernet_tcp_packet() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 80, 1234, 4096);

        let payload = b"GET / HTTP/1.1\r\n";
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();

        let captured = decode_packet(Linktype::ETHERNET, &frame, Utc::now()).unwrap();
        assert_eq!(captured.src.to_string(), "10.0.0.1:40000");
        assert_eq!(captured.dst.to_string(), "10.0.0.2:80");
        assert_eq!(captured.segment.seq, 1234);
        assert_eq!(captured.segment.payload, payload);
    }

    #[test]
    fn non_tcp_packets_are_skipped() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(5353, 5353);

        let mut frame = Vec::new();
        builder.write(&mut frame, b"not tcp").unwrap();

        assert!(decode_packet(Linktype::ETHERNET, &frame, Utc::now()).is_none());
    }

    #[test]
    fn truncated_frames_are_skipped() {
        assert!(decode_packet(Linktype::ETHERNET, &[0x00, 0x01], Utc::now()).is_none());
        assert!(decode_packet(Linktype::LINUX_SLL, &[0x00; 10], Utc::now()).is_none());
    }

    #[test]
    fn capture_file_detection_by_suffix() {
        assert!(is_capture_file("trace.pcap"));
        assert!(is_capture_file("trace.pcapng"));
        assert!(!is_capture_file("eth0"));
        assert!(!is_capture_file("any"));
    }
}
