//! TCP assembler: routes captured segments to the right connection and
//! direction, creating connections on demand and evicting idle ones.
//!
//! The assembler owns the connection table and the producer half of every
//! stream; consumer tasks only ever see their reader half plus a snapshot
//! of the connection identity, so nothing reaches back into the table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::handler::{ConnectionHandler, ConnectionStreams};
use crate::stream::{stream_pair, ReassemblyStream};
use crate::tcp::{ConnectionKey, Endpoint, Segment};

struct TcpConnection {
    /// Client → server orientation, as reported to the handler.
    key: ConnectionKey,
    client: Endpoint,
    request: ReassemblyStream,
    response: ReassemblyStream,
}

impl TcpConnection {
    fn last_activity(&self) -> DateTime<Utc> {
        self.request.last_activity().max(self.response.last_activity())
    }
}

pub struct TcpAssembler {
    connections: HashMap<ConnectionKey, TcpConnection>,
    handler: Arc<dyn ConnectionHandler>,
    chan_size: usize,
    filter_ip: Option<IpAddr>,
    filter_port: Option<u16>,
}

impl TcpAssembler {
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        chan_size: usize,
        filter_ip: Option<IpAddr>,
        filter_port: Option<u16>,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            handler,
            chan_size,
            filter_ip,
            filter_port,
        }
    }

    /// Route one segment to its connection, creating the connection (and
    /// spawning its consumers) on first sight.
    pub fn assemble(&mut self, src: Endpoint, dst: Endpoint, segment: Segment) {
        if !self.filter_accepts(src, dst) {
            return;
        }

        let canonical = ConnectionKey::new(src, dst).canonical();

        let handler = &self.handler;
        let chan_size = self.chan_size;
        let connection = self.connections.entry(canonical).or_insert_with(|| {
            // The SYN sender is the client; a SYN-ACK seen first means the
            // peer initiated. Without any SYN in the trace, fall back to
            // the first endpoint seen.
            let client = if segment.syn && segment.ack { dst } else { src };
            let server = if client == src { dst } else { src };
            let key = ConnectionKey::new(client, server);

            debug!(connection = %key, "New connection");

            let (request, request_reader) = stream_pair(format!("{key} request"), chan_size);
            let (response, response_reader) = stream_pair(format!("{key} response"), chan_size);

            handler.handle(ConnectionStreams {
                key,
                client_id: client.to_string(),
                request: request_reader,
                response: response_reader,
            });

            TcpConnection {
                key,
                client,
                request,
                response,
            }
        });

        if src == connection.client {
            connection.request.push(segment);
        } else {
            connection.response.push(segment);
        }

        if connection.request.is_closed() && connection.response.is_closed() {
            debug!(connection = %connection.key, "Connection finished");
            self.connections.remove(&canonical);
        }
    }

    fn filter_accepts(&self, src: Endpoint, dst: Endpoint) -> bool {
        if let Some(ip) = self.filter_ip {
            if src.ip != ip && dst.ip != ip {
                return false;
            }
        }
        if let Some(port) = self.filter_port {
            if src.port != port && dst.port != port {
                return false;
            }
        }
        true
    }

    /// Evict every connection with no activity since `threshold`, forcing
    /// EOF on its readers.
    pub fn flush_older_than(&mut self, threshold: DateTime<Utc>) {
        self.connections.retain(|_, connection| {
            if connection.last_activity() >= threshold {
                return true;
            }

            debug!(connection = %connection.key, "Evicting idle connection");
            connection.request.close();
            connection.response.close();
            false
        });
    }

    /// Number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every stream and wait until all consumer tasks have returned.
    pub async fn finish_all(&mut self) {
        for (_, mut connection) in self.connections.drain() {
            connection.request.close();
            connection.response.close();
        }

        self.handler.finish().await;
    }
}
