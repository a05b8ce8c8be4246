//! Per-connection flow tracking.
//!
//! [`FlowEngine`] owns one table per protocol and routes each decoded packet
//! to the TCP state machine or the UDP aggregator. Packets are processed
//! once, in capture order, and records stay in their table until the engine
//! is dropped.

pub mod key;
pub mod tcp;
pub mod udp;

pub use key::ConnectionKey;
pub use tcp::{TcpConnection, TcpCounters, TcpOutcome, TcpSegment, TcpState, TcpTable};
pub use udp::{UdpConnection, UdpDatagram, UdpOutcome, UdpSide, UdpTable};

use crate::protocol::{ParsedPacket, TransportHeader};
use serde::Serialize;
use std::fmt;

/// Capture time in whole seconds since the Unix epoch.
pub type Timestamp = i64;

/// Which end of a connection sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// Run counters, reported in the end-of-run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Every frame handed to [`FlowEngine::observe`].
    pub packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    /// Frames without an IPv4 + TCP/UDP header pair.
    pub skipped: u64,
    /// TCP packets whose connection was never opened in this capture.
    pub untracked: u64,
    /// TCP packets that did not fit their connection's state.
    pub unexpected: u64,
    pub handshake_retries: u64,
    pub udp_sides_closed: u64,
}

#[derive(Debug)]
pub struct FlowEngine {
    tcp: TcpTable,
    udp: UdpTable,
    stats: EngineStats,
}

impl FlowEngine {
    pub fn new(udp_idle_timeout_secs: u64) -> Self {
        FlowEngine {
            tcp: TcpTable::default(),
            udp: UdpTable::new(udp_idle_timeout_secs),
            stats: EngineStats::default(),
        }
    }

    /// Classify a decoded frame and feed it to the matching table.
    pub fn observe(&mut self, ts: Timestamp, packet: &ParsedPacket<'_>) {
        self.stats.packets += 1;

        let (Some(ip), Some(transport)) = (&packet.network, &packet.transport) else {
            self.stats.skipped += 1;
            match &packet.network {
                Some(ip) => tracing::trace!(
                    link = %packet.link,
                    proto = %ip.protocol(),
                    src = %ip.src_addr(),
                    dst = %ip.dst_addr(),
                    fragment_offset = ip.fragment_offset(),
                    "frame skipped: no tcp/udp header"
                ),
                None => tracing::trace!(
                    link = %packet.link,
                    ether_type = %packet.ether_type,
                    "frame skipped: not ipv4"
                ),
            }
            return;
        };
        match transport {
            TransportHeader::Tcp(hdr) => {
                self.observe_tcp(&TcpSegment::from_headers(ts, ip, hdr));
            }
            TransportHeader::Udp(hdr) => {
                self.observe_udp(&UdpDatagram::from_headers(ts, ip, hdr));
            }
        }
    }

    pub fn observe_tcp(&mut self, seg: &TcpSegment) -> TcpOutcome {
        self.stats.tcp_packets += 1;
        let outcome = self.tcp.observe(seg);
        match outcome {
            TcpOutcome::Opened => {
                tracing::trace!(key = %seg.key(false), ts = seg.ts, "tcp connection opened");
            }
            TcpOutcome::Retried(side) => {
                self.stats.handshake_retries += 1;
                tracing::debug!(%side, flags = %seg.flags, ts = seg.ts, "tcp handshake retry");
            }
            TcpOutcome::Counted { expected: true, .. } => {}
            TcpOutcome::Counted {
                side,
                expected: false,
            } => {
                self.stats.unexpected += 1;
                tracing::debug!(
                    %side,
                    flags = %seg.flags,
                    key = %seg.key(false),
                    ts = seg.ts,
                    "tcp packet does not fit connection state"
                );
            }
            TcpOutcome::Untracked => {
                self.stats.untracked += 1;
                tracing::trace!(key = %seg.key(false), flags = %seg.flags, "tcp packet for untracked connection");
            }
        }
        outcome
    }

    pub fn observe_udp(&mut self, dgram: &UdpDatagram) -> UdpOutcome {
        self.stats.udp_packets += 1;
        let outcome = self.udp.observe(dgram);
        let closed = self.udp.expire(dgram.ts);
        if closed > 0 {
            self.stats.udp_sides_closed += closed as u64;
            tracing::debug!(closed, ts = dgram.ts, "udp sides closed after idle timeout");
        }
        outcome
    }

    pub fn tcp(&self) -> &TcpTable {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpTable {
        &self.udp
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// TCP records ordered by key, so output is stable across runs.
    pub fn tcp_records(&self) -> Vec<(&ConnectionKey, &TcpConnection)> {
        let mut records: Vec<_> = self.tcp.iter().collect();
        records.sort_by(|a, b| a.0.cmp(b.0));
        records
    }

    /// UDP records ordered by key.
    pub fn udp_records(&self) -> Vec<(&ConnectionKey, &UdpConnection)> {
        let mut records: Vec<_> = self.udp.iter().collect();
        records.sort_by(|a, b| a.0.cmp(b.0));
        records
    }
}
