//! TCP connection tracking.
//!
//! A connection is opened by a pure SYN (the sender becomes the client) and
//! keyed by the client's forward key for the rest of its life. Each packet is
//! attributed to the client when its forward key is in the table and to the
//! server when its reverse key is.

use super::{ConnectionKey, Side, Timestamp};
use crate::protocol::ipv4::Ipv4Header;
use crate::protocol::tcp::{TcpFlags, TcpHeader};
use ahash::AHashMap;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Decoded TCP packet as the engine consumes it.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub ts: Timestamp,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
    pub header_len: u32,
    pub payload_len: u32,
}

impl TcpSegment {
    /// Payload length comes from the IP total length when it is consistent,
    /// so snaplen-truncated captures still count the bytes that were on the
    /// wire. Otherwise (offloaded segments with a zero length field) the
    /// captured bytes are used.
    pub fn from_headers(ts: Timestamp, ip: &Ipv4Header<'_>, tcp: &TcpHeader<'_>) -> Self {
        let payload_len = match ip.declared_payload_len() {
            Some(ip_payload) if ip_payload >= tcp.header_len() => ip_payload - tcp.header_len(),
            _ => tcp.payload().len(),
        };
        TcpSegment {
            ts,
            src_ip: ip.src_addr(),
            dst_ip: ip.dst_addr(),
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            flags: tcp.flags(),
            header_len: tcp.header_len() as u32,
            payload_len: payload_len as u32,
        }
    }

    #[inline]
    pub fn key(&self, reverse: bool) -> ConnectionKey {
        ConnectionKey::resolve(
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            reverse,
        )
    }

    #[inline]
    fn wire_bytes(&self) -> u64 {
        self.header_len as u64 + self.payload_len as u64
    }
}

/// Per-direction TCP counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpCounters {
    pub packets: u64,
    /// TCP header plus payload.
    pub bytes: u64,
    pub payload_packets: u64,
    pub payload_bytes: u64,
    pub syn: u64,
    pub ack: u64,
    pub fin: u64,
    pub rst: u64,
    pub urg: u64,
    pub psh: u64,
}

impl TcpCounters {
    /// Counters for a side whose first packet is a handshake segment.
    fn opening(seg: &TcpSegment) -> Self {
        let mut counters = TcpCounters::default();
        counters.record(seg);
        counters.syn = 1;
        counters.ack = seg.flags.ack as u64;
        counters
    }

    fn record(&mut self, seg: &TcpSegment) {
        self.packets += 1;
        self.bytes += seg.wire_bytes();
        if seg.payload_len > 0 {
            self.payload_packets += 1;
            self.payload_bytes += seg.payload_len as u64;
        }
    }

    fn tally_data_flags(&mut self, flags: TcpFlags) {
        self.syn += flags.syn as u64;
        self.ack += flags.ack as u64;
        self.psh += flags.psh as u64;
        self.urg += flags.urg as u64;
    }

    fn tally_teardown_flags(&mut self, flags: TcpFlags) {
        self.fin += flags.fin as u64;
        self.rst += flags.rst as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    /// Client SYN seen.
    New,
    /// Server SYN-ACK seen.
    Established,
    /// Client acknowledged the SYN-ACK; `start_time` is set.
    Active,
    /// FIN or RST seen from either side; `end_time` is set.
    Closed,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpState::New => write!(f, "new"),
            TcpState::Established => write!(f, "established"),
            TcpState::Active => write!(f, "active"),
            TcpState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpConnection {
    pub client: TcpCounters,
    pub server: TcpCounters,
    pub state: TcpState,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
}

impl TcpConnection {
    fn open(seg: &TcpSegment) -> Self {
        TcpConnection {
            client: TcpCounters::opening(seg),
            server: TcpCounters::default(),
            state: TcpState::New,
            start_time: None,
            end_time: None,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut TcpCounters {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Generic accounting for a non-teardown packet. Returns `false` when the
    /// packet does not fit the connection's current state.
    fn on_data(&mut self, side: Side, seg: &TcpSegment) -> bool {
        let counters = self.side_mut(side);
        counters.record(seg);
        counters.tally_data_flags(seg.flags);

        match (self.state, side) {
            (TcpState::Established, Side::Client) if seg.flags.ack => {
                if self.start_time.is_none() {
                    self.start_time = Some(seg.ts);
                }
                self.state = TcpState::Active;
                true
            }
            (TcpState::New, _) => false,
            _ => !seg.flags.syn,
        }
    }

    fn on_teardown(&mut self, side: Side, seg: &TcpSegment) {
        let counters = self.side_mut(side);
        counters.record(seg);
        counters.tally_teardown_flags(seg.flags);

        if self.end_time.is_none() {
            self.end_time = Some(seg.ts);
        }
        self.state = TcpState::Closed;
    }
}

/// What a single segment did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOutcome {
    /// A SYN opened a new connection.
    Opened,
    /// A repeated SYN or SYN-ACK before handshake completion overwrote its side.
    Retried(Side),
    /// Counters of an existing connection were updated. `expected` is false
    /// when the packet did not fit the connection's state.
    Counted { side: Side, expected: bool },
    /// Neither orientation of the key is tracked.
    Untracked,
}

/// TCP metrics table.
#[derive(Debug, Default)]
pub struct TcpTable {
    conns: AHashMap<ConnectionKey, TcpConnection>,
}

impl TcpTable {
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&TcpConnection> {
        self.conns.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionKey, &TcpConnection)> {
        self.conns.iter()
    }

    pub fn observe(&mut self, seg: &TcpSegment) -> TcpOutcome {
        let flags = seg.flags;
        if flags.syn && !flags.ack {
            return self.on_syn(seg);
        }
        if flags.syn && flags.ack {
            return self.on_syn_ack(seg);
        }

        let Some((side, conn)) = self.lookup_mut(seg) else {
            return TcpOutcome::Untracked;
        };
        if flags.fin || flags.rst {
            conn.on_teardown(side, seg);
            TcpOutcome::Counted {
                side,
                expected: true,
            }
        } else {
            let expected = conn.on_data(side, seg);
            TcpOutcome::Counted { side, expected }
        }
    }

    fn on_syn(&mut self, seg: &TcpSegment) -> TcpOutcome {
        let forward = seg.key(false);
        if let Some(conn) = self.conns.get_mut(&forward) {
            return match conn.state {
                TcpState::New => {
                    conn.client = TcpCounters::opening(seg);
                    TcpOutcome::Retried(Side::Client)
                }
                // A SYN after the handshake, including on a closed record
                // (port reuse), is tallied on the existing connection; its
                // timestamps and counters are kept.
                TcpState::Established | TcpState::Active | TcpState::Closed => {
                    conn.on_data(Side::Client, seg);
                    TcpOutcome::Counted {
                        side: Side::Client,
                        expected: false,
                    }
                }
            };
        }

        // A SYN from the responder (simultaneous open) keeps the original
        // client.
        if let Some(conn) = self.conns.get_mut(&seg.key(true)) {
            conn.on_data(Side::Server, seg);
            return TcpOutcome::Counted {
                side: Side::Server,
                expected: false,
            };
        }

        self.conns.insert(forward, TcpConnection::open(seg));
        TcpOutcome::Opened
    }

    fn on_syn_ack(&mut self, seg: &TcpSegment) -> TcpOutcome {
        let Some(conn) = self.conns.get_mut(&seg.key(true)) else {
            return TcpOutcome::Untracked;
        };
        match conn.state {
            TcpState::New | TcpState::Established => {
                let retry = conn.state == TcpState::Established;
                conn.server = TcpCounters::opening(seg);
                conn.state = TcpState::Established;
                if retry {
                    TcpOutcome::Retried(Side::Server)
                } else {
                    TcpOutcome::Counted {
                        side: Side::Server,
                        expected: true,
                    }
                }
            }
            TcpState::Active | TcpState::Closed => {
                conn.on_data(Side::Server, seg);
                TcpOutcome::Counted {
                    side: Side::Server,
                    expected: false,
                }
            }
        }
    }

    fn lookup_mut(&mut self, seg: &TcpSegment) -> Option<(Side, &mut TcpConnection)> {
        let forward = seg.key(false);
        // Two lookups: returning the first `get_mut` borrow from one branch
        // keeps the map borrowed for the fallback (NLL problem case #3).
        if self.conns.contains_key(&forward) {
            return self.conns.get_mut(&forward).map(|c| (Side::Client, c));
        }
        self.conns
            .get_mut(&seg.key(true))
            .map(|c| (Side::Server, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::{ACK, FIN, PSH, RST, SYN};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const SERVER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn c2s(ts: Timestamp, flags: u8, payload_len: u32) -> TcpSegment {
        TcpSegment {
            ts,
            src_ip: CLIENT,
            dst_ip: SERVER,
            src_port: 51000,
            dst_port: 443,
            flags: TcpFlags::from_bits(flags),
            header_len: 20,
            payload_len,
        }
    }

    fn s2c(ts: Timestamp, flags: u8, payload_len: u32) -> TcpSegment {
        TcpSegment {
            ts,
            src_ip: SERVER,
            dst_ip: CLIENT,
            src_port: 443,
            dst_port: 51000,
            flags: TcpFlags::from_bits(flags),
            header_len: 20,
            payload_len,
        }
    }

    fn key() -> ConnectionKey {
        c2s(0, 0, 0).key(false)
    }

    fn handshake(table: &mut TcpTable) {
        table.observe(&c2s(100, SYN, 0));
        table.observe(&s2c(100, SYN | ACK, 0));
        table.observe(&c2s(101, ACK, 0));
    }

    #[test]
    fn syn_opens_connection_under_client_key() {
        let mut table = TcpTable::default();
        assert_eq!(table.observe(&c2s(100, SYN, 0)), TcpOutcome::Opened);

        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.state, TcpState::New);
        assert_eq!(conn.client.packets, 1);
        assert_eq!(conn.client.syn, 1);
        assert_eq!(conn.client.bytes, 20);
        assert_eq!(conn.server, TcpCounters::default());
        assert!(table.get(&key().reverse()).is_none());
    }

    #[test]
    fn handshake_sets_start_time_on_client_ack() {
        let mut table = TcpTable::default();
        table.observe(&c2s(100, SYN, 0));
        table.observe(&s2c(100, SYN | ACK, 0));
        assert_eq!(table.get(&key()).unwrap().state, TcpState::Established);
        assert_eq!(table.get(&key()).unwrap().start_time, None);

        table.observe(&c2s(101, ACK, 0));
        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.state, TcpState::Active);
        assert_eq!(conn.start_time, Some(101));
        assert_eq!(conn.server.syn, 1);
        assert_eq!(conn.server.ack, 1);
        assert_eq!(conn.server.packets, 1);
    }

    #[test]
    fn start_time_is_set_once() {
        let mut table = TcpTable::default();
        handshake(&mut table);
        table.observe(&c2s(105, ACK | PSH, 300));
        table.observe(&s2c(106, ACK, 0));
        assert_eq!(table.get(&key()).unwrap().start_time, Some(101));
    }

    #[test]
    fn data_counts_payload_and_flags_per_side() {
        let mut table = TcpTable::default();
        handshake(&mut table);
        table.observe(&c2s(102, ACK | PSH, 100));
        table.observe(&s2c(102, ACK | PSH, 1400));
        table.observe(&s2c(103, ACK, 1400));

        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.client.packets, 3);
        assert_eq!(conn.client.payload_packets, 1);
        assert_eq!(conn.client.payload_bytes, 100);
        assert_eq!(conn.client.bytes, 20 + 20 + 120);
        assert_eq!(conn.client.psh, 1);
        assert_eq!(conn.server.packets, 3);
        assert_eq!(conn.server.payload_packets, 2);
        assert_eq!(conn.server.payload_bytes, 2800);
        assert_eq!(conn.server.ack, 3);
        assert_eq!(conn.server.psh, 1);
    }

    #[test]
    fn first_teardown_packet_sets_end_time() {
        let mut table = TcpTable::default();
        handshake(&mut table);
        table.observe(&c2s(110, FIN | ACK, 0));
        table.observe(&s2c(111, FIN | ACK, 0));
        table.observe(&c2s(112, ACK, 0));

        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.state, TcpState::Closed);
        assert_eq!(conn.end_time, Some(110));
        assert_eq!(conn.client.fin, 1);
        assert_eq!(conn.server.fin, 1);
        // ACK on a FIN segment is not tallied.
        assert_eq!(conn.client.ack, 2);
        assert_eq!(conn.server.ack, 1);
    }

    #[test]
    fn rst_from_server_closes() {
        let mut table = TcpTable::default();
        table.observe(&c2s(100, SYN, 0));
        let outcome = table.observe(&s2c(100, RST | ACK, 0));
        assert_eq!(
            outcome,
            TcpOutcome::Counted {
                side: Side::Server,
                expected: true
            }
        );
        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.server.rst, 1);
        assert_eq!(conn.end_time, Some(100));
        assert_eq!(conn.start_time, None);
    }

    #[test]
    fn packets_for_unknown_connections_are_ignored() {
        let mut table = TcpTable::default();
        assert_eq!(table.observe(&c2s(1, ACK, 10)), TcpOutcome::Untracked);
        assert_eq!(table.observe(&s2c(1, SYN | ACK, 0)), TcpOutcome::Untracked);
        assert_eq!(table.observe(&s2c(2, FIN, 0)), TcpOutcome::Untracked);
        assert!(table.is_empty());
    }

    #[test]
    fn syn_retry_overwrites_client_side() {
        let mut table = TcpTable::default();
        table.observe(&c2s(100, SYN, 0));
        table.observe(&c2s(101, ACK, 0)); // before any SYN-ACK
        assert_eq!(
            table.observe(&c2s(103, SYN, 0)),
            TcpOutcome::Retried(Side::Client)
        );
        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.client.packets, 1);
        assert_eq!(conn.client.ack, 0);
        assert_eq!(conn.state, TcpState::New);
    }

    #[test]
    fn syn_after_close_keeps_timestamps_and_counters() {
        let mut table = TcpTable::default();
        handshake(&mut table);
        table.observe(&c2s(110, FIN | ACK, 0));
        let before = table.get(&key()).unwrap().clone();
        assert_eq!(before.end_time, Some(110));
        assert_eq!(before.start_time, Some(101));

        assert_eq!(
            table.observe(&c2s(200, SYN, 0)),
            TcpOutcome::Counted {
                side: Side::Client,
                expected: false
            }
        );
        table.observe(&c2s(300, FIN, 0));

        let conn = table.get(&key()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(conn.state, TcpState::Closed);
        assert_eq!(conn.end_time, Some(110));
        assert_eq!(conn.start_time, Some(101));
        assert_eq!(conn.client.packets, before.client.packets + 2);
        assert_eq!(conn.client.syn, before.client.syn + 1);
        assert_eq!(conn.client.fin, before.client.fin + 1);
        assert_eq!(conn.server, before.server);
    }

    #[test]
    fn late_syn_ack_is_counted_not_overwritten() {
        let mut table = TcpTable::default();
        handshake(&mut table);
        table.observe(&s2c(102, ACK, 500));
        let outcome = table.observe(&s2c(103, SYN | ACK, 0));
        assert_eq!(
            outcome,
            TcpOutcome::Counted {
                side: Side::Server,
                expected: false
            }
        );
        let conn = table.get(&key()).unwrap();
        assert_eq!(conn.server.packets, 3);
        assert_eq!(conn.server.syn, 2);
        assert_eq!(conn.server.payload_bytes, 500);
    }

    #[test]
    fn client_data_before_syn_ack_is_unexpected() {
        let mut table = TcpTable::default();
        table.observe(&c2s(100, SYN, 0));
        assert_eq!(
            table.observe(&c2s(100, ACK, 0)),
            TcpOutcome::Counted {
                side: Side::Client,
                expected: false
            }
        );
        assert_eq!(table.get(&key()).unwrap().state, TcpState::New);
    }
}
