//! UDP flow aggregation.
//!
//! UDP has no handshake: the sender of the first datagram seen for a 4-tuple
//! is the client. A side is closed once it has been idle for longer than the
//! configured timeout, measured in capture time.

use super::{ConnectionKey, Side, Timestamp};
use crate::protocol::ipv4::Ipv4Header;
use crate::protocol::udp::{UdpHeader, UDP_HEADER_LEN};
use ahash::AHashMap;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;

/// Decoded UDP datagram as the engine consumes it.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram {
    pub ts: Timestamp,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u32,
}

impl UdpDatagram {
    pub fn from_headers(ts: Timestamp, ip: &Ipv4Header<'_>, udp: &UdpHeader<'_>) -> Self {
        let payload_len = match ip.declared_payload_len() {
            Some(ip_payload) if ip_payload >= UDP_HEADER_LEN => (udp.length() as usize)
                .min(ip_payload)
                .saturating_sub(UDP_HEADER_LEN),
            _ => udp.payload().len(),
        };
        UdpDatagram {
            ts,
            src_ip: ip.src_addr(),
            dst_ip: ip.dst_addr(),
            src_port: udp.src_port(),
            dst_port: udp.dst_port(),
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
}

/// Per-direction UDP counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UdpSide {
    pub packets: u64,
    /// Payload bytes only.
    pub bytes: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Set when the side goes idle; never moved afterwards.
    pub end_time: Option<Timestamp>,
}

impl UdpSide {
    fn first(dgram: &UdpDatagram) -> Self {
        UdpSide {
            packets: 1,
            bytes: dgram.payload_len as u64,
            first_seen: dgram.ts,
            last_seen: dgram.ts,
            end_time: None,
        }
    }

    fn record(&mut self, dgram: &UdpDatagram) {
        self.packets += 1;
        self.bytes += dgram.payload_len as u64;
        self.last_seen = self.last_seen.max(dgram.ts);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdpConnection {
    pub client: UdpSide,
    /// `None` until the first reply.
    pub server: Option<UdpSide>,
}

impl UdpConnection {
    fn side_mut(&mut self, side: Side) -> Option<&mut UdpSide> {
        match side {
            Side::Client => Some(&mut self.client),
            Side::Server => self.server.as_mut(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpOutcome {
    Created,
    Counted(Side),
}

/// Pending idle check. Entries whose `last_seen` no longer matches the side
/// are stale and skipped when popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IdleEntry {
    last_seen: Timestamp,
    key: ConnectionKey,
    side: Side,
}

/// UDP metrics table with an event-time idle queue.
#[derive(Debug)]
pub struct UdpTable {
    conns: AHashMap<ConnectionKey, UdpConnection>,
    idle: BinaryHeap<Reverse<IdleEntry>>,
    idle_timeout: Timestamp,
}

impl UdpTable {
    /// `idle_timeout_secs == 0` disables idle closure.
    pub fn new(idle_timeout_secs: u64) -> Self {
        UdpTable {
            conns: AHashMap::new(),
            idle: BinaryHeap::new(),
            idle_timeout: idle_timeout_secs.min(i64::MAX as u64) as Timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&UdpConnection> {
        self.conns.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionKey, &UdpConnection)> {
        self.conns.iter()
    }

    pub fn observe(&mut self, dgram: &UdpDatagram) -> UdpOutcome {
        let forward = dgram.key(false);
        if let Some(conn) = self.conns.get_mut(&forward) {
            let previous = conn.client.last_seen;
            conn.client.record(dgram);
            let side = conn.client;
            self.schedule(forward, Side::Client, &side, Some(previous));
            return UdpOutcome::Counted(Side::Client);
        }

        let reverse = dgram.key(true);
        if let Some(conn) = self.conns.get_mut(&reverse) {
            let previous = conn.server.map(|s| s.last_seen);
            let side = match conn.server.as_mut() {
                Some(server) => {
                    server.record(dgram);
                    *server
                }
                None => *conn.server.insert(UdpSide::first(dgram)),
            };
            self.schedule(reverse, Side::Server, &side, previous);
            return UdpOutcome::Counted(Side::Server);
        }

        let client = UdpSide::first(dgram);
        self.conns.insert(
            forward,
            UdpConnection {
                client,
                server: None,
            },
        );
        self.schedule(forward, Side::Client, &client, None);
        UdpOutcome::Created
    }

    /// Close every open side idle for longer than the timeout at `now`.
    /// Returns the number of sides closed.
    pub fn expire(&mut self, now: Timestamp) -> usize {
        if self.idle_timeout == 0 {
            return 0;
        }

        let mut closed = 0;
        loop {
            match self.idle.peek() {
                Some(Reverse(entry)) if now - entry.last_seen > self.idle_timeout => {}
                _ => break,
            }
            let Some(Reverse(entry)) = self.idle.pop() else {
                break;
            };
            let Some(side) = self
                .conns
                .get_mut(&entry.key)
                .and_then(|conn| conn.side_mut(entry.side))
            else {
                continue;
            };
            if side.end_time.is_none() && side.last_seen == entry.last_seen {
                side.end_time = Some(now);
                closed += 1;
            }
        }
        closed
    }

    /// Queue an idle check for an open side. Several datagrams within the
    /// same second share one queue entry.
    fn schedule(
        &mut self,
        key: ConnectionKey,
        side: Side,
        state: &UdpSide,
        previous_last_seen: Option<Timestamp>,
    ) {
        if self.idle_timeout == 0 || state.end_time.is_some() {
            return;
        }
        if previous_last_seen == Some(state.last_seen) {
            return;
        }
        self.idle.push(Reverse(IdleEntry {
            last_seen: state.last_seen,
            key,
            side,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 53);

    fn a2b(ts: Timestamp, payload_len: u32) -> UdpDatagram {
        UdpDatagram {
            ts,
            src_ip: A,
            dst_ip: B,
            src_port: 40000,
            dst_port: 53,
            payload_len,
        }
    }

    fn b2a(ts: Timestamp, payload_len: u32) -> UdpDatagram {
        UdpDatagram {
            ts,
            src_ip: B,
            dst_ip: A,
            src_port: 53,
            dst_port: 40000,
            payload_len,
        }
    }

    #[test]
    fn first_datagram_creates_client_side() {
        let mut table = UdpTable::new(60);
        assert_eq!(table.observe(&a2b(10, 100)), UdpOutcome::Created);

        let conn = table.get(&a2b(0, 0).key(false)).unwrap();
        assert_eq!(conn.client.packets, 1);
        assert_eq!(conn.client.bytes, 100);
        assert_eq!(conn.client.first_seen, 10);
        assert_eq!(conn.client.last_seen, 10);
        assert!(conn.server.is_none());
    }

    #[test]
    fn replies_populate_server_side_lazily() {
        let mut table = UdpTable::new(60);
        table.observe(&a2b(10, 100));
        assert_eq!(table.observe(&b2a(11, 50)), UdpOutcome::Counted(Side::Server));
        table.observe(&b2a(13, 70));

        assert_eq!(table.len(), 1);
        let server = table.get(&a2b(0, 0).key(false)).unwrap().server.unwrap();
        assert_eq!(server.packets, 2);
        assert_eq!(server.bytes, 120);
        assert_eq!(server.first_seen, 11);
        assert_eq!(server.last_seen, 13);
    }

    #[test]
    fn idle_side_closes_at_current_event_time() {
        let mut table = UdpTable::new(30);
        table.observe(&a2b(100, 10));
        table.observe(&b2a(101, 10));

        assert_eq!(table.expire(130), 0);
        assert_eq!(table.expire(131), 1);
        let conn = table.get(&a2b(0, 0).key(false)).unwrap();
        assert_eq!(conn.client.end_time, Some(131));
        assert_eq!(conn.server.unwrap().end_time, None);

        assert_eq!(table.expire(132), 1);
        let conn = table.get(&a2b(0, 0).key(false)).unwrap();
        assert_eq!(conn.server.unwrap().end_time, Some(132));
    }

    #[test]
    fn activity_postpones_closure() {
        let mut table = UdpTable::new(30);
        table.observe(&a2b(100, 10));
        table.observe(&a2b(120, 10));
        assert_eq!(table.expire(140), 0);
        assert_eq!(table.expire(151), 1);
        let conn = table.get(&a2b(0, 0).key(false)).unwrap();
        assert_eq!(conn.client.end_time, Some(151));
    }

    #[test]
    fn end_time_is_never_moved() {
        let mut table = UdpTable::new(5);
        table.observe(&a2b(0, 1));
        assert_eq!(table.expire(10), 1);
        table.observe(&a2b(20, 1));
        assert_eq!(table.expire(100), 0);

        let client = table.get(&a2b(0, 0).key(false)).unwrap().client;
        assert_eq!(client.end_time, Some(10));
        assert_eq!(client.packets, 2);
        assert_eq!(client.last_seen, 20);
    }

    #[test]
    fn large_absolute_timestamps_do_not_close_fresh_flows() {
        let mut table = UdpTable::new(60);
        let now = 1_700_000_000;
        table.observe(&a2b(now, 10));
        assert_eq!(table.expire(now), 0);
        assert!(table.get(&a2b(0, 0).key(false)).unwrap().client.end_time.is_none());
    }

    #[test]
    fn zero_timeout_disables_closure() {
        let mut table = UdpTable::new(0);
        table.observe(&a2b(0, 1));
        assert_eq!(table.expire(1_000_000), 0);
        assert!(table.idle.is_empty());
    }
}
