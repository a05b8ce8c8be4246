use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Directional connection identifier: `src` is the side the key was built
/// from, not necessarily the connection's client.
///
/// A packet and its reply resolve to keys that are each other's
/// [`reverse`](ConnectionKey::reverse), so a table lookup probes both
/// orientations with two calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ConnectionKey {
    /// Build the key for a packet's endpoints. With `reverse` set the
    /// packet's destination becomes the key source.
    #[inline]
    pub fn resolve(
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        reverse: bool,
    ) -> Self {
        let key = ConnectionKey {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        };
        if reverse {
            key.reverse()
        } else {
            key
        }
    }

    #[inline]
    pub fn reverse(&self) -> Self {
        ConnectionKey {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// Space-separated `src_ip dst_ip src_port dst_port`, the leading columns of
/// both report files.
impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.src_ip, self.dst_ip, self.src_port, self.dst_port
        )
    }
}
