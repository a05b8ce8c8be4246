//! Offline capture reading using libpcap.
//!
//! Opens a pcap/pcapng file, applies an optional BPF filter, and yields
//! timestamped frames together with the file's link-layer framing.

pub mod engine;
