use crate::flow::Timestamp;
use crate::protocol::LinkType;
use pcap::{Capture, Offline};
use std::fmt;
use std::path::Path;

#[derive(Debug)]
pub enum CaptureError {
    Pcap(pcap::Error),
    /// The file's link type has no decoder.
    UnsupportedLinkType { dlt: i32, name: String },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Pcap(e) => write!(f, "pcap error: {}", e),
            CaptureError::UnsupportedLinkType { dlt, name } => {
                write!(f, "unsupported link type {} ({})", dlt, name)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<pcap::Error> for CaptureError {
    fn from(e: pcap::Error) -> Self {
        CaptureError::Pcap(e)
    }
}

/// One captured frame, borrowed from the capture handle's buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub ts: Timestamp,
    /// Original length on the wire; `data` may be shorter (snaplen).
    pub wire_len: u32,
    pub data: &'a [u8],
}

pub struct OfflineCapture {
    cap: Capture<Offline>,
    link: LinkType,
}

impl OfflineCapture {
    pub fn link_type(&self) -> LinkType {
        self.link
    }

    /// Next frame in file order, or `None` once the file is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Frame<'_>>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(Some(Frame {
                ts: packet.header.ts.tv_sec as Timestamp,
                wire_len: packet.header.len,
                data: packet.data,
            })),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(CaptureError::Pcap(e)),
        }
    }
}

fn open_raw(path: &Path, filter: Option<&str>) -> Result<Capture<Offline>, CaptureError> {
    let mut cap = Capture::from_file(path)?;
    if let Some(filter) = filter {
        cap.filter(filter, true)?;
    }
    Ok(cap)
}

/// Open a capture file for reading.
pub fn open_offline(path: &Path, filter: Option<&str>) -> Result<OfflineCapture, CaptureError> {
    let cap = open_raw(path, filter)?;
    let datalink = cap.get_datalink();
    let link = LinkType::from_dlt(datalink.0).ok_or_else(|| CaptureError::UnsupportedLinkType {
        dlt: datalink.0,
        name: datalink
            .get_name()
            .unwrap_or_else(|_| "unknown".to_string()),
    })?;

    tracing::info!(
        file = %path.display(),
        link = %link,
        filter = filter.unwrap_or("none"),
        "capture opened"
    );

    Ok(OfflineCapture { cap, link })
}

/// Count the frames in a capture (after filtering). Used to size the
/// progress bar; reads the whole file once.
pub fn count_frames(path: &Path, filter: Option<&str>) -> Result<u64, CaptureError> {
    let mut cap = open_raw(path, filter)?;
    let mut count = 0;
    loop {
        match cap.next_packet() {
            Ok(_) => count += 1,
            Err(pcap::Error::NoMorePackets) => return Ok(count),
            Err(e) => return Err(CaptureError::Pcap(e)),
        }
    }
}
