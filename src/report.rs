//! Report files: one space-separated line per connection, plus an optional
//! JSON dump of every record.

use crate::flow::{ConnectionKey, EngineStats, FlowEngine, TcpConnection, UdpConnection};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const TCP_LOG_NAME: &str = "log_tcp_complete";
pub const UDP_LOG_NAME: &str = "log_udp_complete";

pub const TCP_LOG_HEADER: &str = "c_ip s_ip c_port s_port \
     c_packs c_bytes c_packs_data c_bytes_data \
     s_packs s_bytes s_packs_data s_bytes_data \
     ts te \
     c_SYN c_ACK c_FIN c_RST c_URG c_PSH \
     s_SYN s_ACK s_FIN s_RST s_URG s_PSH";

pub const UDP_LOG_HEADER: &str = "c_ip s_ip c_port s_port \
     c_packs c_bytes \
     s_packs s_bytes \
     c_ts c_te s_ts s_te";

#[derive(Debug)]
pub enum ReportError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::Io(err) => write!(f, "report io error: {}", err),
            ReportError::Json(err) => write!(f, "report json error: {}", err),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<io::Error> for ReportError {
    fn from(err: io::Error) -> Self {
        ReportError::Io(err)
    }
}

impl From<serde_json::Error> for ReportError {
    fn from(err: serde_json::Error) -> Self {
        ReportError::Json(err)
    }
}

/// Where [`write_logs`] put its files.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub tcp: PathBuf,
    pub udp: PathBuf,
}

/// `capture.pcap` -> `capture.out`, relative to the working directory.
pub fn default_output_dir(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string());
    PathBuf::from(format!("{}.out", stem))
}

pub fn tcp_line(key: &ConnectionKey, conn: &TcpConnection) -> String {
    let c = &conn.client;
    let s = &conn.server;
    format!(
        "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
        key,
        c.packets,
        c.bytes,
        c.payload_packets,
        c.payload_bytes,
        s.packets,
        s.bytes,
        s.payload_packets,
        s.payload_bytes,
        conn.start_time.unwrap_or(0),
        conn.end_time.unwrap_or(0),
        c.syn,
        c.ack,
        c.fin,
        c.rst,
        c.urg,
        c.psh,
        s.syn,
        s.ack,
        s.fin,
        s.rst,
        s.urg,
        s.psh,
    )
}

/// Unset server timestamps are written as `0`.
pub fn udp_line(key: &ConnectionKey, conn: &UdpConnection) -> String {
    let c = &conn.client;
    let (s_packets, s_bytes, s_first, s_last) = conn
        .server
        .map(|s| (s.packets, s.bytes, s.first_seen, s.last_seen))
        .unwrap_or_default();
    format!(
        "{} {} {} {} {} {} {} {} {}",
        key, c.packets, c.bytes, s_packets, s_bytes, c.first_seen, c.last_seen, s_first, s_last
    )
}

pub fn write_tcp_log<W: Write>(
    writer: &mut W,
    records: &[(&ConnectionKey, &TcpConnection)],
) -> io::Result<()> {
    writeln!(writer, "{}", TCP_LOG_HEADER)?;
    for (key, conn) in records {
        writeln!(writer, "{}", tcp_line(key, conn))?;
    }
    Ok(())
}

pub fn write_udp_log<W: Write>(
    writer: &mut W,
    records: &[(&ConnectionKey, &UdpConnection)],
) -> io::Result<()> {
    writeln!(writer, "{}", UDP_LOG_HEADER)?;
    for (key, conn) in records {
        writeln!(writer, "{}", udp_line(key, conn))?;
    }
    Ok(())
}

/// Write both log files into `dir`, creating it if needed.
pub fn write_logs(dir: &Path, engine: &FlowEngine) -> Result<ReportPaths, ReportError> {
    fs::create_dir_all(dir)?;
    let paths = ReportPaths {
        tcp: dir.join(TCP_LOG_NAME),
        udp: dir.join(UDP_LOG_NAME),
    };

    let mut tcp = BufWriter::new(File::create(&paths.tcp)?);
    write_tcp_log(&mut tcp, &engine.tcp_records())?;
    tcp.flush()?;

    let mut udp = BufWriter::new(File::create(&paths.udp)?);
    write_udp_log(&mut udp, &engine.udp_records())?;
    udp.flush()?;

    tracing::info!(
        dir = %dir.display(),
        tcp = engine.tcp().len(),
        udp = engine.udp().len(),
        "reports written"
    );
    Ok(paths)
}

#[derive(Serialize)]
struct JsonRecord<'a, T> {
    #[serde(flatten)]
    key: &'a ConnectionKey,
    #[serde(flatten)]
    record: &'a T,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    stats: EngineStats,
    tcp: Vec<JsonRecord<'a, TcpConnection>>,
    udp: Vec<JsonRecord<'a, UdpConnection>>,
}

pub fn write_json(path: &Path, engine: &FlowEngine) -> Result<(), ReportError> {
    let report = JsonReport {
        stats: engine.stats(),
        tcp: engine
            .tcp_records()
            .into_iter()
            .map(|(key, record)| JsonRecord { key, record })
            .collect(),
        udp: engine
            .udp_records()
            .into_iter()
            .map(|(key, record)| JsonRecord { key, record })
            .collect(),
    };
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &report)?;
    writer.flush()?;
    Ok(())
}
