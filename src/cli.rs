use clap::Parser;
use std::path::PathBuf;

/// flowstat: per-connection TCP/UDP statistics from a pcap capture
#[derive(Parser, Debug)]
#[command(name = "flowstat", version, about)]
pub struct Cli {
    /// Capture file to analyse (e.g. "trace.pcap")
    #[arg(short, long)]
    pub input: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// BPF filter applied while reading (e.g. "not port 22")
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Directory for log_tcp_complete / log_udp_complete [default: <trace>.out]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Seconds of capture-time inactivity after which a UDP side is closed (0 = never)
    #[arg(long)]
    pub udp_idle_timeout: Option<u64>,

    /// Also write every record as JSON to this path
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Suppress the banner and progress bar
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
