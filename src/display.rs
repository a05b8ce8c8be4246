//! Terminal output for the CLI: banner, progress bar and run summary.

use crate::flow::EngineStats;
use std::io::{self, Write};

const BANNER: &str = r"
   __ _                   _        _
  / _| | _____      _____| |_ __ _| |_
 | |_| |/ _ \ \ /\ / / __| __/ _` | __|
 |  _| | (_) \ V  V /\__ \ || (_| | |_
 |_| |_|\___/ \_/\_/ |___/\__\__,_|\__|
";

const BAR_WIDTH: usize = 50;

pub fn print_banner() {
    println!("{}", BANNER);
    println!("flowstat v{}", env!("CARGO_PKG_VERSION"));
    println!();
}

/// Render `[=====     ] 42.00%` for `processed` out of `total`.
pub fn format_progress(processed: u64, total: u64) -> String {
    let fraction = if total == 0 {
        1.0
    } else {
        (processed as f64 / total as f64).min(1.0)
    };
    let filled = (fraction * BAR_WIDTH as f64) as usize;
    format!(
        "[{}{}] {:.2}%",
        "=".repeat(filled),
        " ".repeat(BAR_WIDTH - filled),
        fraction * 100.0
    )
}

/// Single-line progress bar redrawn in place on stderr.
///
/// Redraws only when the displayed percentage changes.
#[derive(Debug)]
pub struct Progress {
    total: u64,
    processed: u64,
    last_drawn: Option<u64>,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Progress {
            total,
            processed: 0,
            last_drawn: None,
        }
    }

    pub fn tick(&mut self) {
        self.processed += 1;
        let hundredths = if self.total == 0 {
            10_000
        } else {
            self.processed.min(self.total) * 10_000 / self.total
        };
        if self.last_drawn != Some(hundredths) {
            self.last_drawn = Some(hundredths);
            // A failed redraw only loses a progress frame.
            let mut err = io::stderr().lock();
            write!(err, "\r{}", format_progress(self.processed, self.total)).ok();
            err.flush().ok();
        }
    }

    pub fn finish(&self) {
        if self.last_drawn.is_some() {
            eprintln!();
        }
    }
}

pub fn print_summary(stats: &EngineStats, tcp_connections: usize, udp_flows: usize) {
    println!("{}", "=".repeat(50));
    println!("Processing complete.");
    println!("  Frames read:          {}", stats.packets);
    println!("  TCP packets:          {}", stats.tcp_packets);
    println!("  UDP packets:          {}", stats.udp_packets);
    println!("  Skipped (not TCP/UDP over IPv4): {}", stats.skipped);
    println!("  TCP without handshake: {}", stats.untracked);
    println!("  TCP connections:      {}", tcp_connections);
    println!("  UDP flows:            {}", udp_flows);
    println!("  UDP sides idled out:  {}", stats.udp_sides_closed);
    println!("{}", "=".repeat(50));
}
