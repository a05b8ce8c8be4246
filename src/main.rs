mod cli;

use clap::Parser;
use flowstat::{capture, config, display, flow, report};
use std::path::PathBuf;

fn main() {
    let args = cli::Cli::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&config) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = config.filter.as_deref();

    let mut progress = if config.interactive {
        display::print_banner();
        let total = capture::engine::count_frames(&config.input, filter)?;
        println!(
            "Processing {} packets from {}",
            total,
            config.input.display()
        );
        Some(display::Progress::new(total))
    } else {
        None
    };

    let mut cap = capture::engine::open_offline(&config.input, filter)?;
    let mut engine = flow::FlowEngine::new(config.udp_idle_timeout_secs);
    let decode_errors = flowstat::process_capture(&mut cap, &mut engine, progress.as_mut())?;
    if let Some(progress) = &progress {
        progress.finish();
    }
    if decode_errors > 0 {
        tracing::warn!(decode_errors, "some frames could not be decoded");
    }

    let paths = report::write_logs(&config.output_dir, &engine)?;
    if let Some(path) = &config.export_json {
        report::write_json(path, &engine)?;
    }

    if config.interactive {
        display::print_summary(&engine.stats(), engine.tcp().len(), engine.udp().len());
        println!("  TCP log:  {}", paths.tcp.display());
        println!("  UDP log:  {}", paths.udp.display());
        if let Some(path) = &config.export_json {
            println!("  JSON:     {}", path.display());
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    input: PathBuf,
    filter: Option<String>,
    udp_idle_timeout_secs: u64,
    output_dir: PathBuf,
    export_json: Option<PathBuf>,
    interactive: bool,
}

fn load_config(args: &cli::Cli) -> Result<RuntimeConfig, config::ConfigError> {
    let base = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };

    let filter = args.filter.clone().or(base.capture.filter);
    let udp_idle_timeout_secs = args
        .udp_idle_timeout
        .unwrap_or(base.flow.udp_idle_timeout_secs);
    let output_dir = args
        .output_dir
        .clone()
        .or(base.output.dir)
        .unwrap_or_else(|| report::default_output_dir(&args.input));
    let export_json = args.export_json.clone().or(base.output.export_json);

    Ok(RuntimeConfig {
        input: args.input.clone(),
        filter,
        udp_idle_timeout_secs,
        output_dir,
        export_json,
        interactive: base.output.progress && !args.quiet,
    })
}
