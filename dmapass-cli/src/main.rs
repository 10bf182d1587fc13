use clap::Parser;
use colored::Colorize;
use dmapass_core::MemoryStrategy;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "dmapass")]
#[command(about = "IOMMU DMA passthrough test harness", long_about = None)]
struct Cli {
    /// Memory type (0: anonymous mmap, 1: dummymap, 2: devdax map)
    #[arg(allow_hyphen_values = true)]
    mem_type: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// VFIO container node
    #[arg(long)]
    container: Option<PathBuf>,

    /// VFIO group node (derived from the device's IOMMU group if omitted)
    #[arg(short, long)]
    group: Option<PathBuf>,

    /// PCI address of the passthrough device
    #[arg(short, long)]
    device: Option<String>,

    /// Do not wait for confirmation before mapping DMA
    #[arg(short, long)]
    yes: bool,

    /// Serve memory type 1 from an in-process buffer provider
    #[arg(long)]
    simulate_provider: bool,

    /// Print the session report as JSON
    #[arg(long)]
    json: bool,
}

/// Process status for any failed session or rejected argument.
const FAILURE_STATUS: i32 = -1;

/// Resolve the memory type argument, or the status to exit with.
fn select_strategy(raw: Option<&str>) -> Result<MemoryStrategy, i32> {
    commands::parse_selector(raw).map_err(|e| {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        FAILURE_STATUS
    })
}

fn main() {
    let cli = Cli::parse();

    // Reject a bad selector before anything is opened
    let strategy = match select_strategy(cli.mem_type.as_deref()) {
        Ok(strategy) => strategy,
        Err(status) => std::process::exit(status),
    };

    if let Err(e) = dmapass_core::init_observability() {
        eprintln!("{} failed to initialize logging: {}", "warning:".yellow(), e);
    }

    let options = commands::RunOptions {
        strategy,
        config: cli.config,
        container: cli.container,
        group: cli.group,
        device: cli.device,
        yes: cli.yes,
        simulate_provider: cli.simulate_provider,
        json: cli.json,
    };

    if let Err(e) = commands::run(options) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(FAILURE_STATUS);
    }
}
