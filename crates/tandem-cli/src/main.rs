//! Tandem Command-Line Interface
//!
//! Drives the reference guests:
//! - `exported`: direct calls into a reactor guest's `add` / `cube` exports
//! - `add`, `cube`: bridged calls into command guests looping in `_start`
//! - `bench`: direct vs bridged latency

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tandem_sandbox::guests::{AddModule, CubeModule, ExportedModule};
use tandem_sandbox::{GuestConfig, WasmBenchmark, WasmConfig, WasmSandbox};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about = "Typed host/guest WebAssembly calls", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Engine configuration (JSON, see WasmConfig)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fuel budget per instance (enables fuel metering)
    #[arg(long, global = true)]
    fuel: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct GuestArgs {
    /// Guest module (.wasm or .wat)
    #[arg(short, long)]
    module: Option<PathBuf>,

    /// Guest configuration (JSON, see GuestConfig)
    #[arg(long)]
    guest_config: Option<PathBuf>,

    /// Import namespace of the host module
    #[arg(long)]
    namespace: Option<String>,

    /// Deadline for one bridged call in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Call exports of a reactor guest directly
    Exported {
        #[command(flatten)]
        guest: GuestArgs,

        #[command(subcommand)]
        op: Op,
    },

    /// Bridged add through a guest serving add_request/add_response
    Add {
        #[command(flatten)]
        guest: GuestArgs,

        /// Left operand
        #[arg(allow_negative_numbers = true)]
        i: i32,

        /// Right operand
        #[arg(allow_negative_numbers = true)]
        j: i32,
    },

    /// Bridged cube through a guest serving cube_request/cube_response
    Cube {
        #[command(flatten)]
        guest: GuestArgs,

        /// Values to cube, one round trip each
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<i32>,
    },

    /// Compare direct and bridged cube latency
    Bench {
        /// Reactor guest exporting cube
        #[arg(long)]
        exported: PathBuf,

        /// Command guest serving cube requests
        #[arg(long)]
        bridged: PathBuf,

        /// Calls per side
        #[arg(short = 'n', long, default_value = "1000")]
        iterations: u32,
    },
}

#[derive(Subcommand)]
enum Op {
    /// add(i, j)
    Add {
        #[arg(allow_negative_numbers = true)]
        i: i32,
        #[arg(allow_negative_numbers = true)]
        j: i32,
    },
    /// cube(i)
    Cube {
        #[arg(allow_negative_numbers = true)]
        i: i32,
    },
}

fn engine_config(path: Option<&PathBuf>, fuel: Option<u64>) -> Result<WasmConfig> {
    let mut config = match path {
        Some(path) => WasmConfig::from_json_file(path)
            .with_context(|| format!("Failed to load engine config {:?}", path))?,
        None => WasmConfig::default(),
    };
    if let Some(fuel) = fuel {
        config = config.fuel_limit(fuel);
    }
    Ok(config)
}

fn guest_config(args: &GuestArgs, exported: bool) -> Result<GuestConfig> {
    let mut config = match (&args.guest_config, &args.module) {
        (Some(path), _) => GuestConfig::from_json_file(path)
            .with_context(|| format!("Failed to load guest config {:?}", path))?,
        (None, Some(module)) if exported => GuestConfig::exported(module),
        (None, Some(module)) => GuestConfig::imported(module),
        (None, None) => bail!("either --module or --guest-config is required"),
    };
    if let Some(module) = &args.module {
        config.module_path = module.clone();
    }
    if let Some(namespace) = &args.namespace {
        config = config.namespace(namespace.as_str());
    }
    if let Some(ms) = args.timeout_ms {
        config = config.submit_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

fn cmd_exported(sandbox: &WasmSandbox, config: GuestConfig, op: Op) -> Result<()> {
    info!("Loading exported guest {:?}", config.module_path);
    let mut module = ExportedModule::new(sandbox, &config).context("Failed to start guest")?;

    let value = match op {
        Op::Add { i, j } => module.add(i, j).context("add failed")?,
        Op::Cube { i } => module.cube(i).context("cube failed")?,
    };
    println!("{}", value);
    Ok(())
}

fn cmd_add(sandbox: &WasmSandbox, config: GuestConfig, i: i32, j: i32) -> Result<()> {
    info!("Starting add guest {:?}", config.module_path);
    let module = AddModule::new(sandbox, &config).context("Failed to start guest")?;

    let result = module.add(i, j);
    let outcome = module.close().context("Failed to stop guest")?;
    info!("Guest {}", outcome);

    println!("{}", result.context("add failed")?);
    Ok(())
}

fn cmd_cube(sandbox: &WasmSandbox, config: GuestConfig, values: Vec<i32>) -> Result<()> {
    info!("Starting cube guest {:?}", config.module_path);
    let module = CubeModule::new(sandbox, &config).context("Failed to start guest")?;

    for i in values {
        match module.cube(i) {
            Ok(value) => println!("{}", value),
            Err(e) => {
                warn!("cube({}) failed: {}", i, e);
                module.close().ok();
                return Err(e).with_context(|| format!("cube({}) failed", i));
            }
        }
    }

    let outcome = module.close().context("Failed to stop guest")?;
    info!("Guest {}", outcome);
    Ok(())
}

fn cmd_bench(
    sandbox: &WasmSandbox,
    exported: PathBuf,
    bridged: PathBuf,
    iterations: u32,
) -> Result<()> {
    let mut direct = ExportedModule::new(sandbox, &GuestConfig::exported(exported))
        .context("Failed to start exported guest")?;
    let cube = CubeModule::new(sandbox, &GuestConfig::imported(bridged))
        .context("Failed to start bridged guest")?;

    let mut direct_stats = WasmBenchmark::new("direct");
    let mut bridged_stats = WasmBenchmark::new("bridged");

    for n in 0..iterations {
        let i = n as i32;
        let a = direct_stats.time(|| direct.cube(i))?;
        let b = bridged_stats.time(|| cube.cube(i))?;
        if a != b {
            bail!("cube({}) disagrees: direct {} vs bridged {}", i, a, b);
        }
    }
    cube.close().context("Failed to stop bridged guest")?;

    println!("{}", direct_stats.summary());
    println!("{}", bridged_stats.summary());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = engine_config(cli.config.as_ref(), cli.fuel)?;
    let sandbox = WasmSandbox::new(config).context("Failed to create sandbox")?;

    match cli.command {
        Commands::Exported { guest, op } => cmd_exported(&sandbox, guest_config(&guest, true)?, op),

        Commands::Add { guest, i, j } => cmd_add(&sandbox, guest_config(&guest, false)?, i, j),

        Commands::Cube { guest, values } => {
            cmd_cube(&sandbox, guest_config(&guest, false)?, values)
        }

        Commands::Bench {
            exported,
            bridged,
            iterations,
        } => cmd_bench(&sandbox, exported, bridged, iterations),
    }
}
