//! `tnpu`: command-line front-end for the trusted NPU control plane.
//!
//! ```text
//! USAGE:
//!   tnpu ioctl-defines             Policy defines for every control command
//!   tnpu inspect <model>           Header and resource plan of a model image
//!   tnpu gen-model <out>           Write a synthetic model image
//!   tnpu simulate [model]          Run a model on the simulated platform
//!
//! ENVIRONMENT (simulate):
//!   TNPU_IRQ_TIMEOUT_MS  TNPU_MAX_HANDLES  TNPU_BACKEND
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tnpu_chip::uapi::{render_policy_defines, ControlCommand, UAPI_VERSION};
use tnpu_driver::simulator::PlatformBuilder;
use tnpu_driver::BackendSelection;
use tnpu_models::{ModelBuilder, ModelImage, SecurityType};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tnpu", about = "Trusted NPU control plane CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the access-control policy defines for the control commands.
    IoctlDefines {
        /// Also print a table of command numbers.
        #[arg(long)]
        table: bool,
    },
    /// Print the header and resource plan of a model image.
    Inspect {
        /// Model image path.
        model: PathBuf,
    },
    /// Write a synthetic model image.
    GenModel {
        /// Output path.
        out: PathBuf,
        /// Code bytes.
        #[arg(long, default_value_t = 4096)]
        code_size: usize,
        /// Constant pool bytes (0 for none).
        #[arg(long, default_value_t = 0)]
        pool: u32,
        /// Page-table pages.
        #[arg(long, default_value_t = 16)]
        page_table_pages: u32,
        /// Operations per layer; enables profiling mode.
        #[arg(long, value_delimiter = ',')]
        layers: Vec<u32>,
        /// Build a secure (encrypted) model for this key set.
        #[arg(long)]
        secure_key_set: Option<u32>,
    },
    /// Run a model on the simulated platform and print the device state.
    Simulate {
        /// Model image path; a synthetic model is used when omitted.
        model: Option<PathBuf>,
        /// Secure channel backend (generic | vendor); overrides `TNPU_BACKEND`.
        #[arg(long)]
        backend: Option<String>,
        /// Number of runs.
        #[arg(long, default_value_t = 1)]
        runs: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::IoctlDefines { table } => cmd_ioctl_defines(table),
        Cmd::Inspect { model } => cmd_inspect(&model)?,
        Cmd::GenModel {
            out,
            code_size,
            pool,
            page_table_pages,
            layers,
            secure_key_set,
        } => {
            let mut builder = ModelBuilder::new()
                .code(vec![0; code_size])
                .page_table_pages(page_table_pages);
            if pool > 0 {
                builder = builder.pool(pool);
            }
            if !layers.is_empty() {
                builder = builder.profiling(layers);
            }
            if let Some(key_set) = secure_key_set {
                builder = builder.security(SecurityType::Secure, key_set);
            }
            cmd_gen_model(&out, &builder)?;
        }
        Cmd::Simulate {
            model,
            backend,
            runs,
        } => cmd_simulate(model.as_deref(), backend.as_deref(), runs)?,
    }

    Ok(())
}

fn cmd_ioctl_defines(table: bool) {
    if table {
        println!("# control surface version {UAPI_VERSION}");
        for cmd in ControlCommand::ALL {
            println!("# {:>2}  0x{:08x}  {}", cmd.nr(), cmd.number(), cmd.symbol());
        }
    }
    print!("{}", render_policy_defines());
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let model = ModelImage::from_file(path)
        .with_context(|| format!("reading model {}", path.display()))?;
    let header = model.header();
    let sizing = model.sizing();

    println!("Model        : {}", path.display());
    println!("Format       : v{}", header.format_version);
    println!("Security     : {:?} (key set {})", header.security, header.key_set);
    println!("Mode         : {:?}", header.execution_mode);
    println!("Hardware     : target {}", header.hardware_target);
    println!("Public data  : {} B", header.public_data_length());
    println!("Payload      : {} B", model.payload().len());
    println!("Code region  : {} B", sizing.code_size);
    println!("Page table   : {} B", sizing.page_table_size);
    if sizing.pool_size > 0 {
        println!("Pool region  : {} B", sizing.pool_size);
    }
    if sizing.profiling {
        println!("Profile      : {} B", sizing.profile_size);
        for (layer, ops) in model.resources().layer_operations.iter().enumerate() {
            println!("  layer {layer:>3}: {ops} operation(s)");
        }
    }
    Ok(())
}

fn cmd_gen_model(out: &Path, builder: &ModelBuilder) -> Result<()> {
    let image = builder.build();
    std::fs::write(out, &image).with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {} ({} bytes)", out.display(), image.len());
    Ok(())
}

fn cmd_simulate(model: Option<&Path>, backend: Option<&str>, runs: u32) -> Result<()> {
    if runs == 0 {
        bail!("--runs must be at least 1");
    }
    let image = match model {
        Some(path) => ModelImage::from_file(path)
            .with_context(|| format!("reading model {}", path.display()))?
            .as_bytes()
            .clone(),
        None => ModelBuilder::new()
            .code(vec![0; 4096])
            .page_table_pages(16)
            .profiling(vec![4, 8, 2])
            .build(),
    };

    let mut builder = PlatformBuilder::from_env().context("reading TNPU_* settings")?;
    if let Some(backend) = backend {
        builder = builder.backend(backend.parse::<BackendSelection>()?);
    }
    let platform = builder.build()?;
    let device = platform.device();
    let session = device.open_session(std::process::id())?;
    info!("simulating on the {} backend", device.channel().backend_type());

    let nid = session.create_network(&image)?;
    let input = session.create_io_buffer(4096)?;
    let output = session.create_io_buffer(4096)?;
    let in_aid = session.attach_io_buffer(nid, input.bid)?;
    let out_aid = session.attach_io_buffer(nid, output.bid)?;
    session.set_input(nid, in_aid, 0)?;
    session.set_output(nid, out_aid, 0)?;

    for run in 1..=runs {
        let report = session.run_network(nid)?;
        println!(
            "run {run:>3}: status {:#010x}, {} us",
            report.status, report.elapsed_us
        );
        for layer in &report.layers {
            println!(
                "           layer {:>3}: {:>4} op(s), {:>8} cycles, {:>6} us",
                layer.layer, layer.operations, layer.cycles, layer.time_us
            );
        }
    }

    println!();
    print!("{}", device.snapshot());
    Ok(())
}
