//! `axe` CLI entry point.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

use axe::{
    config::ConfigDefaults,
    layout,
    serve,
    simulator::Simctl,
};

/// SwiftUI live previews outside Xcode.
#[derive(Parser, Debug)]
#[command(name = "axe", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the preview serve backend on stdin/stdout.
    Serve(ServeArgs),

    /// Manage the isolated simulator device set.
    Devices {
        #[command(subcommand)]
        command: DeviceCommand,
    },
}

/// Fallback defaults for streams; `.axerc` fills anything left unset.
#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the .xcodeproj to build.
    #[arg(long, conflicts_with = "workspace")]
    project: Option<PathBuf>,

    /// Path to the .xcworkspace to build.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Scheme to build.
    #[arg(long)]
    scheme: Option<String>,

    /// Build configuration (defaults to the toolchain's Debug).
    #[arg(long)]
    configuration: Option<String>,

    /// Default device udid for streams that specify none.
    #[arg(long)]
    device: Option<String>,
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Devices in the isolated set.
    List,
    /// Device types and runtimes known to the simulator toolchain.
    ListAvailable,
    /// Create a device from a device type and runtime.
    Add {
        device_type_id: String,
        runtime_id: String,
    },
    /// Delete a device from the isolated set.
    Remove { udid: String },
    /// Record the default device used when commands specify none.
    SetDefault { udid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::config::HookBuilder::default()
        .display_location_section(false)
        .display_env_section(false)
        .install()?;

    // stdout carries the event protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            let defaults = ConfigDefaults {
                project_path: args.project,
                workspace_path: args.workspace,
                scheme: args.scheme,
                configuration: args.configuration,
                device: args.device,
            };
            serve::serve(defaults).await?;
        }
        Commands::Devices { command } => devices(command).await?,
    }
    Ok(())
}

async fn devices(command: DeviceCommand) -> Result<()> {
    let simctl = Simctl::new(layout::device_set_path(&layout::default_cache_root()))?;
    match command {
        DeviceCommand::List => {
            for device in simctl.list().await? {
                println!("{}  {:10}  {}", device.udid, device.state, device.name);
            }
        }
        DeviceCommand::ListAvailable => {
            let (types, runtimes) = simctl.list_available().await?;
            println!("Device types:");
            for device_type in types {
                println!("  {}", device_type.identifier);
            }
            println!("Runtimes:");
            for runtime in runtimes {
                let marker = if runtime.is_available { "" } else { " (unavailable)" };
                println!("  {}{marker}", runtime.identifier);
            }
        }
        DeviceCommand::Add { device_type_id, runtime_id } => {
            let udid = simctl.add(&device_type_id, &runtime_id).await?;
            println!("{udid}");
        }
        DeviceCommand::Remove { udid } => simctl.remove(&udid).await?,
        DeviceCommand::SetDefault { udid } => simctl.set_default(&udid).await?,
    }
    Ok(())
}
