use std::path::PathBuf;

use clap::Parser;
use emp3r0r_cc::config::Workspace;
use emp3r0r_cc::{C2Server, RuntimeConfig};

#[derive(Parser)]
#[command(name = "emp3r0r-cc")]
#[command(about = "emp3r0r C2 server - authorized security testing only")]
struct Cli {
    /// Path to runtime configuration file (default: <workspace>/emp3r0r.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate default configuration file and exit
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.generate_config {
        let config = RuntimeConfig::default();
        config.save_to_file(&path)?;
        println!("default configuration written to: {}", path.display());
        return Ok(());
    }

    let workspace = Workspace::resolve()?;
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None if workspace.config_file.is_file() => RuntimeConfig::from_file(&workspace.config_file)?,
        None => RuntimeConfig::default(),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    emp3r0r_cc::logging::init_logging(log_level, config.log_format);

    workspace.init()?;
    if !workspace.config_file.is_file() {
        config.save_to_file(&workspace.config_file)?;
    }
    std::env::set_current_dir(&workspace.root)?;

    tracing::info!("emp3r0r C2 starting");
    tracing::info!("workspace: {}", workspace.root.display());
    tracing::info!("C2 host: {}:{}", config.cc_host, config.cc_port);

    let server = C2Server::new(workspace, config)?;
    server.run().await?;

    Ok(())
}
