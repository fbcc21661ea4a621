use std::path::PathBuf;

use clap::Parser;

use petrel_daemon::bootstrap;
use petrel_daemon::config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "petreld", about = "petrel bundle node daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local endpoint id; overrides the config file.
    #[arg(long)]
    eid: Option<String>,

    /// Database directory; overrides the config file.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => DaemonConfig::from_path(path)?,
        None => DaemonConfig::from_toml("local_eid = \"dtn://petrel\"").expect("builtin config"),
    };
    if let Some(eid) = args.eid {
        config.local_eid = eid;
    }
    if let Some(db) = args.db {
        config.db_dir = Some(db);
    }

    let runtime = bootstrap::bootstrap(config).await?;
    log::info!("petreld: node {} running", runtime.local_eid);

    tokio::signal::ctrl_c().await?;
    log::info!("petreld: interrupt, shutting down");
    runtime.handle.shutdown();
    let _ = runtime.join.await;
    Ok(())
}
