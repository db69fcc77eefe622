use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use lb_control_plane::admin::{set_draining, Publisher};
use lb_control_plane::config::loader::load_groups_file;
use lb_control_plane::config::schema::{StoreBackend, StoreConfig};
use lb_control_plane::store;

#[derive(Parser)]
#[command(name = "lbctl")]
#[command(about = "Management CLI for the load-balancer control plane", long_about = None)]
struct Cli {
    /// Base URL of a node's API.
    #[arg(short, long, default_value = "http://localhost:9000")]
    url: String,

    /// etcd endpoint for commands that write to the store.
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    etcd: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node status
    Status,
    /// Resolve LB node addresses
    Resolve {
        #[arg(short, long)]
        locality: Option<String>,
    },
    /// Show one group's backends
    Group { name: String },
    /// Validate a groups file without publishing it
    Validate { file: PathBuf },
    /// Publish a groups file to the store
    Publish { file: PathBuf },
    /// Put a backend into DRAINING
    Drain { group: String, backend: String },
    /// Take a backend out of DRAINING
    Undrain { group: String, backend: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Status => {
            let res = client.get(format!("{}/status", cli.url)).send().await?;
            print_response(res).await?;
        }
        Commands::Resolve { locality } => {
            let mut req = client.get(format!("{}/resolve", cli.url));
            if let Some(locality) = locality {
                req = req.query(&[("locality", locality)]);
            }
            print_response(req.send().await?).await?;
        }
        Commands::Group { name } => {
            let res = client.get(format!("{}/groups/{}", cli.url, name)).send().await?;
            print_response(res).await?;
        }
        Commands::Validate { file } => {
            let groups = load_groups_file(&file)?;
            println!("{} group(s) valid", groups.groups.len());
        }
        Commands::Publish { file } => {
            let groups = load_groups_file(&file)?;
            let config = store_config(cli.etcd);
            let handle = store::connect(&config).await?;
            let report = Publisher::new(handle, &config).publish(&groups).await?;
            println!(
                "published {:?}, unchanged {}, removed {:?}, skipped {:?}, drained {}, undrained {}",
                report.published,
                report.unchanged,
                report.removed,
                report.skipped,
                report.drained,
                report.undrained
            );
        }
        Commands::Drain { group, backend } => {
            drain(cli.etcd, &group, &backend, true).await?;
        }
        Commands::Undrain { group, backend } => {
            drain(cli.etcd, &group, &backend, false).await?;
        }
    }

    Ok(())
}

fn store_config(endpoints: Vec<String>) -> StoreConfig {
    StoreConfig {
        backend: StoreBackend::Etcd,
        endpoints,
        ..StoreConfig::default()
    }
}

async fn drain(
    endpoints: Vec<String>,
    group: &str,
    backend: &str,
    draining: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = store_config(endpoints);
    let handle = store::connect(&config).await?;
    match set_draining(handle.as_ref(), group, backend, draining, config.cas_max_attempts).await? {
        Some(t) => println!("{}/{}: {} -> {}", group, backend, t.from, t.to),
        None => println!("{}/{}: unchanged", group, backend),
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if status.is_success() {
        let json: Value = res.json().await?;
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("Error: {} - {}", status, res.text().await?);
    }
    Ok(())
}
