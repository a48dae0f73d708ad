use clap::Parser;
use std::net::Ipv4Addr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use siper::blocklist::Blocklist;
use siper::config::{CliArgs, Command, Config};
use siper::replay::{build_engine, read_frames, replay};
use siper::PrometheusExporter;

fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Command::Add {
            cidr,
            comment,
            source,
            disabled,
        } => {
            let path = &config.blocklist_path;
            let mut blocklist = Blocklist::load_or_new(path)?;
            let rule = blocklist.add_cidr(&cidr, &source, &comment, !disabled)?;
            blocklist.save(path)?;
            tracing::info!("added {} ({}) to {}", rule.cidr, rule.id, path.display());
        }
        Command::Del { cidr, id } => {
            let path = &config.blocklist_path;
            let mut blocklist = Blocklist::load(path)?;
            let rule = match (cidr, id) {
                (Some(cidr), _) => blocklist.delete_by_cidr(&cidr)?,
                (None, Some(id)) => blocklist.delete_by_id(&id)?,
                (None, None) => anyhow::bail!("either --cidr or --id is required"),
            };
            blocklist.save(path)?;
            tracing::info!("deleted {} ({}) from {}", rule.cidr, rule.id, path.display());
        }
        Command::List => {
            let blocklist = Blocklist::load(&config.blocklist_path)?;
            for rule in &blocklist.rules {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    rule.id,
                    rule.cidr,
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.source,
                    rule.comment
                );
            }
        }
        Command::Check { address } => {
            let engine = build_engine(&config)?;
            match engine.table().longest_match(u32::from(address)) {
                Some((prefix, blocked)) => println!(
                    "{} matches {}/{}: {}",
                    address,
                    Ipv4Addr::from(prefix.data),
                    prefix.prefix_len,
                    if blocked { "blocked" } else { "allowed" }
                ),
                None => println!("{address}: no match"),
            }
        }
        Command::Replay { file } => {
            let engine = build_engine(&config)?;
            let frames = read_frames(&file)?;
            let dropped = replay(&engine, &frames, config.shards)?;
            tracing::info!(
                frames = frames.len(),
                dropped,
                workers = config.shards.max(1),
                "replay finished"
            );
            let mut exporter = PrometheusExporter::new();
            print!("{}", exporter.encode(&engine.get_metrics())?);
        }
    }

    Ok(())
}
