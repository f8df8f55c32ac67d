use anyhow::Result;
use clap::Parser;
use druid_client::{ClientConfig, DruidClient, Filter, Interval, SelectQuery};
use std::time::Instant;
use tracing::{error, info, Level};

/// Run a sample select query against a Druid broker and print the rows
#[derive(Parser)]
#[command(name = "druid-select")]
#[command(about = "Select recent wikiticker edits from a Druid broker")]
struct Cli {
    /// Broker host:port (defaults to DRUID_BROKER or localhost:8082)
    host: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("Query failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::load()?;
    if let Some(host) = cli.host {
        config.broker = host;
    }
    info!("Querying broker {}", config.broker);

    let query = SelectQuery::builder()
        .data_source("wikiticker")
        .interval(Interval::parse("1000/3000")?)
        .filter(Filter::and(vec![
            Filter::selector("countryName", "United States"),
            Filter::selector("cityName", "San Francisco"),
        ]))
        .dimensions(["page", "user"])
        .threshold(50)
        .build()?;

    let client = DruidClient::create_with_config(config).await?;

    let start = Instant::now();
    let rows = client.execute(&query.into()).await?.collect_rows().await?;
    let elapsed = start.elapsed();

    for row in &rows {
        println!("{}", row);
    }
    println!("Fetched {} rows in {}ms.", rows.len(), elapsed.as_millis());

    client.close();
    Ok(())
}
