use anyhow::{Context, Result};
use tracing::info;
use yelpdex::{
    cache,
    cli::HarvestCli,
    run,
    search::YelpClient,
    store::{PgStore, RestaurantStore},
};

#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env file is fine, everything can come from the environment or args
    dotenvy::dotenv().ok();
    let cli = HarvestCli::parse_args();
    cli.log.init_logger()?;

    let cfg = cli.config()?;

    let client = cache::Client::build(cfg.http.clone())
        .await
        .context("Failed to build HTTP client")?;
    let search = YelpClient::new(client.clone(), cfg.endpoint.clone(), &cfg.api_key);

    let store = PgStore::connect(&cfg.database_url, cfg.table.clone())
        .await
        .context("Failed to connect to database")?;
    store
        .check()
        .await
        .with_context(|| format!("Table {} is not usable", cfg.table))?;
    info!(table = %cfg.table, location = %cfg.harvest.location, "Writing to restaurant table");

    let summary = run::harvest_all(&search, &store, &cfg.harvest).await?;

    println!("\n==== Done ====");
    println!("{summary}");

    client.save().await
}
