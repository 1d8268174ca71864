use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{self, BufWriter},
    path::Path,
};
use tracing::info;
use yelpdex::{
    cli::ExportCli,
    export,
    store::{PgStore, RestaurantStore},
};

#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = ExportCli::parse_args();
    cli.log.init_logger()?;

    let cfg = cli.config()?;

    let store = PgStore::connect(&cfg.database_url, cfg.table.clone())
        .await
        .context("Failed to connect to database")?;
    store
        .check()
        .await
        .with_context(|| format!("Table {} is not usable", cfg.table))?;

    // the whole table is read before anything is written
    let rows = export::scan_all(&store, cfg.scan_page_size).await?;

    let written = if cfg.output == Path::new("-") {
        export::write_bulk(&rows, &cfg.index, io::stdout().lock())?
    } else {
        let f = File::create(&cfg.output)
            .with_context(|| format!("Failed to create {}", cfg.output.display()))?;
        export::write_bulk(&rows, &cfg.index, BufWriter::new(f))?
    };
    info!(
        scanned = rows.len(),
        written,
        output = %cfg.output.display(),
        "Bulk file written"
    );

    // keep stdout clean for the bulk data when that's where it went
    if cfg.output == Path::new("-") {
        eprintln!("Generated {} restaurants", rows.len());
    } else {
        println!("Generated {} restaurants", rows.len());
    }

    Ok(())
}
