use crate::{
    build, cache,
    config::{
        ConfigError, DEFAULT_CUISINES, DEFAULT_ENDPOINT, DEFAULT_LOCATION, DEFAULT_TABLE,
        DEFAULT_TARGET, ExportConfig, HarvestConfig, HarvestOpts, MAX_OFFSET, MAX_PAGE_SIZE,
    },
    export::{DEFAULT_INDEX, DEFAULT_SCAN_PAGE_SIZE},
    harvest::RetryPolicy,
};
use anyhow::{Error, Result};
use clap::{Args, Parser, ValueEnum};
use clap_verbosity_flag::log::LevelFilter;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use compact_str::CompactString;
use std::{io, path::PathBuf};
use tracing_subscriber::filter::LevelFilter as TFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum LogFormat {
    Normal,
    Compact,
    Pretty,
    #[default]
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct LogOpts {
    /// Log level verbosity
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Which log formatter to use
    // env will pick up the value if the field name is given as the key in uppercase
    #[arg(short = 'f', long, env, default_value_t, value_enum)]
    pub log_format: LogFormat,
}

impl LogOpts {
    /// Maps clap_verbosity_flag::LevelFilter values to tracing_subscriber::filter::LevelFilter
    /// values
    fn tracing_level_filter(&self) -> TFilter {
        match self.verbosity.log_level_filter() {
            LevelFilter::Off => TFilter::OFF,
            LevelFilter::Error => TFilter::ERROR,
            LevelFilter::Warn => TFilter::WARN,
            LevelFilter::Info => TFilter::INFO,
            LevelFilter::Debug => TFilter::DEBUG,
            LevelFilter::Trace => TFilter::TRACE,
        }
    }

    pub fn init_logger(&self) -> Result<()> {
        let layer = match self.log_format {
            LogFormat::Json => fmt::layer().json().with_writer(io::stderr).boxed(),
            LogFormat::Pretty => fmt::layer().pretty().with_writer(io::stderr).boxed(),
            LogFormat::Compact => fmt::layer()
                .without_time()
                .compact()
                .with_writer(io::stderr)
                .boxed(),
            LogFormat::Normal => fmt::layer().with_writer(io::stderr).boxed(),
        };
        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(self.tracing_level_filter().into())
                    .from_env()?,
            )
            .with(layer)
            .init();
        Ok(())
    }
}

/// Harvest restaurants per cuisine from Yelp into the restaurant table
#[derive(Debug, Clone, Parser)]
#[command(author, version, long_version = build::CLAP_LONG_VERSION, about, long_about = None)]
pub struct HarvestCli {
    #[command(flatten)]
    pub log: LogOpts,

    /// Yelp Fusion API key
    #[arg(long, env = "YELP_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Business search endpoint
    #[arg(long, env = "YELP_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: Url,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, default_value = "postgres://localhost/yelpdex")]
    pub database_url: String,

    /// Table to upsert restaurants into
    #[arg(long, env = "RESTAURANT_TABLE", default_value = DEFAULT_TABLE)]
    pub table: String,

    /// Where to search
    #[arg(short, long, default_value = DEFAULT_LOCATION)]
    pub location: String,

    /// Cuisines to harvest, in order
    #[arg(short, long, value_delimiter = ',', default_values = DEFAULT_CUISINES)]
    pub cuisines: Vec<CompactString>,

    /// Max number of restaurants per cuisine
    #[arg(short, long, default_value_t = DEFAULT_TARGET)]
    pub target: usize,

    /// Results per search request
    #[arg(long, default_value_t = MAX_PAGE_SIZE)]
    pub page_size: usize,

    /// Stop paging a cuisine at this offset
    #[arg(long, default_value_t = MAX_OFFSET)]
    pub max_offset: usize,

    /// Pause after every search request
    #[arg(long, default_value = "350ms")]
    pub request_delay: humantime::Duration,

    /// Add a random pause of up to this much after every search request
    #[arg(long, default_value = "0s")]
    pub request_jitter: humantime::Duration,

    /// Wait this long before resending a rate limited request
    #[arg(long, default_value = "2s")]
    pub rate_limit_backoff: humantime::Duration,

    /// Backoff multiplier for each further retry
    #[arg(long, default_value_t = 1)]
    pub rate_limit_multiplier: u32,

    /// How many times a rate limited request is resent
    #[arg(long, default_value_t = 1)]
    pub max_retries: u32,

    /// Timeout for a single search request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Keep search responses this long, 0 to not cache at all
    #[arg(long, env, default_value = "0s")]
    pub cache_ttl: humantime::Duration,

    /// Max number of cached responses
    #[arg(long, default_value_t = 1000)]
    pub cache_capacity: usize,

    /// File to load the response cache from at start, and save it to when done
    #[arg(long, env)]
    pub cache_path: Option<PathBuf>,
}

impl HarvestCli {
    /// Wrapper for clap::Parser::try_parse_from
    pub fn try_parse_opts<I, T>(itr: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(itr).map_err(Error::from)
    }

    // this thin wrapper makes it possible to do the parsing without importing clap::Parser at the
    // call site
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check and convert the arguments. Fails on a missing API key, before anything else is done.
    pub fn config(&self) -> Result<HarvestConfig, ConfigError> {
        let api_key = match self.api_key.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => return Err(ConfigError::MissingApiKey),
        };
        let harvest = HarvestOpts {
            location: self.location.clone(),
            cuisines: self.cuisines.clone(),
            target: self.target,
            page_size: self.page_size,
            max_offset: self.max_offset,
            request_delay: *self.request_delay,
            request_jitter: *self.request_jitter,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff: *self.rate_limit_backoff,
                multiplier: self.rate_limit_multiplier,
            },
        }
        .validate()?;

        Ok(HarvestConfig {
            api_key,
            endpoint: self.endpoint.clone(),
            database_url: self.database_url.clone(),
            table: self.table.parse()?,
            http: cache::Opts {
                request_timeout: *self.request_timeout,
                cache_ttl: *self.cache_ttl,
                cache_capacity: self.cache_capacity,
                cache_path: self.cache_path.clone(),
            },
            harvest,
        })
    }
}

/// Export the restaurant table as a bulk indexing file
#[derive(Debug, Clone, Parser)]
#[command(author, version, long_version = build::CLAP_LONG_VERSION, about, long_about = None)]
pub struct ExportCli {
    #[command(flatten)]
    pub log: LogOpts,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, default_value = "postgres://localhost/yelpdex")]
    pub database_url: String,

    /// Table to read restaurants from
    #[arg(long, env = "RESTAURANT_TABLE", default_value = DEFAULT_TABLE)]
    pub table: String,

    /// Bulk file to write, "-" for stdout
    #[arg(short, long, default_value = "bulk_data.txt")]
    pub output: PathBuf,

    /// Index named in the action lines
    #[arg(short, long, default_value = DEFAULT_INDEX)]
    pub index: String,

    /// Rows fetched per scan request
    #[arg(long, default_value_t = DEFAULT_SCAN_PAGE_SIZE)]
    pub scan_page_size: usize,
}

impl ExportCli {
    /// Wrapper for clap::Parser::try_parse_from
    pub fn try_parse_opts<I, T>(itr: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(itr).map_err(Error::from)
    }

    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn config(&self) -> Result<ExportConfig, ConfigError> {
        Ok(ExportConfig {
            database_url: self.database_url.clone(),
            table: self.table.parse()?,
            output: self.output.clone(),
            index: self.index.clone(),
            scan_page_size: self.scan_page_size.max(1),
        })
    }
}
