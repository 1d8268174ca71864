use crate::{cache, harvest::RetryPolicy};
use compact_str::CompactString;
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://api.yelp.com/v3/businesses/search";
pub const DEFAULT_TABLE: &str = "yelp_restaurants";
pub const DEFAULT_LOCATION: &str = "Manhattan, NY";
pub const DEFAULT_CUISINES: [&str; 6] = [
    "chinese",
    "italian",
    "mexican",
    "thai",
    "indian",
    "mediterranean",
];
pub const DEFAULT_TARGET: usize = 200;
/// Largest page Yelp will hand out
pub const MAX_PAGE_SIZE: usize = 50;
/// Yelp refuses offsets at or past this
pub const MAX_OFFSET: usize = 1000;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("set YELP_API_KEY with your Yelp Fusion API key")]
    MissingApiKey,
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),
    #[error("per cuisine target must be greater than zero")]
    InvalidTarget,
    #[error("page size must be between 1 and 50, got {0}")]
    InvalidPageSize(usize),
    #[error("no cuisines given")]
    NoCuisines,
}

/// A table identifier that is safe to splice into SQL. Optionally schema qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(DEFAULT_TABLE.into())
    }
}

impl FromStr for TableName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid_part = |p: &str| {
            let mut chars = p.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
            return Err(ConfigError::InvalidTable(s.into()));
        }
        Ok(Self(s.into()))
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Knobs for the per cuisine pagination loop and the run over all cuisines
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestOpts {
    /// Free form location, as understood by Yelp
    pub location: String,
    /// Cuisine terms, harvested in this order
    pub cuisines: Vec<CompactString>,
    /// Max number of records per cuisine
    pub target: usize,
    pub page_size: usize,
    pub max_offset: usize,
    /// Pause after every search request
    pub request_delay: Duration,
    /// Random extra pause, up to this much, added to request_delay
    pub request_jitter: Duration,
    pub retry: RetryPolicy,
}

impl Default for HarvestOpts {
    fn default() -> Self {
        Self {
            location: DEFAULT_LOCATION.into(),
            cuisines: DEFAULT_CUISINES.iter().map(|&c| c.into()).collect(),
            target: DEFAULT_TARGET,
            page_size: MAX_PAGE_SIZE,
            max_offset: MAX_OFFSET,
            request_delay: Duration::from_millis(350),
            request_jitter: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

impl HarvestOpts {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.target == 0 {
            return Err(ConfigError::InvalidTarget);
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidPageSize(self.page_size));
        }
        if self.cuisines.is_empty() {
            return Err(ConfigError::NoCuisines);
        }
        Ok(self)
    }
}

/// Everything the harvester binary needs, checked before any I/O happens
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_key: String,
    pub endpoint: Url,
    pub database_url: String,
    pub table: TableName,
    pub http: cache::Opts,
    pub harvest: HarvestOpts,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub database_url: String,
    pub table: TableName,
    /// Where to write the bulk file, "-" for stdout
    pub output: PathBuf,
    /// Target index named in every action line
    pub index: String,
    pub scan_page_size: usize,
}
