// HTTP client for upstream APIs, with an optional response cache.
//
// The cache is meant for development: with a TTL set, repeated harvests against the same pages are
// answered locally instead of spending API quota. It can be persisted to a file between runs.

use http_cache_reqwest::{
    Cache, CacheMode, HttpCache, HttpCacheOptions, MokaCache, MokaCacheBuilder, MokaManager,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use std::{
    collections::hash_map::RandomState,
    fs::File,
    io::{BufReader, BufWriter, Write},
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, trace};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

type MCache = MokaCache<String, Arc<Vec<u8>>, RandomState>;

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    value: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct CacheBuilder {
    store: Vec<CacheEntry>,
}

impl CacheBuilder {
    fn with_capacity(cap: usize) -> Self {
        Self {
            store: Vec::with_capacity(cap),
        }
    }

    /// Try to populate the given cache with contents of the given file.
    /// If it fails to load the file, an error will be logged, and the cache will be returned
    /// unmodified.
    async fn populate_cache<P: AsRef<Path>>(path: P, cap: usize, cache: MCache) -> MCache {
        let mut this = Self::with_capacity(cap);
        if let Err(err) = this.load(path) {
            error!(%err, "Failed to load cache file");
            return cache; // unmodified
        }
        let mut cnt = 0;
        for e in this.store {
            cache.insert(e.key, Arc::new(e.value)).await;
            cnt += 1;
        }
        trace!("Loaded {} values into cache", cnt);
        cache
    }

    /// Copy the contents of the given cache into the internal Vec, for saving to file.
    async fn from_cache(cache: &MCache) -> Self {
        cache.run_pending_tasks().await;
        let mut this = Self::with_capacity(cache.entry_count() as usize);

        for (k, v) in cache.iter() {
            this.store.push(CacheEntry {
                key: (*k).clone(),
                value: (*v).clone(),
            });
        }
        trace!("Loaded {} values from cache", this.store.len());

        this
    }

    fn save<P: AsRef<Path>>(self, path: P) -> anyhow::Result<()> {
        let mut f = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(&self.store, &mut f, bincode::config::standard())?;
        f.flush()?;
        Ok(())
    }

    fn load<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        let mut f = BufReader::new(File::open(path)?);
        self.store = bincode::serde::decode_from_std_read(&mut f, bincode::config::standard())?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Opts {
    pub request_timeout: Duration,
    /// Zero disables the response cache
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub cache_path: Option<PathBuf>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            cache_ttl: Duration::ZERO,
            cache_capacity: 1000,
            cache_path: None,
        }
    }
}

impl Opts {
    fn cache_mode(&self) -> CacheMode {
        if self.cache_ttl.is_zero() {
            return CacheMode::NoStore;
        }
        // Search responses are private and carry no cache headers, so the usual rules would never
        // store them. Expiry is left to the TTL of the underlying cache.
        CacheMode::IgnoreRules
    }

    fn build_cache(&self) -> MCache {
        MokaCacheBuilder::new(self.cache_capacity as u64)
            .name("SearchResponseCache")
            .time_to_live(self.cache_ttl.max(Duration::from_secs(1)))
            .build()
    }

    fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::ClientBuilder::new()
            .user_agent(APP_USER_AGENT)
            .timeout(self.request_timeout)
            .build()
    }
}

#[derive(Clone)]
pub struct Client {
    client: ClientWithMiddleware,
    cache: MCache,
    cache_path: Option<PathBuf>,
}

impl Client {
    pub async fn build(opts: Opts) -> reqwest::Result<Self> {
        // if a file path is set, try to populate the cache from the file,
        // otherwise create empty cache
        let cache = match opts.cache_path.as_ref() {
            Some(p) if !opts.cache_ttl.is_zero() => {
                CacheBuilder::populate_cache(p, opts.cache_capacity, opts.build_cache()).await
            }
            _ => opts.build_cache(),
        };
        Ok(Self {
            client: ClientBuilder::new(opts.build_client()?)
                .with(Cache(HttpCache {
                    mode: opts.cache_mode(),
                    manager: MokaManager::new(cache.clone()),
                    options: HttpCacheOptions::default(),
                }))
                .build(),
            cache,
            // nothing is cached without a TTL, so don't overwrite an existing file with nothing
            cache_path: opts.cache_path.filter(|_| !opts.cache_ttl.is_zero()),
        })
    }

    pub async fn save(self) -> anyhow::Result<()> {
        // try to save to file if a path is given
        match self.cache_path {
            Some(p) => CacheBuilder::from_cache(&self.cache).await.save(p),
            None => {
                debug!("No cache file path set, unable to save");
                Ok(())
            }
        }
    }
}

impl Deref for Client {
    type Target = ClientWithMiddleware;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
