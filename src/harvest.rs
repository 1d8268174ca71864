// Pagination and deduplication for a single cuisine.
//
// Yelp hands out at most 50 businesses per request, and nothing past offset 1000, so each cuisine
// is harvested by walking the offset forward page by page until either the target is reached or
// upstream runs dry. Ids are deduplicated both within the cuisine and against every cuisine
// harvested earlier in the same run, the first cuisine to see an id keeps it.

use crate::{
    config::HarvestOpts,
    models::{RestaurantRecord, yelp::SearchResponse},
    search::{BusinessSearch, SearchError, SearchQuery},
};
use rand::Rng;
use std::{collections::HashSet, time::Duration};
use tracing::{debug, error, info, instrument, warn};

/// Number of strikes, empty pages or pages without anything new, before giving up on a cuisine
const MAX_EMPTY_PAGES: u32 = 3;

/// Bounded retry on rate limiting. The delay before retry n (counting from 0) is
/// `backoff * multiplier^n`, so a multiplier of 1 gives a fixed backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_secs(2),
            multiplier: 1,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(self.multiplier.saturating_pow(retry))
    }
}

/// Ids claimed so far in a run, across all cuisines
#[derive(Debug, Clone, Default)]
pub struct SeenIds(HashSet<String>);

impl SeenIds {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    /// Returns false if the id was already claimed
    pub fn insert(&mut self, id: String) -> bool {
        self.0.insert(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why the pagination loop for a cuisine ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    /// Too many empty pages
    Exhausted,
    /// Too many pages where everything was already seen
    NoNewResults,
    /// Upstream won't page any further
    MaxOffset,
    /// A search failed for good; what was collected before is kept
    QueryFailed,
}

#[derive(Debug, Clone)]
pub struct CuisineHarvest {
    pub records: Vec<RestaurantRecord>,
    pub stop: StopReason,
    /// Offset the next request would have used
    pub offset: usize,
    /// Successful search requests made
    pub pages: usize,
}

pub struct Harvester<'a, S> {
    search: &'a S,
    opts: &'a HarvestOpts,
}

impl<'a, S: BusinessSearch> Harvester<'a, S> {
    pub fn new(search: &'a S, opts: &'a HarvestOpts) -> Self {
        Self { search, opts }
    }

    /// Page through search results for the given cuisine until the target is met or upstream
    /// stops giving anything new. Every new id is added to `seen`.
    #[instrument(skip(self, seen), fields(target = self.opts.target))]
    pub async fn harvest_cuisine(&self, cuisine: &str, seen: &mut SeenIds) -> CuisineHarvest {
        let target = self.opts.target;
        let tag = cuisine.to_lowercase();
        // upstream can't hand out more than max_offset results anyway
        let mut records = Vec::with_capacity(target.min(self.opts.max_offset));
        let mut local_seen = HashSet::new();
        let mut offset = 0;
        let mut consecutive_empty = 0;
        let mut pages = 0;

        let stop = loop {
            if records.len() >= target {
                break StopReason::TargetReached;
            }

            let limit = self.opts.page_size.min(target - records.len());
            let query = SearchQuery::category(cuisine, &self.opts.location, limit, offset);
            let page = match self.search_with_retry(&query).await {
                Ok(page) => page,
                Err(err) => {
                    error!(%err, offset, "Search failed, giving up on cuisine");
                    break StopReason::QueryFailed;
                }
            };
            pages += 1;

            if page.businesses.is_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= MAX_EMPTY_PAGES {
                    info!(offset, "No more results available");
                    break StopReason::Exhausted;
                }
            } else {
                consecutive_empty = 0;
            }

            let mut new_in_page = 0;
            for b in page.businesses {
                let id = match &b.id {
                    Some(id) if !id.is_empty() && !seen.contains(id) && !local_seen.contains(id) => {
                        id.clone()
                    }
                    _ => continue,
                };
                let Some(record) = RestaurantRecord::from_business(b, &tag) else {
                    continue;
                };
                records.push(record);
                local_seen.insert(id.clone());
                seen.insert(id);
                new_in_page += 1;

                if records.len() >= target {
                    break;
                }
            }

            debug!(
                collected = records.len(),
                offset,
                new = new_in_page,
                "Page processed"
            );

            // counts towards the same limit as empty pages, even when the page was also empty
            if new_in_page == 0 {
                consecutive_empty += 1;
                if consecutive_empty >= MAX_EMPTY_PAGES {
                    info!(offset, "Too many pages with no new restaurants");
                    break StopReason::NoNewResults;
                }
            }

            offset += limit;
            self.pause().await;

            if offset >= self.opts.max_offset {
                info!(offset, collected = records.len(), "Reached max offset");
                break StopReason::MaxOffset;
            }
        };

        CuisineHarvest {
            records,
            stop,
            offset,
            pages,
        }
    }

    /// Resend the same query after a backoff while rate limited, as long as the retry policy
    /// allows. Any other error is returned right away.
    async fn search_with_retry(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        let mut retry = 0;
        loop {
            match self.search.search(query).await {
                Err(err) if err.is_rate_limited() && retry < self.opts.retry.max_retries => {
                    let delay = self.opts.retry.delay(retry);
                    warn!(?delay, offset = query.offset, "Rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                res => return res,
            }
        }
    }

    // Throttle requests to stay under the upstream rate limit
    async fn pause(&self) {
        let mut delay = self.opts.request_delay;
        if !self.opts.request_jitter.is_zero() {
            delay += rand::rng().random_range(Duration::ZERO..=self.opts.request_jitter);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::yelp::Business,
        search::fake::{FakeSearch, Reply},
    };

    fn opts() -> HarvestOpts {
        HarvestOpts {
            request_delay: Duration::ZERO,
            retry: RetryPolicy {
                backoff: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ids(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("{prefix}-{i}")).collect()
    }

    fn page(ids: &[String]) -> Reply {
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        Reply::ids(&ids)
    }

    fn unique_page(q: &SearchQuery) -> Reply {
        page(&ids(&format!("p{}", q.offset), 0..q.limit))
    }

    #[test]
    fn retry_policy_delay() {
        let fixed = RetryPolicy::default();
        assert_eq!(Duration::from_secs(2), fixed.delay(0));
        assert_eq!(Duration::from_secs(2), fixed.delay(3));

        let exp = RetryPolicy {
            max_retries: 4,
            backoff: Duration::from_millis(500),
            multiplier: 2,
        };
        assert_eq!(Duration::from_millis(500), exp.delay(0));
        assert_eq!(Duration::from_secs(4), exp.delay(3));
    }

    #[tokio::test]
    async fn reaches_target_with_shrinking_last_page() {
        let opts = HarvestOpts {
            target: 120,
            ..opts()
        };
        let search = FakeSearch::default().with_fallback(unique_page);
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("Thai", &mut seen)
            .await;

        assert_eq!(StopReason::TargetReached, h.stop);
        assert_eq!(120, h.records.len());
        assert_eq!(120, seen.len());
        assert!(h.records.iter().all(|r| r.cuisine == "thai"));

        let queries = search.queries();
        let limits: Vec<usize> = queries.iter().map(|q| q.limit).collect();
        let offsets: Vec<usize> = queries.iter().map(|q| q.offset).collect();
        assert_eq!(vec![50, 50, 20], limits);
        assert_eq!(vec![0, 50, 100], offsets);
        assert_eq!(120, h.offset);
        assert!(queries.iter().all(|q| q.categories.as_deref() == Some("Thai")));
    }

    #[tokio::test]
    async fn three_empty_pages_collect_nothing() {
        let search = FakeSearch::new(vec![Reply::empty(), Reply::empty(), Reply::empty()]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::Exhausted, h.stop);
        assert!(h.records.is_empty());
        // an empty page also has nothing new, so each one is counted twice
        assert_eq!(2, search.queries().len());
    }

    #[tokio::test]
    async fn offset_advances_on_pages_without_new_records() {
        // the same 50 ids on every page: each page resets the empty count before adding to it,
        // so only the max offset ends the walk
        let search = FakeSearch::default().with_fallback(|_| page(&ids("a", 0..50)));
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::MaxOffset, h.stop);
        assert_eq!(50, h.records.len());
        let offsets: Vec<usize> = search.queries().iter().map(|q| q.offset).collect();
        assert_eq!((0..20).map(|i| i * 50).collect::<Vec<_>>(), offsets);
        assert_eq!(1000, h.offset);
    }

    #[tokio::test]
    async fn duplicate_pages_between_new_ones_still_reach_target() {
        let dup = ids("a", 0..50);
        let search = FakeSearch::new(vec![
            page(&dup),
            page(&dup),
            page(&ids("b", 0..50)),
            page(&dup),
            page(&ids("c", 0..50)),
            page(&dup),
            page(&ids("d", 0..50)),
        ]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::TargetReached, h.stop);
        assert_eq!(200, h.records.len());
        assert_eq!(7, search.queries().len());
    }

    #[tokio::test]
    async fn non_empty_page_restarts_empty_count() {
        let search = FakeSearch::new(vec![Reply::empty(), Reply::ids(&["a"]), Reply::empty()]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        // the fourth query, another empty page, is what ends it
        assert_eq!(StopReason::Exhausted, h.stop);
        assert_eq!(1, h.records.len());
        assert_eq!(4, search.queries().len());
    }

    #[tokio::test]
    async fn duplicate_page_then_empty_page_stops() {
        let search = FakeSearch::new(vec![
            Reply::ids(&["a"]),
            Reply::ids(&["a"]),
            Reply::empty(),
        ]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::NoNewResults, h.stop);
        assert_eq!(1, h.records.len());
        assert_eq!(3, search.queries().len());
    }

    #[tokio::test]
    async fn huge_target_does_not_preallocate() {
        let search = FakeSearch::default();
        let opts = HarvestOpts {
            target: usize::MAX,
            ..opts()
        };
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::Exhausted, h.stop);
        assert!(h.records.is_empty());
    }

    #[tokio::test]
    async fn max_offset_keeps_partial_results() {
        // 7 new ids per page of 50: after 20 pages offset is 1000, with 140 collected
        let search = FakeSearch::default().with_fallback(|q| {
            let mut businesses: Vec<Business> = ids(&format!("p{}", q.offset), 0..7)
                .iter()
                .map(|id| Business::new(id))
                .collect();
            businesses.resize(q.limit, Business::default());
            Reply::Page(businesses)
        });
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::MaxOffset, h.stop);
        assert_eq!(140, h.records.len());
        assert_eq!(20, search.queries().len());
        assert_eq!(1000, h.offset);
    }

    #[tokio::test]
    async fn global_seen_ids_are_skipped() {
        let search = FakeSearch::new(vec![Reply::ids(&["a", "b", "c", "d"])]);
        let opts = HarvestOpts {
            target: 2,
            ..opts()
        };
        let mut seen = SeenIds::new();
        seen.insert("a".into());

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        let got: Vec<&str> = h.records.iter().map(|r| r.business_id.as_str()).collect();
        assert_eq!(vec!["b", "c"], got);
        assert!(!seen.contains("d"));
        assert_eq!(3, seen.len());
    }

    #[tokio::test]
    async fn duplicates_within_a_page_and_missing_ids_are_skipped() {
        let mut businesses = vec![
            Business::new("a"),
            Business::new("a"),
            Business::default(),
            Business::new("b"),
        ];
        businesses[2].name = Some("No id".into());
        let search = FakeSearch::new(vec![Reply::Page(businesses)]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        let got: Vec<&str> = h.records.iter().map(|r| r.business_id.as_str()).collect();
        assert_eq!(vec!["a", "b"], got);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_once() {
        let search = FakeSearch::new(vec![Reply::RateLimited, Reply::ids(&["a", "b"])]);
        let opts = HarvestOpts {
            target: 2,
            ..opts()
        };
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::TargetReached, h.stop);
        assert_eq!(2, h.records.len());
        let queries = search.queries();
        assert_eq!(2, queries.len());
        assert_eq!(queries[0], queries[1]);
    }

    #[tokio::test]
    async fn second_rate_limit_gives_up_keeping_results() {
        let search = FakeSearch::new(vec![
            Reply::ids(&["a", "b"]),
            Reply::RateLimited,
            Reply::RateLimited,
            Reply::ids(&["c"]),
        ]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::QueryFailed, h.stop);
        assert_eq!(2, h.records.len());
        assert_eq!(3, search.queries().len());
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let search = FakeSearch::new(vec![Reply::ids(&["a"]), Reply::Fail, Reply::ids(&["b"])]);
        let opts = opts();
        let mut seen = SeenIds::new();

        let h = Harvester::new(&search, &opts)
            .harvest_cuisine("thai", &mut seen)
            .await;

        assert_eq!(StopReason::QueryFailed, h.stop);
        assert_eq!(1, h.records.len());
        assert_eq!(2, search.queries().len());
        assert_eq!(1, h.pages);
    }
}
