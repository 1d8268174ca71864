use crate::{cache::Client, models::yelp::SearchResponse};
use reqwest::StatusCode;
use tracing::{error, trace};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    /// 429 Too Many Requests
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("failed reading response body: {0}")]
    Body(#[from] reqwest::Error),
    #[error("invalid search response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SearchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub term: String,
    pub location: String,
    pub limit: usize,
    pub offset: usize,
    /// When set, results are filtered on this category alias instead of searched by term
    pub categories: Option<String>,
}

impl SearchQuery {
    /// Query filtered on the given cuisine as category alias
    pub fn category(cuisine: &str, location: &str, limit: usize, offset: usize) -> Self {
        Self {
            term: cuisine.into(),
            location: location.into(),
            limit,
            offset,
            categories: Some(cuisine.into()),
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("location", self.location.clone()),
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
        ];
        match &self.categories {
            Some(c) => params.push(("categories", c.clone())),
            None => params.push(("term", format!("{} restaurants", self.term))),
        }
        params
    }
}

pub trait BusinessSearch {
    async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError>;
}

/// Yelp Fusion business search over HTTP
#[derive(Clone)]
pub struct YelpClient {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl YelpClient {
    pub fn new(client: Client, endpoint: Url, api_key: &str) -> Self {
        Self {
            client,
            endpoint,
            api_key: api_key.into(),
        }
    }
}

impl BusinessSearch for YelpClient {
    async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        trace!(?query, "Searching...");
        let res = self
            .client
            .get(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .query(&query.params())
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            error!(%status, %body, "Yelp error");
            return Err(SearchError::Status { status, body });
        }

        let body = res.bytes().await?;
        serde_json::from_slice(&body).map_err(SearchError::from)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_query_params() {
        let q = SearchQuery::category("thai", "Manhattan, NY", 50, 100);
        assert_eq!(
            vec![
                ("location", String::from("Manhattan, NY")),
                ("limit", String::from("50")),
                ("offset", String::from("100")),
                ("categories", String::from("thai")),
            ],
            q.params()
        );
    }

    #[test]
    fn term_query_params() {
        let q = SearchQuery {
            term: "thai".into(),
            location: "Manhattan, NY".into(),
            limit: 10,
            ..Default::default()
        };
        assert_eq!(
            Some(&("term", String::from("thai restaurants"))),
            q.params().last()
        );
    }

    #[test]
    fn rate_limit_is_distinguishable() {
        assert!(SearchError::RateLimited.is_rate_limited());
        let e = SearchError::Status {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(!e.is_rate_limited());
    }
}
