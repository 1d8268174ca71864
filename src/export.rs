//! Bulk export of the restaurant table for search indexing.
//!
//! Each exported restaurant becomes two lines of newline delimited JSON, an index action naming
//! the target index, followed by the document itself:
//!
//! ```text
//! {"index":{"_index":"restaurants"}}
//! {"type":"Restaurant","RestaurantID":"abc","Cuisine":"thai"}
//! ```
//!
//! The output can be posted as is to a `_bulk` endpoint.

use crate::{
    models::StoredRestaurant,
    store::{RestaurantStore, StoreError},
};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, trace};

pub const DEFAULT_INDEX: &str = "restaurants";
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

#[derive(Debug, Serialize)]
struct IndexAction<'a> {
    index: IndexTarget<'a>,
}

#[derive(Debug, Serialize)]
struct IndexTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkDocument {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "RestaurantID")]
    pub restaurant_id: String,
    #[serde(rename = "Cuisine")]
    pub cuisine: String,
}

impl BulkDocument {
    /// Document for a stored row, or None when the row lacks an id or a cuisine
    pub fn from_row(row: &StoredRestaurant) -> Option<Self> {
        let id = row.business_id.as_deref().filter(|s| !s.is_empty())?;
        let cuisine = row.cuisine.as_deref().filter(|s| !s.is_empty())?;
        Some(Self {
            kind: "Restaurant",
            restaurant_id: id.into(),
            cuisine: cuisine.to_lowercase(),
        })
    }
}

/// Read the whole table, following continuation keys until the store reports no more pages
pub async fn scan_all<S: RestaurantStore>(
    store: &S,
    page_size: usize,
) -> Result<Vec<StoredRestaurant>, StoreError> {
    let mut items = Vec::new();
    let mut start_after: Option<String> = None;
    loop {
        let page = store.scan(start_after.as_deref(), page_size).await?;
        trace!(rows = page.items.len(), "Got scan page");
        items.extend(page.items);
        match page.last_key {
            Some(key) => start_after = Some(key),
            None => break,
        }
    }
    debug!(rows = items.len(), "Scan complete");
    Ok(items)
}

/// Write an action and document line pair for every exportable row, in the given order.
/// Returns the number of documents written.
pub fn write_bulk<W: Write>(
    rows: &[StoredRestaurant],
    index: &str,
    mut w: W,
) -> std::io::Result<usize> {
    let action = IndexAction {
        index: IndexTarget { index },
    };
    let mut written = 0;
    for doc in rows.iter().filter_map(BulkDocument::from_row) {
        serde_json::to_writer(&mut w, &action)?;
        w.write_all(b"\n")?;
        serde_json::to_writer(&mut w, &doc)?;
        w.write_all(b"\n")?;
        written += 1;
    }
    w.flush()?;
    Ok(written)
}
