// Writes go through one upsert statement per chunk, fed by unnest over column arrays. There is no
// transaction around the chunks: if one fails, the ones before it stay written. Reruns fix that up,
// since every row is replaced as a whole on conflicting business_id.

use crate::{
    config::TableName,
    models::{RestaurantRecord, RestaurantRows, StoredRestaurant},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Instant;
use tracing::{debug, trace};

/// Rows per upsert statement
pub const DEFAULT_CHUNK_SIZE: usize = 25;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("an error occurred with the database: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// One page of a full table scan. `last_key` is the continuation token to pass to the next
/// scan call, and is None once the scan is complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub items: Vec<StoredRestaurant>,
    pub last_key: Option<String>,
}

pub trait RestaurantStore {
    /// Make sure the table is there and reachable
    async fn check(&self) -> Result<(), StoreError>;

    /// Insert the given records, replacing any existing rows with the same business id.
    /// Returns the number of rows written.
    async fn upsert(&self, records: &[RestaurantRecord]) -> Result<u64, StoreError>;

    /// Fetch up to `limit` rows in key order, starting after the given key
    async fn scan(&self, start_after: Option<&str>, limit: usize) -> Result<ScanPage, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    table: TableName,
}

impl PgStore {
    pub async fn connect(url: &str, table: TableName) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;
        Ok(Self::new(pool, table))
    }

    pub fn new(pool: PgPool, table: TableName) -> Self {
        Self { pool, table }
    }
}

impl RestaurantStore for PgStore {
    async fn check(&self) -> Result<(), StoreError> {
        let sql = format!("select 1 from {} limit 1", self.table);
        sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, records: &[RestaurantRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        trace!(table = %self.table, "Upserting {} restaurants", records.len());

        let sql = format!(
            r#"
                insert into {} (business_id, name, address, latitude, longitude, review_count, rating, zip_code, cuisine, inserted_at)
                select * from unnest($1::text[], $2::text[], $3::text[], $4::numeric[], $5::numeric[], $6::int8[], $7::numeric[], $8::text[], $9::text[], $10::timestamptz[])
                on conflict (business_id) do update set
                    name = excluded.name,
                    address = excluded.address,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    review_count = excluded.review_count,
                    rating = excluded.rating,
                    zip_code = excluded.zip_code,
                    cuisine = excluded.cuisine,
                    inserted_at = excluded.inserted_at
            "#,
            self.table
        );

        let start = Instant::now();
        let mut written = 0;
        for chunk in records.chunks(DEFAULT_CHUNK_SIZE) {
            // convert to format suitable for use with unnest
            let rows = RestaurantRows::from(chunk);
            let res = sqlx::query(&sql)
                .bind(&rows.business_ids)
                .bind(&rows.names)
                .bind(&rows.addresses)
                .bind(&rows.latitudes)
                .bind(&rows.longitudes)
                .bind(&rows.review_counts)
                .bind(&rows.ratings)
                .bind(&rows.zip_codes)
                .bind(&rows.cuisines)
                .bind(&rows.inserted_ats)
                .execute(&self.pool)
                .await?;
            written += res.rows_affected();
        }
        debug!(written, "DB upsert done in {:?}", start.elapsed());

        Ok(written)
    }

    async fn scan(&self, start_after: Option<&str>, limit: usize) -> Result<ScanPage, StoreError> {
        let sql = format!(
            r#"
                select business_id, cuisine from {}
                where $1::text is null or business_id > $1
                order by business_id
                limit $2
            "#,
            self.table
        );
        let items = sqlx::query_as::<_, StoredRestaurant>(&sql)
            .bind(start_after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        // a short page means there is nothing after it
        let last_key = if items.len() == limit {
            items.last().and_then(|r| r.business_id.clone())
        } else {
            None
        };
        trace!(rows = items.len(), ?last_key, "Scanned page");

        Ok(ScanPage { items, last_key })
    }
}

#[cfg(test)]
pub mod memory {
    //! Keyed in-memory table with the same upsert and scan semantics as the Postgres one
    use super::*;
    use std::{collections::BTreeMap, ops::Bound, sync::Mutex};

    #[derive(Default)]
    pub struct MemoryStore {
        rows: Mutex<BTreeMap<String, RestaurantRecord>>,
        upserts: Mutex<Vec<usize>>,
    }

    impl MemoryStore {
        pub fn rows(&self) -> Vec<RestaurantRecord> {
            self.rows.lock().unwrap().values().cloned().collect()
        }

        /// Sizes of every upsert call so far
        pub fn upserts(&self) -> Vec<usize> {
            self.upserts.lock().unwrap().clone()
        }
    }

    impl RestaurantStore for MemoryStore {
        async fn check(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn upsert(&self, records: &[RestaurantRecord]) -> Result<u64, StoreError> {
            self.upserts.lock().unwrap().push(records.len());
            let mut rows = self.rows.lock().unwrap();
            for r in records {
                rows.insert(r.business_id.clone(), r.clone());
            }
            Ok(records.len() as u64)
        }

        async fn scan(
            &self,
            start_after: Option<&str>,
            limit: usize,
        ) -> Result<ScanPage, StoreError> {
            let rows = self.rows.lock().unwrap();
            let lower = match start_after {
                Some(k) => Bound::Excluded(k.to_string()),
                None => Bound::Unbounded,
            };
            let items: Vec<StoredRestaurant> = rows
                .range((lower, Bound::Unbounded))
                .take(limit)
                .map(|(_, r)| r.into())
                .collect();
            let last_key = if items.len() == limit {
                items.last().and_then(|r| r.business_id.clone())
            } else {
                None
            };
            Ok(ScanPage { items, last_key })
        }
    }
}
