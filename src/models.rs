// The structs at the top of this module map the restaurant table, while the structs in the yelp
// sub-module mirror the search API's JSON, where every field may be missing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Convert an upstream float to an exact decimal, going through the float's shortest
/// round-trip text form, so that e.g. 4.5 is stored as 4.5 and not its binary expansion.
pub fn to_decimal(v: f64) -> Option<Decimal> {
    if !v.is_finite() {
        return None;
    }
    Decimal::from_str(&v.to_string())
        .or_else(|_| Decimal::from_scientific(&format!("{v:e}")))
        .ok()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestaurantRecord {
    /// Upstream business id, primary key of the table
    pub business_id: String,
    pub name: Option<String>,
    /// Display address lines, joined with ", "
    pub address: Option<String>,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub review_count: Option<i64>,
    pub rating: Option<Decimal>,
    pub zip_code: Option<String>,
    /// Lower-cased cuisine term of the harvest that found this record first
    pub cuisine: String,
    /// When the record was built for writing
    pub inserted_at: DateTime<Utc>,
}

impl RestaurantRecord {
    /// Build a record tagged with the given cuisine. Returns None for businesses without an id.
    pub fn from_business(b: yelp::Business, cuisine: &str) -> Option<Self> {
        let business_id = b.id.filter(|id| !id.is_empty())?;
        let (latitude, longitude) = match b.coordinates {
            Some(c) => (
                c.latitude.and_then(to_decimal),
                c.longitude.and_then(to_decimal),
            ),
            None => (None, None),
        };
        let (address, zip_code) = match b.location {
            Some(l) => (Some(l.display_address.join(", ")), l.zip_code),
            None => (None, None),
        };
        Some(Self {
            business_id,
            name: b.name,
            address,
            latitude,
            longitude,
            review_count: b.review_count,
            rating: b.rating.and_then(to_decimal),
            zip_code,
            cuisine: cuisine.to_lowercase(),
            inserted_at: Utc::now(),
        })
    }
}

/// RestaurantRows maps a list of RestaurantRecord into lists of all its fields.
/// The intended use is together with Postgres' UNNEST, to be able to do batch upserts of many
/// restaurants in one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestaurantRows {
    pub business_ids: Vec<String>,
    pub names: Vec<Option<String>>,
    pub addresses: Vec<Option<String>>,
    pub latitudes: Vec<Option<Decimal>>,
    pub longitudes: Vec<Option<Decimal>>,
    pub review_counts: Vec<Option<i64>>,
    pub ratings: Vec<Option<Decimal>>,
    pub zip_codes: Vec<Option<String>>,
    pub cuisines: Vec<String>,
    pub inserted_ats: Vec<DateTime<Utc>>,
}

impl RestaurantRows {
    fn with_capacity(cap: usize) -> Self {
        Self {
            business_ids: Vec::with_capacity(cap),
            names: Vec::with_capacity(cap),
            addresses: Vec::with_capacity(cap),
            latitudes: Vec::with_capacity(cap),
            longitudes: Vec::with_capacity(cap),
            review_counts: Vec::with_capacity(cap),
            ratings: Vec::with_capacity(cap),
            zip_codes: Vec::with_capacity(cap),
            cuisines: Vec::with_capacity(cap),
            inserted_ats: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.business_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.business_ids.is_empty()
    }
}

impl From<&[RestaurantRecord]> for RestaurantRows {
    fn from(v: &[RestaurantRecord]) -> Self {
        let mut rr = Self::with_capacity(v.len());

        for r in v {
            rr.business_ids.push(r.business_id.clone());
            rr.names.push(r.name.clone());
            rr.addresses.push(r.address.clone());
            rr.latitudes.push(r.latitude);
            rr.longitudes.push(r.longitude);
            rr.review_counts.push(r.review_count);
            rr.ratings.push(r.rating);
            rr.zip_codes.push(r.zip_code.clone());
            rr.cuisines.push(r.cuisine.clone());
            rr.inserted_ats.push(r.inserted_at);
        }

        rr
    }
}

/// The part of a stored row the bulk exporter cares about
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
#[sqlx(default)]
pub struct StoredRestaurant {
    pub business_id: Option<String>,
    pub cuisine: Option<String>,
}

impl StoredRestaurant {
    pub fn new(business_id: &str, cuisine: &str) -> Self {
        Self {
            business_id: Some(business_id.into()),
            cuisine: Some(cuisine.into()),
        }
    }
}

impl From<&RestaurantRecord> for StoredRestaurant {
    fn from(r: &RestaurantRecord) -> Self {
        Self::new(&r.business_id, &r.cuisine)
    }
}

pub mod yelp {
    //! Business search response types. Yelp leaves out, nulls or empties fields at will, so
    //! everything is optional and defaulted.
    use serde::{Deserialize, Serialize};
    use serde_with::{NoneAsEmptyString, serde_as};

    #[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
    #[serde(default)]
    pub struct SearchResponse {
        pub businesses: Vec<Business>,
        /// Total number of matches upstream, not limited by the max offset
        pub total: Option<u64>,
    }

    #[serde_as]
    #[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
    #[serde(default)]
    pub struct Business {
        #[serde_as(as = "NoneAsEmptyString")]
        pub id: Option<String>,
        pub name: Option<String>,
        pub review_count: Option<i64>,
        pub rating: Option<f64>,
        pub coordinates: Option<Coordinates>,
        pub location: Option<Location>,
    }

    impl Business {
        pub fn new(id: &str) -> Self {
            Self {
                id: Some(id.into()),
                ..Default::default()
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
    #[serde(default)]
    pub struct Coordinates {
        pub latitude: Option<f64>,
        pub longitude: Option<f64>,
    }

    #[serde_as]
    #[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
    #[serde(default)]
    pub struct Location {
        pub display_address: Vec<String>,
        #[serde_as(as = "NoneAsEmptyString")]
        pub zip_code: Option<String>,
    }
}
