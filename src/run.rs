use crate::{
    config::HarvestOpts,
    harvest::{Harvester, SeenIds},
    search::BusinessSearch,
    store::{RestaurantStore, StoreError},
};
use compact_str::CompactString;
use serde::{Serialize, Serializer, ser::SerializeMap};
use std::fmt::Display;
use tracing::{info, trace};

/// Number of records written per cuisine, in the order the cuisines were harvested
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub per_cuisine: Vec<(CompactString, usize)>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.per_cuisine.iter().map(|(_, n)| n).sum()
    }
}

impl Serialize for RunSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.per_cuisine.len()))?;
        for (cuisine, n) in &self.per_cuisine {
            map.serialize_entry(cuisine, n)?;
        }
        map.end()
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| std::fmt::Error)?;
        writeln!(f, "{json}")?;
        write!(f, "TOTAL WRITTEN: {}", self.total())
    }
}

/// Harvest every configured cuisine in order, writing each cuisine's records once its pagination
/// is done. A failed search only ends that cuisine, while a failed write ends the whole run.
pub async fn harvest_all<S, St>(
    search: &S,
    store: &St,
    opts: &HarvestOpts,
) -> Result<RunSummary, StoreError>
where
    S: BusinessSearch,
    St: RestaurantStore,
{
    let harvester = Harvester::new(search, opts);
    let mut seen = SeenIds::new();
    let mut summary = RunSummary::default();

    for cuisine in &opts.cuisines {
        info!(%cuisine, "Harvesting");
        let harvest = harvester.harvest_cuisine(cuisine, &mut seen).await;

        let written = harvest.records.len();
        if written > 0 {
            store.upsert(&harvest.records).await?;
        }
        info!(%cuisine, written, stop = ?harvest.stop, pages = harvest.pages, "Cuisine done");
        summary.per_cuisine.push((cuisine.clone(), written));
    }
    trace!(seen = seen.len(), "Run done");

    Ok(summary)
}
