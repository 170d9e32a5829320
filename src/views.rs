//! Read-only views joining several collection snapshots.
//!
//! Any input may be stale or only partly loaded; missing records degrade
//! to empty names and the `"0"` sentinel rather than failing.

use std::cmp::Ordering;

use crate::collection::numeric_id_cmp;
use crate::document::{DocMap, UNASSIGNED};
use crate::entities::{AssignedDataItem, RoundDataItem, SortDataItem, StreetInfoItem};

/// One row of a group's street grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreetRow {
    pub postcode: String,
    pub street: String,
    pub round: String,
    pub round_name: String,
    pub sortbox: String,
    pub order: u32,
}

/// Postcodes assigned to `group`, in postcode order.
pub fn group_streets(assigned: &DocMap<AssignedDataItem>, group: &str) -> Vec<String> {
    assigned
        .values()
        .filter(|item| item.key == group)
        .map(|item| item.id.clone())
        .collect()
}

/// Grid rows for every street assigned to `group`, ordered by round
/// (numerically), then delivery order, then street name.
pub fn street_rows(
    group: &str,
    assigned: &DocMap<AssignedDataItem>,
    rounds: &DocMap<RoundDataItem>,
    sort_data: &DocMap<SortDataItem>,
    streets: &DocMap<StreetInfoItem>,
) -> Vec<StreetRow> {
    let mut rows: Vec<StreetRow> = assigned
        .values()
        .filter(|item| item.key == group)
        .map(|item| {
            let sort = sort_data.get(&item.id);
            let round = sort
                .map(|sort| sort.round.clone())
                .unwrap_or_else(|| UNASSIGNED.to_string());
            let sortbox = sort
                .map(|sort| sort.sortbox.clone())
                .filter(|sortbox| sortbox != UNASSIGNED)
                .or_else(|| item.sortbox.clone())
                .unwrap_or_else(|| UNASSIGNED.to_string());

            StreetRow {
                postcode: item.id.clone(),
                street: streets
                    .get(&item.id)
                    .map(|street| street.street.clone())
                    .unwrap_or_default(),
                round_name: rounds
                    .get(&round)
                    .map(|round| round.name.clone())
                    .unwrap_or_default(),
                round,
                sortbox,
                order: sort.map(|sort| sort.order).unwrap_or_default(),
            }
        })
        .collect();

    rows.sort_by(row_order);
    rows
}

fn row_order(a: &StreetRow, b: &StreetRow) -> Ordering {
    numeric_id_cmp(&a.round, &b.round)
        .then(a.order.cmp(&b.order))
        .then_with(|| a.street.cmp(&b.street))
        .then_with(|| a.postcode.cmp(&b.postcode))
}
