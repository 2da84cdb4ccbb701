//! Outer-join of basket views into one comparison table.
//!
//! Baskets are processed in ascending name order and same-named baskets
//! share one column. Within a basket the first offer per product supplies
//! the column price; when same-named baskets both carry a product, the
//! lower price (then the smaller metadata) holds the cell. Cheapest /
//! most-expensive attribution considers every matching offer (and its
//! sub-offers) in every basket; equal prices go to the lexicographically
//! smallest shop identifier, so the result never depends on the order
//! baskets were handed in.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use pbc_core::{
    AggregateTable, AggregationIssue, Attribution, Basket, IdentityPolicy, ProductKey, RowDraft,
    RunStamp, TableBuilder, ViewRow,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    policy: IdentityPolicy,
}

impl Reconciler {
    pub fn new(policy: IdentityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> IdentityPolicy {
        self.policy
    }

    pub fn reconcile(
        &self,
        baskets: &[Basket],
        stamp: RunStamp,
        expected: Option<&BTreeSet<ProductKey>>,
    ) -> AggregateTable {
        if baskets.is_empty() {
            warn!(title = %stamp.title, "no baskets to reconcile");
            return TableBuilder::new(stamp, Vec::new())
                .issue(AggregationIssue::NoBaskets)
                .finish(expected);
        }

        let mut ordered: Vec<&Basket> = baskets.iter().collect();
        ordered.sort_by(|a, b| a.name().cmp(b.name()));

        let mut columns: BTreeMap<String, BTreeMap<ProductKey, ViewRow>> = BTreeMap::new();
        let mut unkeyed = 0usize;
        for basket in &ordered {
            let view = basket.build_view(self.policy);
            unkeyed += view.unkeyed;
            let column = columns.entry(view.basket).or_default();
            for (key, row) in view.rows {
                match column.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert(row);
                    }
                    Entry::Occupied(mut slot) => {
                        if cell_order(&row, slot.get()) == Ordering::Less {
                            slot.insert(row);
                        }
                    }
                }
            }
        }

        let candidates = self.collect_candidates(&ordered);
        let keys: BTreeSet<&ProductKey> = columns.values().flat_map(|c| c.keys()).collect();

        let mut builder = TableBuilder::new(stamp.clone(), columns.keys().cloned().collect());
        builder.record_unkeyed(unkeyed);
        if unkeyed > 0 {
            debug!(unkeyed, "dropped offers without product identity");
        }

        for key in keys {
            let Some(offers) = candidates.get(key) else {
                continue;
            };
            let (Some(cheapest), Some(most_expensive)) =
                (pick(offers, Ordering::Less), pick(offers, Ordering::Greater))
            else {
                continue;
            };

            let prices = columns
                .iter()
                .map(|(name, rows)| (name.clone(), rows.get(key).map(|r| r.price)))
                .collect();
            let contributions: Vec<(&str, &ViewRow)> = columns
                .iter()
                .filter_map(|(name, rows)| rows.get(key).map(|r| (name.as_str(), r)))
                .collect();

            builder.push(RowDraft {
                key: key.clone(),
                prices,
                brand: first_value(key, "brand", &contributions, |r| r.brand.clone()),
                category: first_value(key, "category", &contributions, |r| r.category.clone()),
                product_id: first_value(key, "product_id", &contributions, |r| r.product_id),
                review_count: first_value(key, "review_count", &contributions, |r| r.review_count),
                cheapest,
                most_expensive,
            });
        }

        let table = builder.finish(expected);
        if !table.missing().is_empty() {
            let missing: Vec<&str> = table.missing().iter().map(ProductKey::as_str).collect();
            warn!(title = %stamp.title, ?missing, "run is missing expected products");
        }
        info!(
            title = %stamp.title,
            rows = table.rows().len(),
            baskets = table.basket_columns().len(),
            status = %table.status(),
            "reconciled"
        );
        table
    }

    /// Every (shop, price) offered for each product, across all baskets.
    fn collect_candidates(&self, baskets: &[&Basket]) -> BTreeMap<ProductKey, Vec<Attribution>> {
        let mut candidates: BTreeMap<ProductKey, Vec<Attribution>> = BTreeMap::new();
        for basket in baskets {
            for offer in basket.offers() {
                let Some(key) = offer.identity(self.policy) else {
                    continue;
                };
                let entry = candidates.entry(key).or_default();
                entry.push(Attribution {
                    shop: offer.shop().unwrap_or(basket.name()).to_string(),
                    price: offer.price(),
                });
                for sub in offer.sub_offers() {
                    let shop = if sub.shop.is_empty() {
                        basket.name()
                    } else {
                        sub.shop.as_str()
                    };
                    entry.push(Attribution {
                        shop: shop.to_string(),
                        price: sub.price,
                    });
                }
            }
        }
        candidates
    }
}

/// Order between two rows competing for one cell of a shared column.
fn cell_order(a: &ViewRow, b: &ViewRow) -> Ordering {
    a.price
        .total_cmp(&b.price)
        .then_with(|| a.brand.cmp(&b.brand))
        .then_with(|| a.category.cmp(&b.category))
        .then_with(|| a.product_id.cmp(&b.product_id))
        .then_with(|| a.review_count.cmp(&b.review_count))
}

/// Extreme price in direction `want` (`Less` = cheapest); ties go to the smallest shop id.
fn pick(offers: &[Attribution], want: Ordering) -> Option<Attribution> {
    offers
        .iter()
        .min_by(|a, b| {
            let by_price = a.price.total_cmp(&b.price);
            let by_price = if want == Ordering::Greater {
                by_price.reverse()
            } else {
                by_price
            };
            by_price.then_with(|| a.shop.cmp(&b.shop))
        })
        .cloned()
}

fn first_value<T: PartialEq + std::fmt::Debug>(
    key: &ProductKey,
    field: &'static str,
    contributions: &[(&str, &ViewRow)],
    get: impl Fn(&ViewRow) -> Option<T>,
) -> Option<T> {
    let mut chosen: Option<(&str, T)> = None;
    for &(basket, row) in contributions {
        let Some(value) = get(row) else {
            continue;
        };
        if let Some((winner, kept)) = &chosen {
            if *kept != value {
                debug!(
                    %key,
                    field,
                    kept_from = *winner,
                    ignored_from = basket,
                    kept = ?kept,
                    ignored = ?value,
                    "conflicting product metadata"
                );
            }
            continue;
        }
        chosen = Some((basket, value));
    }
    chosen.map(|(_, v)| v)
}
