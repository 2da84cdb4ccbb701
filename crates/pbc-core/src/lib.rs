//! Core offer, basket and comparison-table model for PBC.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pbc-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("price {raw:?} is not numeric")]
    NotNumeric { raw: String },
    #[error("price {raw:?} is negative")]
    Negative { raw: String },
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

/// Convert a locale-formatted price ("1 234,56") into a float.
///
/// All whitespace (including non-breaking spaces used as thousands
/// separators) is stripped and a comma is read as the decimal point.
pub fn normalize_price(raw: &str) -> Result<f64, ParseError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    let value: f64 = cleaned.parse().map_err(|_| ParseError::NotNumeric {
        raw: raw.to_string(),
    })?;
    check_price(value, raw)
}

fn check_price(value: f64, raw: &str) -> Result<f64, ParseError> {
    if !value.is_finite() {
        return Err(ParseError::NotNumeric {
            raw: raw.to_string(),
        });
    }
    if value < 0.0 {
        return Err(ParseError::Negative {
            raw: raw.to_string(),
        });
    }
    Ok(value)
}

/// Which record field is the canonical product identity. Fixed once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    #[default]
    Name,
    ProductId,
}

impl FromStr for IdentityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "product_id" | "product-id" | "id" => Ok(Self::ProductId),
            other => Err(format!("unknown identity policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductKey(String);

impl ProductKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity-bearing fields of a product, as reported by a page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductRef {
    pub name: Option<String>,
    pub product_id: Option<u64>,
}

impl ProductRef {
    /// `None` when the field selected by `policy` is absent or blank.
    pub fn key(&self, policy: IdentityPolicy) -> Option<ProductKey> {
        match policy {
            IdentityPolicy::Name => self
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(ProductKey::new),
            IdentityPolicy::ProductId => self.product_id.map(|id| ProductKey(id.to_string())),
        }
    }
}

pub fn expected_keys<'a>(
    products: impl IntoIterator<Item = &'a ProductRef>,
    policy: IdentityPolicy,
) -> BTreeSet<ProductKey> {
    products
        .into_iter()
        .filter_map(|p| p.key(policy))
        .collect()
}

/// One competing offer listed alongside a product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubOffer {
    pub rank: u32,
    pub shop: String,
    pub price: f64,
}

/// A normalized priced item. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    name: String,
    price: f64,
    shop: Option<String>,
    brand: Option<String>,
    category: Option<String>,
    product_id: Option<u64>,
    review_count: Option<u32>,
    sub_offers: Vec<SubOffer>,
}

impl Offer {
    /// Start an offer from a locale-formatted price string.
    pub fn builder(name: impl Into<String>, raw_price: impl Into<String>) -> OfferBuilder {
        OfferBuilder::new(name.into(), PriceInput::Raw(raw_price.into()))
    }

    /// Start an offer from an already numeric price.
    pub fn priced(name: impl Into<String>, price: f64) -> OfferBuilder {
        OfferBuilder::new(name.into(), PriceInput::Value(price))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn shop(&self) -> Option<&str> {
        self.shop.as_deref()
    }

    pub fn brand(&self) -> Option<&str> {
        self.brand.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn product_id(&self) -> Option<u64> {
        self.product_id
    }

    pub fn review_count(&self) -> Option<u32> {
        self.review_count
    }

    pub fn sub_offers(&self) -> &[SubOffer] {
        &self.sub_offers
    }

    pub fn product_ref(&self) -> ProductRef {
        ProductRef {
            name: Some(self.name.clone()),
            product_id: self.product_id,
        }
    }

    pub fn identity(&self, policy: IdentityPolicy) -> Option<ProductKey> {
        self.product_ref().key(policy)
    }
}

#[derive(Debug, Clone)]
enum PriceInput {
    Raw(String),
    Value(f64),
}

impl PriceInput {
    fn resolve(&self) -> Result<f64, ParseError> {
        match self {
            PriceInput::Raw(raw) => normalize_price(raw),
            PriceInput::Value(value) => check_price(*value, &value.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OfferBuilder {
    name: String,
    price: PriceInput,
    shop: Option<String>,
    brand: Option<String>,
    category: Option<String>,
    product_id: Option<u64>,
    review_count: Option<u32>,
    sub_offers: Vec<(u32, String, PriceInput)>,
}

impl OfferBuilder {
    fn new(name: String, price: PriceInput) -> Self {
        Self {
            name,
            price,
            shop: None,
            brand: None,
            category: None,
            product_id: None,
            review_count: None,
            sub_offers: Vec::new(),
        }
    }

    pub fn shop(mut self, shop: impl Into<String>) -> Self {
        self.shop = non_blank(shop.into());
        self
    }

    pub fn brand(mut self, brand: Option<String>) -> Self {
        self.brand = brand.and_then(non_blank);
        self
    }

    pub fn category(mut self, category: Option<String>) -> Self {
        self.category = category.and_then(non_blank);
        self
    }

    pub fn product_id(mut self, product_id: Option<u64>) -> Self {
        self.product_id = product_id;
        self
    }

    pub fn review_count(mut self, review_count: Option<u32>) -> Self {
        self.review_count = review_count;
        self
    }

    pub fn sub_offer(
        mut self,
        rank: u32,
        shop: impl Into<String>,
        raw_price: impl Into<String>,
    ) -> Self {
        self.sub_offers
            .push((rank, shop.into(), PriceInput::Raw(raw_price.into())));
        self
    }

    /// Normalizes every price; the first malformed one fails the whole record.
    pub fn build(self) -> Result<Offer, ParseError> {
        let price = self.price.resolve()?;
        let mut sub_offers = self
            .sub_offers
            .iter()
            .map(|(rank, shop, raw)| {
                Ok(SubOffer {
                    rank: *rank,
                    shop: shop.trim().to_string(),
                    price: raw.resolve()?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        sub_offers.sort_by_key(|s| s.rank);
        Ok(Offer {
            name: self.name.trim().to_string(),
            price,
            shop: self.shop,
            brand: self.brand,
            category: self.category,
            product_id: self.product_id,
            review_count: self.review_count,
            sub_offers,
        })
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Offers sharing one provenance (a shop column or one listing page).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Basket {
    name: String,
    offers: Vec<Offer>,
}

/// One basket's contribution to a product row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewRow {
    pub price: f64,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub product_id: Option<u64>,
    pub review_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BasketView {
    pub basket: String,
    pub rows: BTreeMap<ProductKey, ViewRow>,
    /// Offers whose identity was absent under the active policy.
    pub unkeyed: usize,
    /// Offers shadowed by an earlier offer with the same key.
    pub duplicates: usize,
}

impl BasketView {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Basket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            offers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn add(&mut self, offer: Offer) {
        self.offers.push(offer);
    }

    /// Per-product view of this basket. The first offer per key supplies the row.
    pub fn build_view(&self, policy: IdentityPolicy) -> BasketView {
        let mut view = BasketView {
            basket: self.name.clone(),
            ..Default::default()
        };
        for offer in &self.offers {
            let Some(key) = offer.identity(policy) else {
                view.unkeyed += 1;
                continue;
            };
            if view.rows.contains_key(&key) {
                view.duplicates += 1;
                continue;
            }
            view.rows.insert(
                key,
                ViewRow {
                    price: offer.price,
                    brand: offer.brand.clone(),
                    category: offer.category.clone(),
                    product_id: offer.product_id,
                    review_count: offer.review_count,
                },
            );
        }
        view
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessStatus {
    Complete,
    MissingProducts,
    /// No expected product set was available.
    Unknown,
}

impl CompletenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletenessStatus::Complete => "complete",
            CompletenessStatus::MissingProducts => "missing_products",
            CompletenessStatus::Unknown => "unknown",
        }
    }

    /// Classify `present` against `expected`, returning the missing keys too.
    pub fn classify(
        present: &BTreeSet<ProductKey>,
        expected: Option<&BTreeSet<ProductKey>>,
    ) -> (Self, Vec<ProductKey>) {
        let Some(expected) = expected else {
            return (CompletenessStatus::Unknown, Vec::new());
        };
        let missing: Vec<ProductKey> = expected.difference(present).cloned().collect();
        if missing.is_empty() {
            (CompletenessStatus::Complete, missing)
        } else {
            (CompletenessStatus::MissingProducts, missing)
        }
    }
}

impl fmt::Display for CompletenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a table came out empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum AggregationIssue {
    NoBaskets,
    NoSurvivingRows,
    TargetFailed(String),
}

/// Run identity shared by every row of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStamp {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub title: String,
}

impl RunStamp {
    pub fn now(title: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribution {
    pub shop: String,
    pub price: f64,
}

/// A reconciled row before run metadata is attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowDraft {
    pub key: ProductKey,
    /// One entry per basket column; `None` means that basket had no offer.
    pub prices: BTreeMap<String, Option<f64>>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub product_id: Option<u64>,
    pub review_count: Option<u32>,
    pub cheapest: Attribution,
    pub most_expensive: Attribution,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub key: ProductKey,
    pub prices: BTreeMap<String, Option<f64>>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub product_id: Option<u64>,
    pub review_count: Option<u32>,
    pub cheapest_shop: String,
    pub cheapest_price: f64,
    pub most_expensive_shop: String,
    pub most_expensive_price: f64,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub status: CompletenessStatus,
}

/// Frozen per-run comparison table. Built once through [`TableBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateTable {
    stamp: RunStamp,
    status: CompletenessStatus,
    missing: Vec<ProductKey>,
    basket_columns: Vec<String>,
    rows: Vec<AggregateRow>,
    dropped_unkeyed: usize,
    issue: Option<AggregationIssue>,
}

impl AggregateTable {
    /// Empty stand-in for a run that produced nothing usable.
    pub fn placeholder(stamp: RunStamp, issue: AggregationIssue) -> Self {
        Self {
            stamp,
            status: CompletenessStatus::Unknown,
            missing: Vec::new(),
            basket_columns: Vec::new(),
            rows: Vec::new(),
            dropped_unkeyed: 0,
            issue: Some(issue),
        }
    }

    pub fn stamp(&self) -> &RunStamp {
        &self.stamp
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.stamp.timestamp
    }

    pub fn title(&self) -> &str {
        &self.stamp.title
    }

    pub fn status(&self) -> CompletenessStatus {
        self.status
    }

    pub fn missing(&self) -> &[ProductKey] {
        &self.missing
    }

    pub fn basket_columns(&self) -> &[String] {
        &self.basket_columns
    }

    pub fn rows(&self) -> &[AggregateRow] {
        &self.rows
    }

    pub fn row(&self, key: &str) -> Option<&AggregateRow> {
        self.rows.iter().find(|r| r.key.as_str() == key)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dropped_unkeyed(&self) -> usize {
        self.dropped_unkeyed
    }

    pub fn issue(&self) -> Option<&AggregationIssue> {
        self.issue.as_ref()
    }
}

/// Append-only builder; [`TableBuilder::finish`] freezes the table.
#[derive(Debug)]
pub struct TableBuilder {
    stamp: RunStamp,
    basket_columns: Vec<String>,
    drafts: BTreeMap<ProductKey, RowDraft>,
    dropped_unkeyed: usize,
    issue: Option<AggregationIssue>,
}

impl TableBuilder {
    pub fn new(stamp: RunStamp, basket_columns: Vec<String>) -> Self {
        Self {
            stamp,
            basket_columns,
            drafts: BTreeMap::new(),
            dropped_unkeyed: 0,
            issue: None,
        }
    }

    /// Returns `false` (and keeps the first row) when the key was already pushed.
    pub fn push(&mut self, draft: RowDraft) -> bool {
        if self.drafts.contains_key(&draft.key) {
            return false;
        }
        self.drafts.insert(draft.key.clone(), draft);
        true
    }

    pub fn record_unkeyed(&mut self, count: usize) {
        self.dropped_unkeyed += count;
    }

    pub fn issue(mut self, issue: AggregationIssue) -> Self {
        self.issue = Some(issue);
        self
    }

    pub fn finish(self, expected: Option<&BTreeSet<ProductKey>>) -> AggregateTable {
        let present: BTreeSet<ProductKey> = self.drafts.keys().cloned().collect();
        let (status, missing) = CompletenessStatus::classify(&present, expected);
        let issue = match self.issue {
            Some(issue) => Some(issue),
            None if self.drafts.is_empty() => Some(AggregationIssue::NoSurvivingRows),
            None => None,
        };
        let stamp = self.stamp;
        let rows = self
            .drafts
            .into_values()
            .map(|d| AggregateRow {
                key: d.key,
                prices: d.prices,
                brand: d.brand,
                category: d.category,
                product_id: d.product_id,
                review_count: d.review_count,
                cheapest_shop: d.cheapest.shop,
                cheapest_price: d.cheapest.price,
                most_expensive_shop: d.most_expensive.shop,
                most_expensive_price: d.most_expensive.price,
                timestamp: stamp.timestamp,
                title: stamp.title.clone(),
                status,
            })
            .collect();
        AggregateTable {
            stamp,
            status,
            missing,
            basket_columns: self.basket_columns,
            rows,
            dropped_unkeyed: self.dropped_unkeyed,
            issue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(name: &str, price: &str) -> Offer {
        Offer::builder(name, price).build().expect("offer")
    }

    #[test]
    fn normalizes_locale_prices() {
        assert_eq!(normalize_price("1 234,56"), Ok(1234.56));
        assert_eq!(normalize_price("12,00"), Ok(12.0));
        assert_eq!(normalize_price("1\u{a0}099,99"), Ok(1099.99));
        assert_eq!(normalize_price(" 7 "), Ok(7.0));
    }

    #[test]
    fn rejects_malformed_and_negative_prices() {
        assert!(matches!(
            normalize_price("abc"),
            Err(ParseError::NotNumeric { .. })
        ));
        assert!(matches!(normalize_price(""), Err(ParseError::NotNumeric { .. })));
        assert!(matches!(normalize_price("NaN"), Err(ParseError::NotNumeric { .. })));
        assert!(matches!(
            normalize_price("-3,50"),
            Err(ParseError::Negative { .. })
        ));
    }

    #[test]
    fn builder_fails_on_bad_sub_offer_price() {
        let err = Offer::builder("GPU", "100,00")
            .sub_offer(1, "shop-a", "99,00")
            .sub_offer(2, "shop-b", "n/a")
            .build()
            .unwrap_err();
        assert!(matches!(err, ParseError::NotNumeric { .. }));
    }

    #[test]
    fn builder_orders_sub_offers_by_rank() {
        let offer = Offer::builder("GPU", "100,00")
            .sub_offer(2, "shop-b", "101,00")
            .sub_offer(1, "shop-a", "99,00")
            .build()
            .unwrap();
        let ranks: Vec<u32> = offer.sub_offers().iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![1, 2]);
        assert_eq!(offer.sub_offers()[0].price, 99.0);
    }

    #[test]
    fn identity_follows_policy() {
        let with_id = Offer::builder("RTX 4070", "2 799,00")
            .product_id(Some(42))
            .build()
            .unwrap();
        assert_eq!(
            with_id.identity(IdentityPolicy::Name),
            Some(ProductKey::new("RTX 4070"))
        );
        assert_eq!(
            with_id.identity(IdentityPolicy::ProductId),
            Some(ProductKey::new("42"))
        );
        assert_eq!(offer("  ", "1").identity(IdentityPolicy::Name), None);
        assert_eq!(offer("x", "1").identity(IdentityPolicy::ProductId), None);
    }

    #[test]
    fn empty_basket_view_is_empty_not_error() {
        let basket = Basket::new("shop1");
        let view = basket.build_view(IdentityPolicy::Name);
        assert!(view.is_empty());
        assert_eq!(view.basket, "shop1");
        assert_eq!(view.unkeyed, 0);
    }

    #[test]
    fn basket_keeps_duplicates_but_view_uses_first() {
        let mut basket = Basket::new("shop1");
        basket.add(offer("A", "10,00"));
        basket.add(offer("A", "8,00"));
        basket.add(offer("", "3,00"));
        assert_eq!(basket.len(), 3);

        let view = basket.build_view(IdentityPolicy::Name);
        assert_eq!(view.rows.len(), 1);
        assert_eq!(view.rows[&ProductKey::new("A")].price, 10.0);
        assert_eq!(view.duplicates, 1);
        assert_eq!(view.unkeyed, 1);
    }

    #[test]
    fn completeness_classification() {
        let present: BTreeSet<ProductKey> =
            ["A", "B"].into_iter().map(ProductKey::new).collect();
        let same = present.clone();
        let wider: BTreeSet<ProductKey> =
            ["A", "B", "C"].into_iter().map(ProductKey::new).collect();

        assert_eq!(
            CompletenessStatus::classify(&present, Some(&same)).0,
            CompletenessStatus::Complete
        );
        let (status, missing) = CompletenessStatus::classify(&present, Some(&wider));
        assert_eq!(status, CompletenessStatus::MissingProducts);
        assert_eq!(missing, vec![ProductKey::new("C")]);
        assert_eq!(
            CompletenessStatus::classify(&present, None).0,
            CompletenessStatus::Unknown
        );
    }

    #[test]
    fn finished_table_stamps_every_row() {
        let stamp = RunStamp::now("GPUs");
        let mut builder = TableBuilder::new(stamp.clone(), vec!["shop1".into()]);
        for key in ["B", "A"] {
            builder.push(RowDraft {
                key: ProductKey::new(key),
                prices: BTreeMap::from([("shop1".to_string(), Some(1.0))]),
                brand: None,
                category: None,
                product_id: None,
                review_count: None,
                cheapest: Attribution { shop: "shop1".into(), price: 1.0 },
                most_expensive: Attribution { shop: "shop1".into(), price: 1.0 },
            });
        }
        let table = builder.finish(None);
        let keys: Vec<&str> = table.rows().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert!(table
            .rows()
            .iter()
            .all(|r| r.timestamp == stamp.timestamp && r.title == "GPUs"));
        assert_eq!(table.issue(), None);
    }

    #[test]
    fn empty_builder_reports_no_surviving_rows() {
        let table = TableBuilder::new(RunStamp::now("t"), Vec::new()).finish(None);
        assert!(table.is_empty());
        assert_eq!(table.issue(), Some(&AggregationIssue::NoSurvivingRows));
    }
}
