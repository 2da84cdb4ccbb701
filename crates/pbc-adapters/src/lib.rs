//! Source reader contract + per-page-shape reader implementations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pbc_core::{Offer, ParseError, ProductRef};
use pbc_storage::{FetchError, LoadedPage, PageLoader};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pbc-adapters";

/// Markup family of a locator; picks the reader variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageShape {
    #[default]
    Summary,
    Listing,
    Json,
}

impl FromStr for PageShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" => Ok(Self::Summary),
            "listing" => Ok(Self::Listing),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown page shape `{other}`")),
        }
    }
}

impl fmt::Display for PageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageShape::Summary => "summary",
            PageShape::Listing => "listing",
            PageShape::Json => "json",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadContext {
    pub run_id: Uuid,
    /// Target label, used to group archived pages.
    pub target: String,
}

/// One extracted offer and the basket it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct BasketRecord {
    pub basket: String,
    pub offer: Offer,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub records: Vec<BasketRecord>,
    /// Every product the page claims to list, when the page says so.
    pub expected: Option<Vec<ProductRef>>,
}

/// Everything one successful read yields.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtract {
    pub locator: String,
    pub fetched_at: DateTime<Utc>,
    pub title: Option<String>,
    pub records: Vec<BasketRecord>,
    pub expected: Option<Vec<ProductRef>>,
}

impl PageExtract {
    fn from_parsed(page: &LoadedPage, parsed: ParsedPage) -> Self {
        Self {
            locator: page.locator.clone(),
            fetched_at: page.fetched_at,
            title: parsed.title,
            records: parsed.records,
            expected: parsed.expected,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("record rejected: {0}")]
    Parse(#[from] ParseError),
    #[error("unexpected page markup: {0}")]
    Markup(String),
    #[error("invalid JSON export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    fn reader_id(&self) -> &'static str;

    async fn read(&self, ctx: &ReadContext, locator: &str) -> Result<PageExtract, ReaderError>;
}

pub fn reader_for_shape(shape: PageShape, loader: PageLoader) -> Arc<dyn SourceReader> {
    match shape {
        PageShape::Summary => Arc::new(SummaryPageReader::new(loader)),
        PageShape::Listing => Arc::new(ListingPageReader::new(loader)),
        PageShape::Json => Arc::new(JsonOffersReader::new(loader)),
    }
}

fn selector(css: &str) -> Result<Selector, ReaderError> {
    Selector::parse(css).map_err(|e| ReaderError::Markup(format!("selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

fn attr_unquoted(el: ElementRef<'_>, attr: &str) -> Option<String> {
    el.value()
        .attr(attr)
        .map(|v| v.replace('"', ""))
        .and_then(text_or_none)
}

fn attr_u64(el: ElementRef<'_>, attr: &str) -> Option<u64> {
    attr_unquoted(el, attr).and_then(|v| v.parse().ok())
}

/// Page title up to the first `-` ("Karty graficzne - Ceneo.pl" -> "Karty graficzne").
fn page_title(document: &Html) -> Result<Option<String>, ReaderError> {
    let sel = selector("title")?;
    Ok(document
        .select(&sel)
        .next()
        .map(element_text)
        .and_then(|t| t.split('-').next().map(ToString::to_string))
        .and_then(text_or_none))
}

/// Drop a trailing currency label ("2 799,00 zł" -> "2 799,00").
fn strip_currency(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| c.is_alphabetic() || c.is_whitespace() || c == '.')
        .to_string()
}

fn first_digits(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Comparison-summary page: a grid of `td` cells, product cells carry an
/// `input`, every other cell is one basket's offer for that product.
#[derive(Debug, Clone)]
pub struct SummaryPageReader {
    loader: PageLoader,
}

impl SummaryPageReader {
    pub fn new(loader: PageLoader) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl SourceReader for SummaryPageReader {
    fn reader_id(&self) -> &'static str {
        "summary"
    }

    async fn read(&self, ctx: &ReadContext, locator: &str) -> Result<PageExtract, ReaderError> {
        let page = self.loader.load(ctx.run_id, &ctx.target, locator).await?;
        let parsed = parse_summary_page(&page.text())?;
        debug!(locator, records = parsed.records.len(), "summary page parsed");
        Ok(PageExtract::from_parsed(&page, parsed))
    }
}

struct BasketCell {
    basket: String,
    product_id: Option<u64>,
    brand: Option<String>,
    category: Option<String>,
    spans: HashMap<String, String>,
}

fn read_basket_cell(
    cell: ElementRef<'_>,
    link_sel: &Selector,
    span_sel: &Selector,
) -> Option<BasketCell> {
    let basket = cell.value().classes().next()?.to_string();
    let link = cell.select(link_sel).next();
    let mut spans = HashMap::new();
    for span in cell.select(span_sel) {
        if let Some(class) = span.value().classes().next() {
            spans.insert(class.to_string(), element_text(span).trim().to_string());
        }
    }
    Some(BasketCell {
        basket,
        product_id: link.and_then(|a| attr_u64(a, "data-productid")),
        brand: link.and_then(|a| attr_unquoted(a, "data-brand")),
        category: link.and_then(|a| attr_unquoted(a, "data-gacategoryname")),
        spans,
    })
}

fn summary_cell_price(spans: &HashMap<String, String>) -> Result<String, ParseError> {
    if let (Some(value), Some(penny)) = (spans.get("value"), spans.get("penny")) {
        return Ok(format!("{value}{penny}"));
    }
    spans
        .get("price")
        .map(|p| strip_currency(p))
        .ok_or(ParseError::MissingField("price"))
}

pub fn parse_summary_page(html: &str) -> Result<ParsedPage, ReaderError> {
    let document = Html::parse_document(html);
    let cell_sel = selector("td")?;
    let input_sel = selector("input")?;
    let img_sel = selector("img[alt]")?;
    let link_sel = selector("a")?;
    let span_sel = selector("span")?;

    let mut expected = Vec::new();
    let mut id_to_name: HashMap<u64, String> = HashMap::new();
    let mut basket_cells = Vec::new();

    for cell in document.select(&cell_sel) {
        if let Some(input) = cell.select(&input_sel).next() {
            let name = cell
                .select(&img_sel)
                .next()
                .and_then(|img| img.value().attr("alt"))
                .map(ToString::to_string)
                .and_then(text_or_none);
            let product_id = attr_u64(input, "value");
            if let (Some(id), Some(name)) = (product_id, name.as_ref()) {
                id_to_name.insert(id, name.clone());
            }
            expected.push(ProductRef { name, product_id });
        } else if let Some(basket_cell) = read_basket_cell(cell, &link_sel, &span_sel) {
            basket_cells.push(basket_cell);
        }
    }

    if expected.is_empty() {
        return Err(ReaderError::Markup("no product cells found".to_string()));
    }

    let mut records = Vec::new();
    for cell in basket_cells {
        if cell.spans.is_empty() {
            continue;
        }
        // Offers whose product id is not on the page get a blank name and
        // are dropped as unkeyed during reconciliation.
        let name = cell
            .product_id
            .and_then(|id| id_to_name.get(&id).cloned())
            .unwrap_or_default();
        let mut builder = Offer::builder(name, summary_cell_price(&cell.spans)?)
            .brand(cell.brand)
            .category(cell.category)
            .product_id(cell.product_id);
        if let Some(shop) = cell.spans.get("offer-shop-domain") {
            builder = builder.shop(shop.clone());
        }
        records.push(BasketRecord {
            basket: cell.basket,
            offer: builder.build()?,
        });
    }

    Ok(ParsedPage {
        title: page_title(&document)?,
        records,
        expected: Some(expected),
    })
}

/// Category listing page: one `.cat-prod-row` per product; the page is one basket.
#[derive(Debug, Clone)]
pub struct ListingPageReader {
    loader: PageLoader,
}

impl ListingPageReader {
    pub fn new(loader: PageLoader) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl SourceReader for ListingPageReader {
    fn reader_id(&self) -> &'static str {
        "listing"
    }

    async fn read(&self, ctx: &ReadContext, locator: &str) -> Result<PageExtract, ReaderError> {
        let page = self.loader.load(ctx.run_id, &ctx.target, locator).await?;
        let parsed = parse_listing_page(&page.text(), locator)?;
        debug!(locator, records = parsed.records.len(), "listing page parsed");
        Ok(PageExtract::from_parsed(&page, parsed))
    }
}

/// Price text of a `.price` element, preferring its split value/penny spans.
fn price_text(price: ElementRef<'_>, value_sel: &Selector, penny_sel: &Selector) -> String {
    let value = price.select(value_sel).next().map(element_text);
    let penny = price.select(penny_sel).next().map(element_text);
    match (value, penny) {
        (Some(value), Some(penny)) => format!("{}{}", value.trim(), penny.trim()),
        _ => strip_currency(&element_text(price)),
    }
}

/// Parse a listing page. Offers land in a basket named after the page
/// title, or `fallback_basket` for untitled pages.
pub fn parse_listing_page(html: &str, fallback_basket: &str) -> Result<ParsedPage, ReaderError> {
    let document = Html::parse_document(html);
    let row_sel = selector(".cat-prod-row")?;
    let name_sel = selector(".cat-prod-row__name")?;
    let price_sel = selector(".price")?;
    let value_sel = selector(".value")?;
    let penny_sel = selector(".penny")?;
    let review_sel = selector(".prod-review__qo")?;
    let offer_sel = selector(".product-offers li")?;
    let shop_sel = selector(".shop")?;

    let title = page_title(&document)?;
    let basket = title.clone().unwrap_or_else(|| fallback_basket.to_string());

    let mut records = Vec::new();
    for row in document.select(&row_sel) {
        let name = attr_unquoted(row, "data-productname")
            .or_else(|| row.select(&name_sel).next().map(element_text).and_then(text_or_none))
            .unwrap_or_default();
        // Competing offers sit inside the row too; the headline price is the
        // first `.price` outside the offers list.
        let offers: Vec<ElementRef<'_>> = row.select(&offer_sel).collect();
        let nested: Vec<_> = offers
            .iter()
            .flat_map(|o| o.select(&price_sel))
            .map(|p| p.id())
            .collect();
        let raw_price = row
            .select(&price_sel)
            .find(|p| !nested.contains(&p.id()))
            .map(|p| price_text(p, &value_sel, &penny_sel))
            .ok_or(ParseError::MissingField("price"))?;

        let mut builder = Offer::builder(name, raw_price)
            .brand(attr_unquoted(row, "data-brand"))
            .category(attr_unquoted(row, "data-category"))
            .product_id(attr_u64(row, "data-pid"))
            .review_count(
                row.select(&review_sel)
                    .next()
                    .and_then(|r| first_digits(&element_text(r))),
            );
        for (idx, offer) in offers.iter().enumerate() {
            let shop = attr_unquoted(*offer, "data-shop")
                .or_else(|| offer.select(&shop_sel).next().map(element_text).and_then(text_or_none))
                .unwrap_or_default();
            let price = offer
                .select(&price_sel)
                .next()
                .map(|p| price_text(p, &value_sel, &penny_sel))
                .ok_or(ParseError::MissingField("price"))?;
            builder = builder.sub_offer(idx as u32 + 1, shop, price);
        }

        records.push(BasketRecord {
            basket: basket.clone(),
            offer: builder.build()?,
        });
    }

    Ok(ParsedPage {
        title,
        records,
        expected: None,
    })
}

/// Offers exported as JSON (manual captures, API dumps).
#[derive(Debug, Clone)]
pub struct JsonOffersReader {
    loader: PageLoader,
}

impl JsonOffersReader {
    pub fn new(loader: PageLoader) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl SourceReader for JsonOffersReader {
    fn reader_id(&self) -> &'static str {
        "json"
    }

    async fn read(&self, ctx: &ReadContext, locator: &str) -> Result<PageExtract, ReaderError> {
        let page = self.loader.load(ctx.run_id, &ctx.target, locator).await?;
        let parsed = parse_json_export(&page.text())?;
        Ok(PageExtract::from_parsed(&page, parsed))
    }
}

#[derive(Debug, Deserialize)]
struct JsonExport {
    title: Option<String>,
    #[serde(default)]
    baskets: BTreeMap<String, Vec<JsonOffer>>,
    expected: Option<Vec<ProductRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonPrice {
    Number(f64),
    Text(String),
}

impl JsonPrice {
    fn as_raw(&self) -> String {
        match self {
            JsonPrice::Number(n) => n.to_string(),
            JsonPrice::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonOffer {
    name: Option<String>,
    price: Option<JsonPrice>,
    shop: Option<String>,
    brand: Option<String>,
    category: Option<String>,
    product_id: Option<u64>,
    review_count: Option<u32>,
    #[serde(default)]
    sub_offers: Vec<JsonSubOffer>,
}

#[derive(Debug, Deserialize)]
struct JsonSubOffer {
    rank: u32,
    shop: String,
    price: JsonPrice,
}

pub fn parse_json_export(text: &str) -> Result<ParsedPage, ReaderError> {
    let export: JsonExport = serde_json::from_str(text)?;
    let mut records = Vec::new();
    for (basket, offers) in export.baskets {
        for offer in offers {
            let name = offer.name.ok_or(ParseError::MissingField("name"))?;
            let price = offer.price.ok_or(ParseError::MissingField("price"))?;
            let mut builder = match price {
                JsonPrice::Number(n) => Offer::priced(name, n),
                JsonPrice::Text(s) => Offer::builder(name, s),
            }
            .brand(offer.brand)
            .category(offer.category)
            .product_id(offer.product_id)
            .review_count(offer.review_count);
            if let Some(shop) = offer.shop {
                builder = builder.shop(shop);
            }
            for sub in &offer.sub_offers {
                builder = builder.sub_offer(sub.rank, sub.shop.clone(), sub.price.as_raw());
            }
            records.push(BasketRecord {
                basket: basket.clone(),
                offer: builder.build()?,
            });
        }
    }
    Ok(ParsedPage {
        title: export.title.and_then(text_or_none),
        records,
        expected: export.expected,
    })
}
