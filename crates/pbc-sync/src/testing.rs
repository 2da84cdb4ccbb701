//! Scripted source reader for orchestrator and controller tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pbc_adapters::{BasketRecord, PageExtract, ReadContext, ReaderError, SourceReader};
use pbc_core::{Offer, ProductRef};
use uuid::Uuid;

pub fn ctx() -> ReadContext {
    ReadContext {
        run_id: Uuid::new_v4(),
        target: "test".to_string(),
    }
}

pub fn record(basket: &str, name: &str, price: f64) -> BasketRecord {
    BasketRecord {
        basket: basket.to_string(),
        offer: Offer::priced(name, price).build().expect("valid offer"),
    }
}

#[derive(Default)]
pub struct ScriptedReader {
    failing: HashSet<String>,
    panicking: HashSet<String>,
    delays: HashMap<String, Duration>,
    pages: HashMap<String, Vec<BasketRecord>>,
    expected: HashMap<String, Vec<ProductRef>>,
    titles: HashMap<String, String>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedReader {
    pub fn fail(mut self, locator: &str) -> Self {
        self.failing.insert(locator.to_string());
        self
    }

    pub fn fail_all(mut self, locators: &[String]) -> Self {
        self.failing.extend(locators.iter().cloned());
        self
    }

    pub fn panic_on(mut self, locator: &str) -> Self {
        self.panicking.insert(locator.to_string());
        self
    }

    pub fn delay(mut self, locator: &str, delay: Duration) -> Self {
        self.delays.insert(locator.to_string(), delay);
        self
    }

    /// Earlier locators sleep longer, so they complete last.
    pub fn staggered(mut self, locators: &[String], step: Duration) -> Self {
        let n = locators.len() as u32;
        for (i, locator) in locators.iter().enumerate() {
            self.delays.insert(locator.clone(), step * (n - i as u32));
        }
        self
    }

    pub fn page(mut self, locator: &str, records: Vec<BasketRecord>) -> Self {
        self.pages.insert(locator.to_string(), records);
        self
    }

    pub fn expect(mut self, locator: &str, names: &[&str]) -> Self {
        self.expected.insert(
            locator.to_string(),
            names
                .iter()
                .map(|n| ProductRef {
                    name: Some(n.to_string()),
                    product_id: None,
                })
                .collect(),
        );
        self
    }

    pub fn title(mut self, locator: &str, title: &str) -> Self {
        self.titles.insert(locator.to_string(), title.to_string());
        self
    }
}

#[async_trait]
impl SourceReader for ScriptedReader {
    fn reader_id(&self) -> &'static str {
        "scripted"
    }

    async fn read(&self, _ctx: &ReadContext, locator: &str) -> Result<PageExtract, ReaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(locator) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panicking.contains(locator) {
            panic!("scripted panic for {locator}");
        }
        if self.failing.contains(locator) {
            return Err(ReaderError::Message(format!("scripted failure for {locator}")));
        }

        let records = self
            .pages
            .get(locator)
            .cloned()
            .unwrap_or_else(|| vec![record("default", locator, 1.0)]);
        Ok(PageExtract {
            locator: locator.to_string(),
            fetched_at: Utc::now(),
            title: self.titles.get(locator).cloned(),
            records,
            expected: self.expected.get(locator).cloned(),
        })
    }
}
