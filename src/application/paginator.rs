//! Multi-page collection retrieval.

use std::{num::NonZeroU32, sync::Arc};

use chrono::{Datelike, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::util::timezone::start_of_day;

use super::upstream::{Upstream, UpstreamQuery, decode_items, embedded_items};

/// Records gathered by one paginated walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<T> {
    pub records: Vec<T>,
    pub pages: u32,
    /// The page ceiling stopped the walk before the upstream ran dry.
    pub truncated: bool,
    /// A page call failed after retries; `records` stops short of the data.
    pub incomplete: bool,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            pages: 0,
            truncated: false,
            incomplete: false,
        }
    }
}

impl<T> Collection<T> {
    fn absorb(&mut self, other: Collection<T>) {
        self.records.extend(other.records);
        self.pages += other.pages;
        self.truncated |= other.truncated;
        self.incomplete |= other.incomplete;
    }
}

/// Inclusive `[from, to]` range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: i64,
    pub to: i64,
}

#[derive(Clone)]
pub struct Paginator {
    upstream: Arc<dyn Upstream>,
    page_size: NonZeroU32,
    max_pages: NonZeroU32,
}

impl Paginator {
    pub fn new(upstream: Arc<dyn Upstream>, page_size: NonZeroU32, max_pages: NonZeroU32) -> Self {
        Self {
            upstream,
            page_size,
            max_pages,
        }
    }

    pub fn with_max_pages(&self, max_pages: NonZeroU32) -> Self {
        Self {
            max_pages,
            ..self.clone()
        }
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    /// Walk `endpoint` from page 1 until a short page, an empty page, a failed
    /// call, or the page ceiling.
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        entity: &str,
        filter: &UpstreamQuery,
    ) -> Collection<T> {
        let page_size = self.page_size.get();
        let mut collection = Collection::default();

        for page in 1..=self.max_pages.get() {
            let body = match self.upstream.fetch(endpoint, &filter.page(page_size, page)).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        target = "leadcache::paginator",
                        endpoint,
                        page,
                        error = %err,
                        "page fetch failed; collection is incomplete"
                    );
                    collection.incomplete = true;
                    return collection;
                }
            };

            collection.pages = page;
            let returned = embedded_items(&body, entity).len();
            collection.records.extend(decode_items::<T>(&body, entity));

            debug!(
                target = "leadcache::paginator",
                endpoint,
                page,
                returned,
                accumulated = collection.records.len(),
                "page processed"
            );

            if returned < page_size as usize {
                return collection;
            }
        }

        warn!(
            target = "leadcache::paginator",
            endpoint,
            max_pages = self.max_pages.get(),
            accumulated = collection.records.len(),
            "page ceiling reached; collection truncated"
        );
        collection.truncated = true;
        collection
    }

    /// Run [`Self::fetch_all`] once per window, concatenating in window order.
    ///
    /// Stops at the first incomplete window: the caller will discard the
    /// result anyway.
    pub async fn fetch_windows<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        entity: &str,
        base: &UpstreamQuery,
        windows: &[DateWindow],
    ) -> Collection<T> {
        let mut combined = Collection::default();
        for window in windows {
            let filter = base.clone().created_between(window.from, window.to);
            let part = self.fetch_all(endpoint, entity, &filter).await;
            let stop = part.incomplete;
            combined.absorb(part);
            if stop {
                break;
            }
        }
        combined
    }
}

/// Split `[from, to]` into calendar-month windows of `tz`.
pub fn month_windows(from: i64, to: i64, tz: Tz) -> Vec<DateWindow> {
    let mut windows = Vec::new();
    let mut cursor = from;

    while cursor <= to {
        let next_start = tz
            .timestamp_opt(cursor, 0)
            .single()
            .and_then(|local| {
                let (year, month) = match local.month() {
                    12 => (local.year() + 1, 1),
                    month => (local.year(), month + 1),
                };
                NaiveDate::from_ymd_opt(year, month, 1)
            })
            .and_then(|date| start_of_day(date, tz));

        match next_start {
            Some(next) if next > cursor => {
                windows.push(DateWindow {
                    from: cursor,
                    to: (next - 1).min(to),
                });
                cursor = next;
            }
            _ => {
                windows.push(DateWindow { from: cursor, to });
                break;
            }
        }
    }

    windows
}
