//! Reassembly of paged request bodies on the receiving side.

use crate::core::sync::transport::PageInfo;
use crate::{ArborError, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Partial uploads untouched for this long are dropped.
pub const PAGE_EVICTION: Duration = Duration::from_secs(20 * 60);

struct Partial {
    pages: Vec<Option<String>>,
    last_seen: Instant,
}

/// Buffers pages per request id until every page has arrived.
pub struct PageAssembler {
    partials: HashMap<String, Partial>,
    eviction: Duration,
}

impl Default for PageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAssembler {
    pub fn new() -> Self {
        Self {
            partials: HashMap::new(),
            eviction: PAGE_EVICTION,
        }
    }

    #[must_use]
    pub fn with_eviction(mut self, eviction: Duration) -> Self {
        self.eviction = eviction;
        self
    }

    /// Number of requests still missing pages.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Stores one page; returns the whole body, pages in index order, once complete.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::Protocol`] if the page index is out of range or
    /// the page count disagrees with earlier pages of the same request.
    pub fn accept(&mut self, page: &PageInfo, body: String) -> Result<Option<String>> {
        let now = Instant::now();
        self.evict_stale(now);

        if page.page_count == 0 || page.page_index >= page.page_count {
            return Err(ArborError::Protocol(format!(
                "Page {} of {} is out of range",
                page.page_index, page.page_count
            )));
        }

        let partial = self
            .partials
            .entry(page.request_id.clone())
            .or_insert_with(|| Partial {
                pages: vec![None; page.page_count],
                last_seen: now,
            });
        if partial.pages.len() != page.page_count {
            return Err(ArborError::Protocol(format!(
                "Request {} changed its page count from {} to {}",
                page.request_id,
                partial.pages.len(),
                page.page_count
            )));
        }
        partial.pages[page.page_index] = Some(body);
        partial.last_seen = now;

        if partial.pages.iter().any(Option::is_none) {
            return Ok(None);
        }
        let complete = self
            .partials
            .remove(&page.request_id)
            .map(|p| p.pages.into_iter().flatten().collect::<String>());
        Ok(complete)
    }

    /// Drops partial uploads idle for longer than the eviction window.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let eviction = self.eviction;
        let before = self.partials.len();
        self.partials.retain(|request_id, partial| {
            let keep = now.saturating_duration_since(partial.last_seen) <= eviction;
            if !keep {
                log::warn!("Discarding abandoned paged request {request_id}");
            }
            keep
        });
        before - self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: &str, index: usize, count: usize) -> PageInfo {
        PageInfo {
            request_id: id.to_string(),
            page_index: index,
            page_count: count,
        }
    }

    #[test]
    fn test_out_of_order_pages_reassemble_in_order() {
        let mut assembler = PageAssembler::new();
        assert_eq!(assembler.accept(&page("r1", 2, 3), "c".into()).unwrap(), None);
        assert_eq!(assembler.accept(&page("r1", 0, 3), "a".into()).unwrap(), None);
        assert_eq!(assembler.pending(), 1);
        assert_eq!(assembler.accept(&page("r1", 1, 3), "b".into()).unwrap().as_deref(), Some("abc"));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_requests_are_kept_apart() {
        let mut assembler = PageAssembler::new();
        assembler.accept(&page("r1", 0, 2), "x".into()).unwrap();
        assembler.accept(&page("r2", 0, 2), "1".into()).unwrap();
        assert_eq!(assembler.accept(&page("r2", 1, 2), "2".into()).unwrap().as_deref(), Some("12"));
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_inconsistent_pages_are_rejected() {
        let mut assembler = PageAssembler::new();
        assert!(assembler.accept(&page("r1", 3, 3), "x".into()).is_err());
        assembler.accept(&page("r1", 0, 2), "x".into()).unwrap();
        assert!(assembler.accept(&page("r1", 1, 5), "y".into()).is_err());
    }

    #[test]
    fn test_abandoned_uploads_are_evicted() {
        let mut assembler = PageAssembler::new().with_eviction(Duration::from_secs(60));
        assembler.accept(&page("r1", 0, 2), "x".into()).unwrap();

        assert_eq!(assembler.evict_stale(Instant::now()), 0);
        assert_eq!(assembler.evict_stale(Instant::now() + Duration::from_secs(61)), 1);
        assert_eq!(assembler.pending(), 0);
    }
}
