//! Page window arithmetic for browsing

use serde::{Deserialize, Serialize};

use crate::settings::PAGE_SIZE;

/// Highest page whose window still fits in an `i64`
pub const MAX_PAGE: i64 = i64::MAX / PAGE_SIZE - 1;

/// The `[min_count, max_count)` slice of a result set for one page
///
/// `previous_page` is negative on the first page; callers treat that as
/// "no previous page".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageWindow {
    pub min_count: i64,
    pub max_count: i64,
    pub next_page: i64,
    pub previous_page: i64,
}

impl PageWindow {
    /// Window for page `page`, clamped to `0..=MAX_PAGE`
    pub fn for_page(page: i64) -> Self {
        let page = page.clamp(0, MAX_PAGE);
        Self {
            min_count: page * PAGE_SIZE,
            max_count: page * PAGE_SIZE + PAGE_SIZE,
            next_page: page + 1,
            previous_page: page - 1,
        }
    }

    /// Number of rows to skip
    pub fn offset(&self) -> usize {
        self.min_count as usize
    }

    /// Maximum number of rows in the window
    pub fn limit(&self) -> usize {
        (self.max_count - self.min_count) as usize
    }
}

/// Parse a page request parameter; missing or non-numeric means page 0
pub fn parse_page(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0)
        .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_page() {
        let w = PageWindow::for_page(0);
        assert_eq!(w.min_count, 0);
        assert_eq!(w.max_count, 50);
        assert_eq!(w.next_page, 1);
        assert_eq!(w.previous_page, -1);
    }

    #[test]
    fn test_third_page() {
        let w = PageWindow::for_page(2);
        assert_eq!((w.min_count, w.max_count), (100, 150));
        assert_eq!((w.next_page, w.previous_page), (3, 1));
        assert_eq!(w.offset(), 100);
        assert_eq!(w.limit(), 50);
    }

    #[test]
    fn test_negative_page_clamped() {
        assert_eq!(PageWindow::for_page(-3), PageWindow::for_page(0));
    }

    #[test]
    fn test_huge_page_does_not_overflow() {
        let w = PageWindow::for_page(parse_page(Some("9223372036854775807")));
        assert_eq!(w, PageWindow::for_page(MAX_PAGE));
        assert_eq!(w.max_count - w.min_count, PAGE_SIZE);
        assert_eq!(w.next_page, MAX_PAGE + 1);
        assert_eq!(w.limit(), 50);
        assert_eq!(PageWindow::for_page(i64::MAX), w);
    }

    #[test]
    fn test_parse_page() {
        assert_eq!(parse_page(None), 0);
        assert_eq!(parse_page(Some("")), 0);
        assert_eq!(parse_page(Some("abc")), 0);
        assert_eq!(parse_page(Some("4")), 4);
        assert_eq!(parse_page(Some("-2")), 0);
    }
}
