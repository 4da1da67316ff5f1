//! Page requests and the page of results they produce.

use crate::error::{DbError, DbResult};
use serde::Serialize;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PER_PAGE: u64 = 20;

/// Raw page arguments, as they arrive from a query string or a caller.
///
/// Values are validated by [`PageRequest::resolve`]: with `error_out` set, a
/// non-integer or non-positive page or page size is a not-found error, the
/// same signal an out-of-range page produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    page: Option<String>,
    per_page: Option<String>,
    max_per_page: Option<u64>,
    error_out: bool,
    count: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: None,
            per_page: None,
            max_per_page: None,
            error_out: true,
            count: true,
        }
    }
}

/// Validated page arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: u64,
    pub per_page: u64,
    pub error_out: bool,
    pub count: bool,
}

impl PageParams {
    /// Rows to skip, or `None` when the page lies beyond any representable
    /// SQL offset.
    pub fn offset(&self) -> Option<u64> {
        self.page
            .checked_sub(1)?
            .checked_mul(self.per_page)
            .filter(|offset| i64::try_from(*offset).is_ok())
    }
}

impl PageRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `page` and `per_page` from a URL query string.
    pub fn from_query(query: &str) -> Self {
        let mut request = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "page" => request.page = Some(value.into_owned()),
                "per_page" => request.per_page = Some(value.into_owned()),
                _ => {}
            }
        }
        request
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = Some(page.to_string());
        self
    }

    pub fn per_page(mut self, per_page: i64) -> Self {
        self.per_page = Some(per_page.to_string());
        self
    }

    pub fn max_per_page(mut self, max: u64) -> Self {
        self.max_per_page = Some(max);
        self
    }

    /// Turn bad arguments and empty pages into not-found errors (default: on).
    pub fn error_out(mut self, error_out: bool) -> Self {
        self.error_out = error_out;
        self
    }

    /// Run the count query (default: on). Without it the total is unknown.
    pub fn count(mut self, count: bool) -> Self {
        self.count = count;
        self
    }

    pub fn resolve(&self) -> DbResult<PageParams> {
        let page = self.arg(self.page.as_deref(), DEFAULT_PAGE)?;
        let mut per_page = self.arg(self.per_page.as_deref(), DEFAULT_PER_PAGE)?;
        if let Some(max) = self.max_per_page {
            per_page = per_page.min(max);
        }
        // A zero maximum clamps to an unusable size
        if per_page == 0 {
            if self.error_out {
                return Err(DbError::not_found(Some("Page size must be positive")));
            }
            per_page = DEFAULT_PER_PAGE;
        }
        let params = PageParams {
            page,
            per_page,
            error_out: self.error_out,
            count: self.count,
        };
        // Without error_out such a page is simply empty
        if params.offset().is_none() && self.error_out {
            return Err(DbError::not_found(Some(format!("Page {} is out of range", page))));
        }
        Ok(params)
    }

    fn arg(&self, raw: Option<&str>, default: u64) -> DbResult<u64> {
        let Some(raw) = raw else {
            return Ok(default);
        };
        match raw.trim().parse::<i64>() {
            Ok(value) if value >= 1 => Ok(value as u64),
            _ if self.error_out => Err(DbError::not_found(Some(format!(
                "Invalid page argument '{}'",
                raw
            )))),
            _ => Ok(default),
        }
    }
}

/// One page of results plus navigation metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pagination<T> {
    pub page: u64,
    pub per_page: u64,
    /// Total row count; `None` when counting was disabled
    pub total: Option<u64>,
    pub items: Vec<T>,
}

impl<T> Pagination<T> {
    pub fn new(page: u64, per_page: u64, total: Option<u64>, items: Vec<T>) -> Self {
        Self {
            page,
            per_page,
            total,
            items,
        }
    }

    /// 1-based number of the first item on this page, 0 when empty.
    pub fn first(&self) -> u64 {
        if self.items.is_empty() {
            0
        } else {
            self.page
                .saturating_sub(1)
                .saturating_mul(self.per_page)
                .saturating_add(1)
        }
    }

    pub fn last(&self) -> u64 {
        let first = self.first();
        first
            .saturating_add(self.items.len() as u64)
            .saturating_sub(1)
            .max(first)
    }

    pub fn pages(&self) -> u64 {
        match self.total {
            None | Some(0) => 0,
            Some(total) => total.div_ceil(self.per_page),
        }
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn prev_num(&self) -> Option<u64> {
        self.has_prev().then(|| self.page - 1)
    }

    pub fn has_next(&self) -> bool {
        self.page < self.pages()
    }

    pub fn next_num(&self) -> Option<u64> {
        self.has_next().then(|| self.page + 1)
    }

    /// Page numbers for a pagination widget with the default edge sizes.
    pub fn iter_pages(&self) -> Vec<Option<u64>> {
        self.iter_pages_with(2, 2, 4, 2)
    }

    /// Page numbers around the edges and the current page, `None` marking gaps.
    pub fn iter_pages_with(
        &self,
        left_edge: u64,
        left_current: u64,
        right_current: u64,
        right_edge: u64,
    ) -> Vec<Option<u64>> {
        let pages_end = self.pages() + 1;
        let mut out = Vec::new();
        if pages_end == 1 {
            return out;
        }

        let left_end = (1 + left_edge).min(pages_end);
        out.extend((1..left_end).map(Some));
        if left_end == pages_end {
            return out;
        }

        let mid_start = left_end.max(self.page.saturating_sub(left_current));
        let mid_end = self
            .page
            .saturating_add(right_current)
            .saturating_add(1)
            .min(pages_end);
        if mid_start > left_end {
            out.push(None);
        }
        out.extend((mid_start..mid_end).map(Some));
        if mid_end == pages_end {
            return out;
        }

        let right_start = mid_end.max(pages_end.saturating_sub(right_edge));
        if right_start > mid_end {
            out.push(None);
        }
        out.extend((right_start..pages_end).map(Some));
        out
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Pagination<U> {
        Pagination {
            page: self.page,
            per_page: self.per_page,
            total: self.total,
            items: self.items.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(page: u64, total: Option<u64>, items: usize) -> Pagination<u64> {
        Pagination::new(page, 10, total, (0..items as u64).collect())
    }

    #[test]
    fn test_first_and_last_page() {
        let p = page(1, Some(150), 10);
        assert_eq!(p.pages(), 15);
        assert!(!p.has_prev());
        assert_eq!(p.prev_num(), None);
        assert_eq!(p.next_num(), Some(2));
        assert_eq!((p.first(), p.last()), (1, 10));

        let p = page(15, Some(150), 5);
        assert!(!p.has_next());
        assert_eq!(p.prev_num(), Some(14));
        assert_eq!((p.first(), p.last()), (141, 145));
    }

    #[test]
    fn test_no_pages() {
        for total in [Some(0), None] {
            let p = page(1, total, 0);
            assert_eq!(p.pages(), 0);
            assert!(!p.has_next());
            assert_eq!((p.first(), p.last()), (0, 0));
            assert!(p.iter_pages().is_empty());
        }
    }

    #[test]
    fn test_iter_pages() {
        let cases: [(u64, Vec<Option<u64>>); 4] = [
            (1, vec![Some(1), Some(2), Some(3), Some(4), Some(5), None, Some(14), Some(15)]),
            (
                6,
                vec![
                    Some(1), Some(2), None, Some(4), Some(5), Some(6), Some(7), Some(8), Some(9),
                    Some(10), None, Some(14), Some(15),
                ],
            ),
            (
                9,
                vec![
                    Some(1), Some(2), None, Some(7), Some(8), Some(9), Some(10), Some(11),
                    Some(12), Some(13), Some(14), Some(15),
                ],
            ),
            (15, vec![Some(1), Some(2), None, Some(13), Some(14), Some(15)]),
        ];
        for (current, expected) in cases {
            assert_eq!(page(current, Some(150), 10).iter_pages(), expected, "page {current}");
        }

        let short = page(3, Some(40), 10);
        assert_eq!(short.iter_pages(), vec![Some(1), Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn test_resolve_defaults_and_clamp() {
        let params = PageRequest::new().resolve().unwrap();
        assert_eq!((params.page, params.per_page), (1, 20));

        let params = PageRequest::from_query("page=3&per_page=50")
            .max_per_page(25)
            .resolve()
            .unwrap();
        assert_eq!((params.page, params.per_page), (3, 25));
        assert_eq!(params.offset(), Some(50));
    }

    #[test]
    fn test_resolve_huge_page() {
        let query = format!("page={}&per_page=100", i64::MAX);
        let err = PageRequest::from_query(&query).resolve().unwrap_err();
        assert!(err.is_not_found());

        let params = PageRequest::from_query(&query)
            .error_out(false)
            .resolve()
            .unwrap();
        assert_eq!(params.page, i64::MAX as u64);
        assert_eq!(params.offset(), None);

        // Fits in u64 but not in a SQL BIGINT offset
        let params = PageParams {
            page: 1 << 62,
            per_page: 4,
            error_out: false,
            count: true,
        };
        assert_eq!(params.offset(), None);

        let params = PageRequest::new()
            .page(i64::MAX)
            .per_page(1)
            .resolve()
            .unwrap();
        assert_eq!(params.offset(), Some(i64::MAX as u64 - 1));
    }

    #[test]
    fn test_huge_page_metadata_does_not_overflow() {
        let p = Pagination::new(u64::MAX, 100, Some(45), vec![1u64]);
        assert_eq!(p.first(), u64::MAX);
        assert_eq!(p.last(), u64::MAX);
        assert!(!p.has_next());
        assert_eq!(p.iter_pages(), vec![Some(1)]);
        let empty = Pagination::<u64>::new(u64::MAX, 100, Some(45), Vec::new());
        assert_eq!((empty.first(), empty.last()), (0, 0));
    }

    #[test]
    fn test_resolve_bad_arguments() {
        for query in ["page=abc", "page=0", "per_page=-1"] {
            let err = PageRequest::from_query(query).resolve().unwrap_err();
            assert!(err.is_not_found(), "{query}");
        }

        let params = PageRequest::from_query("page=abc&per_page=0")
            .error_out(false)
            .resolve()
            .unwrap();
        assert_eq!((params.page, params.per_page), (1, 20));
    }
}
