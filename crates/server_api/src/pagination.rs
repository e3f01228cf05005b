use serde::Deserialize;
use shared::{error::ApiError, protocol::PageInfo};

pub const PAGE_SIZE: u32 = 5;

/// Query string accepted by every list view: `?page=<n|last>&q=<search>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
    pub q: Option<String>,
}

impl ListQuery {
    pub fn page(page: impl Into<String>) -> Self {
        Self {
            page: Some(page.into()),
            q: None,
        }
    }

    pub fn search(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// Splits `count` rows into pages of `per_page`. An empty result still has one page.
#[derive(Debug, Clone, Copy)]
pub struct Paginator {
    count: i64,
    per_page: u32,
}

impl Paginator {
    pub fn new(count: i64, per_page: u32) -> Self {
        Self {
            count: count.max(0),
            per_page: per_page.max(1),
        }
    }

    pub fn num_pages(&self) -> u32 {
        if self.count == 0 {
            return 1;
        }
        let per_page = i64::from(self.per_page);
        let pages = (self.count + per_page - 1) / per_page;
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    /// Resolves the raw `page` parameter. Missing or blank means the first
    /// page, `last` the final one; anything else must be an in-range number.
    pub fn resolve(&self, raw: Option<&str>) -> Result<u32, ApiError> {
        let raw = raw.map(str::trim).filter(|raw| !raw.is_empty());
        let number = match raw {
            None => 1,
            Some("last") => self.num_pages(),
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                ApiError::not_found("Invalid page: that page number is not an integer")
            })?,
        };
        if number < 1 {
            return Err(ApiError::not_found(
                "Invalid page: that page number is less than 1",
            ));
        }
        if number > self.num_pages() {
            return Err(ApiError::not_found(
                "Invalid page: that page contains no results",
            ));
        }
        Ok(number)
    }

    pub fn offset(&self, number: u32) -> i64 {
        i64::from(number.saturating_sub(1)) * i64::from(self.per_page)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }

    pub fn page_info(&self, number: u32) -> PageInfo {
        let num_pages = self.num_pages();
        PageInfo {
            number,
            num_pages,
            count: self.count,
            per_page: self.per_page,
            has_next: number < num_pages,
            has_previous: number > 1,
            is_paginated: num_pages > 1,
        }
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
