//! Paged listing of cache index rows

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Listing order. Every order is newest or largest first except `url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntrySort {
    #[default]
    LastAccess,
    AccessCount,
    CreatedAt,
    Size,
    Url,
}

/// Raw listing parameters as received from the query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryListParams {
    pub page: Option<String>,
    pub page_size: Option<String>,
    pub sort: Option<String>,
    pub format: Option<String>,
}

/// Validated listing query. Values that do not parse fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryListQuery {
    /// 1-based
    pub page: u64,
    pub page_size: u64,
    pub sort: EntrySort,
    pub format: Option<String>,
}

impl Default for EntryListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: EntrySort::default(),
            format: None,
        }
    }
}

impl EntryListQuery {
    pub fn from_params(params: &EntryListParams) -> Self {
        let defaults = Self::default();
        let number = |raw: &Option<String>| raw.as_deref().and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            page: number(&params.page).filter(|p| *p > 0).unwrap_or(defaults.page),
            page_size: number(&params.page_size)
                .filter(|size| (1..=MAX_PAGE_SIZE).contains(size))
                .unwrap_or(defaults.page_size),
            sort: params
                .sort
                .as_deref()
                .and_then(|raw| EntrySort::from_str(raw.trim()).ok())
                .unwrap_or_default(),
            format: params
                .format
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_lowercase),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// One listed row
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub format: String,
    pub content_type: String,
    pub size: u64,
    pub access_count: u64,
    pub last_access: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// `/thumb/{id}.webp` when a thumbnail was stored
    pub thumb_url: Option<String>,
    /// Held in the memory working set right now
    pub resident: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryPage {
    pub items: Vec<EntrySummary>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

impl EntryPage {
    pub fn new(items: Vec<EntrySummary>, total: u64, query: &EntryListQuery) -> Self {
        Self {
            items,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total.div_ceil(query.page_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(page: &str, page_size: &str, sort: &str) -> EntryListParams {
        EntryListParams {
            page: Some(page.to_string()),
            page_size: Some(page_size.to_string()),
            sort: Some(sort.to_string()),
            format: Some(" PNG ".to_string()),
        }
    }

    #[rstest]
    #[case("3", "50", "access_count", 3, 50, EntrySort::AccessCount)]
    #[case("0", "0", "bogus", 1, 20, EntrySort::LastAccess)]
    #[case("-2", "101", "", 1, 20, EntrySort::LastAccess)]
    #[case("x", "100", "url", 1, 100, EntrySort::Url)]
    fn test_from_params(
        #[case] page: &str,
        #[case] page_size: &str,
        #[case] sort: &str,
        #[case] expected_page: u64,
        #[case] expected_size: u64,
        #[case] expected_sort: EntrySort,
    ) {
        let query = EntryListQuery::from_params(&params(page, page_size, sort));
        assert_eq!(query.page, expected_page);
        assert_eq!(query.page_size, expected_size);
        assert_eq!(query.sort, expected_sort);
        assert_eq!(query.format.as_deref(), Some("png"));
    }

    #[test]
    fn test_offset_and_total_pages() {
        let query = EntryListQuery {
            page: 3,
            page_size: 20,
            ..EntryListQuery::default()
        };
        assert_eq!(query.offset(), 40);
        assert_eq!(EntryPage::new(Vec::new(), 41, &query).total_pages, 3);
        assert_eq!(EntryPage::new(Vec::new(), 0, &query).total_pages, 0);
    }
}
