//! Walk paginated list APIs and collect every item.

use reqwest::Url;
use serde_json::Value;

use crate::client::ServiceClient;
use crate::error::{SdkError, SdkResult};
use crate::json::path_search_str;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStrategy {
    /// `marker=<last id>`; `page_info.next_marker` wins when present
    Marker { marker_field: String },
    /// `offset=<items seen so far>`
    Offset,
    /// `page=1, 2, ...`
    PageNumber,
}

#[derive(Debug, Clone)]
pub struct ListOpts {
    pub strategy: PageStrategy,
    /// Key of the item array; the first array in the body when unset
    pub items_key: Option<String>,
    /// Page size sent as `limit`
    pub limit: Option<usize>,
}

impl ListOpts {
    pub fn marker() -> Self {
        Self {
            strategy: PageStrategy::Marker {
                marker_field: "id".to_string(),
            },
            items_key: None,
            limit: None,
        }
    }

    pub fn offset() -> Self {
        Self {
            strategy: PageStrategy::Offset,
            items_key: None,
            limit: None,
        }
    }

    pub fn page_number() -> Self {
        Self {
            strategy: PageStrategy::PageNumber,
            items_key: None,
            limit: None,
        }
    }

    pub fn items_key(mut self, key: impl Into<String>) -> Self {
        self.items_key = Some(key.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn cursor_param(&self) -> &'static str {
        match self.strategy {
            PageStrategy::Marker { .. } => "marker",
            PageStrategy::Offset => "offset",
            PageStrategy::PageNumber => "page",
        }
    }
}

fn page_url(base: &Url, opts: &ListOpts, cursor: Option<&str>) -> Url {
    let cursor_param = opts.cursor_param();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(k, _)| k != cursor_param && (opts.limit.is_none() || k != "limit"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = base.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(kept);
        if let Some(limit) = opts.limit {
            pairs.append_pair("limit", &limit.to_string());
        }
        if let Some(cursor) = cursor {
            pairs.append_pair(cursor_param, cursor);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    url
}

fn extract_items(body: &Value, items_key: Option<&str>) -> Vec<Value> {
    let array = match items_key {
        Some(key) => body.get(key).and_then(Value::as_array),
        None => body
            .as_object()
            .and_then(|o| o.values().find_map(Value::as_array))
            .or_else(|| body.as_array()),
    };
    array.cloned().unwrap_or_default()
}

/// GET every page of `url` and concatenate the items
pub async fn list_all_items(
    client: &ServiceClient,
    url: &str,
    opts: &ListOpts,
) -> SdkResult<Vec<Value>> {
    let base = Url::parse(url).map_err(|e| SdkError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let mut all = Vec::new();
    let mut cursor: Option<String> = match opts.strategy {
        PageStrategy::PageNumber => Some("1".to_string()),
        _ => None,
    };

    loop {
        let page = page_url(&base, opts, cursor.as_deref());
        let body = client.get(page.as_str()).await?;
        let items = extract_items(&body, opts.items_key.as_deref());
        let count = items.len();
        log::debug!("{} returned {} items", page, count);

        let next = match &opts.strategy {
            PageStrategy::Marker { marker_field } => {
                if body.get("page_info").is_some() {
                    path_search_str("page_info.next_marker", &body)
                } else {
                    items
                        .last()
                        .and_then(|item| item.get(marker_field))
                        .and_then(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                }
            }
            PageStrategy::Offset => {
                let seen = cursor.as_deref().and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
                Some((seen + count).to_string())
            }
            PageStrategy::PageNumber => {
                let page = cursor.as_deref().and_then(|c| c.parse::<usize>().ok()).unwrap_or(1);
                Some((page + 1).to_string())
            }
        };

        all.extend(items);

        let short_page = opts.limit.is_some_and(|limit| count < limit);
        let total_reached = body
            .get("count")
            .and_then(Value::as_u64)
            .is_some_and(|total| all.len() as u64 >= total)
            && opts.strategy == PageStrategy::Offset;
        if count == 0 || short_page || total_reached {
            break;
        }
        match next {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }

    Ok(all)
}
