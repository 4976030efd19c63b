//! Next.js pages: the latest item is read from the `__NEXT_DATA__` JSON blob
//! the server embeds for client-side hydration.

use super::body::{BodyRules, extract_body};
use super::{NewsSource, resolve_link};
use crate::config::SourceConfig;
use crate::error::{ConfigError, FetchError};
use crate::http::HttpFetcher;
use crate::models::{Item, id_from_json};
use crate::utils::{find_key, truncate_for_log};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

static NEXT_DATA: Lazy<Selector> = Lazy::new(|| Selector::parse("script#__NEXT_DATA__").unwrap());

/// JSON keys for the news list and the fields of each entry.
#[derive(Debug, Clone)]
pub struct NextDataKeys {
    pub list: String,
    pub id: String,
    pub title: String,
    pub link: String,
}

pub struct NextDataSource {
    name: String,
    url: String,
    base: Url,
    keys: NextDataKeys,
    body: BodyRules,
    http: HttpFetcher,
}

impl NextDataSource {
    pub fn new(config: &SourceConfig, keys: NextDataKeys, http: HttpFetcher) -> Result<Self, ConfigError> {
        let base = Url::parse(&config.url)
            .map_err(|e| ConfigError::Invalid(format!("source {:?}: bad url: {e}", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            base,
            keys,
            body: config.body.clone(),
            http,
        })
    }

    /// Pull the first list entry out of a fetched page.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the list is present but empty.
    pub fn extract(&self, html: &str) -> Result<Option<Item>, FetchError> {
        let data = self.embedded_json(html)?;
        let list = find_key(&data, &self.keys.list)
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::not_found(&self.url, format!("list {}", self.keys.list)))?;

        let Some(entry) = list.first() else {
            debug!(list = %self.keys.list, "News list is empty");
            return Ok(None);
        };

        let field = |key: &str| FetchError::not_found(&self.url, format!("entry field {key}"));
        let id = entry
            .get(&self.keys.id)
            .and_then(id_from_json)
            .ok_or_else(|| field(&self.keys.id))?;
        let title = entry
            .get(&self.keys.title)
            .and_then(Value::as_str)
            .ok_or_else(|| field(&self.keys.title))?;
        let link = entry
            .get(&self.keys.link)
            .and_then(Value::as_str)
            .and_then(|href| resolve_link(&self.base, href))
            .ok_or_else(|| field(&self.keys.link))?;

        Item::new(id, title, link)
            .map(Some)
            .ok_or_else(|| FetchError::not_found(&self.url, "non-empty entry fields"))
    }

    fn embedded_json(&self, html: &str) -> Result<Value, FetchError> {
        let document = Html::parse_document(html);
        let raw: String = document
            .select(&NEXT_DATA)
            .next()
            .ok_or_else(|| FetchError::not_found(&self.url, "__NEXT_DATA__ script"))?
            .text()
            .collect();
        serde_json::from_str(&raw).map_err(|e| {
            debug!(raw = %truncate_for_log(&raw, 200), "Unparseable __NEXT_DATA__");
            FetchError::not_found(&self.url, format!("valid __NEXT_DATA__ JSON ({e})"))
        })
    }
}

#[async_trait]
impl NewsSource for NextDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_url(&self) -> &str {
        &self.url
    }

    #[instrument(level = "info", skip_all, fields(source = %self.name))]
    async fn fetch_latest(&self) -> Result<Option<Item>, FetchError> {
        let html = self.http.get_page(&self.url).await?;
        let item = self.extract(&html)?;
        match &item {
            Some(item) => info!(id = %item.id, "Fetched latest item"),
            None => info!("Source lists no items"),
        }
        Ok(item)
    }

    #[instrument(level = "info", skip_all, fields(source = %self.name, %link))]
    async fn fetch_body(&self, link: &str) -> Result<Option<String>, FetchError> {
        let html = self.http.get_page(link).await?;
        Ok(extract_body(&html, &self.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::session::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn source() -> NextDataSource {
        let config = SourceConfig {
            name: "investing_latest".into(),
            url: "https://ru.investing.com/news/latest-news".into(),
            kind: SourceKind::NextData {
                list_key: String::new(),
                id_key: String::new(),
                title_key: String::new(),
                link_key: String::new(),
            },
            body: BodyRules::default(),
        };
        let http = HttpFetcher::new("test", Duration::from_secs(5), RetryPolicy::default()).unwrap();
        NextDataSource::new(
            &config,
            NextDataKeys {
                list: "_newsList".into(),
                id: "article_ID".into(),
                title: "title".into(),
                link: "href".into(),
            },
            http,
        )
        .unwrap()
    }

    fn page(data: Value) -> String {
        format!(
            r#"<html><head></head><body><div id="__next"></div>
            <script id="__NEXT_DATA__" type="application/json">{data}</script></body></html>"#
        )
    }

    #[test]
    fn test_extracts_first_entry() {
        let html = page(json!({
            "props": { "pageProps": { "state": { "newsStore": { "_newsList": [
                { "article_ID": 2670738, "title": "Bitcoin tops $70k", "href": "/news/cryptocurrency-news/article-2670738" },
                { "article_ID": 2670737, "title": "Older", "href": "/news/x" }
            ] } } } }
        }));
        let item = source().extract(&html).unwrap().unwrap();
        assert_eq!(item.id, "2670738");
        assert_eq!(item.title, "Bitcoin tops $70k");
        assert_eq!(
            item.link,
            "https://ru.investing.com/news/cryptocurrency-news/article-2670738"
        );
    }

    #[test]
    fn test_string_id_matches_numeric_id() {
        let numeric = page(json!({ "_newsList": [{ "article_ID": 5, "title": "t", "href": "/a" }] }));
        let string = page(json!({ "_newsList": [{ "article_ID": "5", "title": "t", "href": "/a" }] }));
        let s = source();
        assert_eq!(s.extract(&numeric).unwrap(), s.extract(&string).unwrap());
    }

    #[test]
    fn test_empty_list_is_none() {
        let html = page(json!({ "props": { "_newsList": [] } }));
        assert_eq!(source().extract(&html).unwrap(), None);
    }

    #[test]
    fn test_missing_blob_or_list_is_not_found() {
        let s = source();
        assert!(matches!(s.extract("<html></html>"), Err(FetchError::NotFound { .. })));
        let html = page(json!({ "props": { "other": [] } }));
        assert!(matches!(s.extract(&html), Err(FetchError::NotFound { .. })));
        let html = page(json!({ "_newsList": { "not": "an array" } }));
        assert!(matches!(s.extract(&html), Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn test_entry_without_title_is_not_found() {
        let html = page(json!({ "_newsList": [{ "article_ID": 1, "href": "/a" }] }));
        match source().extract(&html) {
            Err(FetchError::NotFound { what, .. }) => assert_eq!(what, "entry field title"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
