//! Static-markup sources read with CSS selectors.
//!
//! The page is fetched with a single GET and parsed with [`scraper`]. The
//! first element matching the `item` selector is the latest headline; title,
//! link and id are read from inside it.

use super::body::{BodyRules, extract_body};
use super::{NewsSource, resolve_link};
use crate::config::SourceConfig;
use crate::error::{ConfigError, FetchError};
use crate::http::HttpFetcher;
use crate::models::Item;
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument};
use url::Url;

/// Selector strings for an [`HtmlSource`], as written in the config.
pub struct HtmlRules<'a> {
    pub item: &'a str,
    pub title: &'a str,
    pub link: &'a str,
    pub id_attr: &'a str,
}

pub struct HtmlSource {
    name: String,
    url: String,
    base: Url,
    item: Selector,
    title: Selector,
    link: Selector,
    id_attr: String,
    body: BodyRules,
    http: HttpFetcher,
}

fn parse_selector(source: &str, css: &str) -> Result<Selector, ConfigError> {
    Selector::parse(css)
        .map_err(|e| ConfigError::Invalid(format!("source {source:?}: bad selector {css:?}: {e}")))
}

impl HtmlSource {
    pub fn new(config: &SourceConfig, rules: HtmlRules<'_>, http: HttpFetcher) -> Result<Self, ConfigError> {
        let base = Url::parse(&config.url)
            .map_err(|e| ConfigError::Invalid(format!("source {:?}: bad url: {e}", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            base,
            item: parse_selector(&config.name, rules.item)?,
            title: parse_selector(&config.name, rules.title)?,
            link: parse_selector(&config.name, rules.link)?,
            id_attr: rules.id_attr.to_string(),
            body: config.body.clone(),
            http,
        })
    }

    /// Pull the latest item out of a fetched page.
    pub fn extract(&self, html: &str) -> Result<Item, FetchError> {
        let document = Html::parse_document(html);
        let not_found = |what: &str| FetchError::not_found(&self.url, what);

        let item = document
            .select(&self.item)
            .next()
            .ok_or_else(|| not_found("item container"))?;

        let title = item
            .select(&self.title)
            .next()
            .map(|el| el.text().collect::<String>())
            .ok_or_else(|| not_found("item title"))?;

        let href = item
            .select(&self.link)
            .next()
            .and_then(|el| el.value().attr("href"))
            .ok_or_else(|| not_found("item link"))?;
        let link = resolve_link(&self.base, href).ok_or_else(|| not_found("resolvable item link"))?;

        let id = item
            .value()
            .attr(&self.id_attr)
            .ok_or_else(|| not_found(&format!("item attribute {}", self.id_attr)))?;

        debug!(%id, %title, %link, "Found news item");
        Item::new(id, title.split_whitespace().collect::<Vec<_>>().join(" "), link)
            .ok_or_else(|| not_found("non-empty item fields"))
    }
}

#[async_trait]
impl NewsSource for HtmlSource {
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
        info!(id = %item.id, "Fetched latest item");
        Ok(Some(item))
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
    use std::time::Duration;

    const PAGE: &str = r#"<html><body>
      <div class="item js-rm-central-column-item item_big" data-id="42">
        <a class="item__link" href="/crypto/news/42">
          <span class="item__title">
            Bitcoin   breaks
            record
          </span>
        </a>
      </div>
      <div class="item js-rm-central-column-item" data-id="41">
        <a class="item__link" href="/crypto/news/41"><span class="item__title">Older</span></a>
      </div>
    </body></html>"#;

    fn source(id_attr: &str) -> HtmlSource {
        let config = SourceConfig {
            name: "rbc_crypto".into(),
            url: "https://www.rbc.ru/crypto/".into(),
            kind: SourceKind::Html {
                item: String::new(),
                title: String::new(),
                link: String::new(),
                id_attr: String::new(),
            },
            body: BodyRules::default(),
        };
        let http = HttpFetcher::new("test", Duration::from_secs(5), RetryPolicy::default()).unwrap();
        HtmlSource::new(
            &config,
            HtmlRules {
                item: "div.item.js-rm-central-column-item",
                title: "span.item__title",
                link: "a.item__link",
                id_attr,
            },
            http,
        )
        .unwrap()
    }

    #[test]
    fn test_extracts_first_item() {
        let item = source("data-id").extract(PAGE).unwrap();
        assert_eq!(item.id, "42");
        assert_eq!(item.title, "Bitcoin breaks record");
        assert_eq!(item.link, "https://www.rbc.ru/crypto/news/42");
    }

    #[test]
    fn test_missing_container_is_not_found() {
        let err = source("data-id").extract("<html><body></body></html>").unwrap_err();
        match err {
            FetchError::NotFound { url, what } => {
                assert_eq!(url, "https://www.rbc.ru/crypto/");
                assert_eq!(what, "item container");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_id_attribute_is_not_found() {
        let err = source("data-news-id").extract(PAGE).unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[test]
    fn test_empty_title_is_not_found() {
        let page = r#"<div class="item js-rm-central-column-item" data-id="1">
            <a class="item__link" href="/x"><span class="item__title">  </span></a></div>"#;
        assert!(matches!(source("data-id").extract(page), Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn test_same_page_yields_same_id() {
        let s = source("data-id");
        assert_eq!(s.extract(PAGE).unwrap(), s.extract(PAGE).unwrap());
    }
}
