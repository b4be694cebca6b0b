use async_trait::async_trait;
use reqwest::Client;
use scraper::Html;
use tracing::debug;

use super::html::{article_body_from_ld_json, text_from_selector};
use super::Extractor;
use crate::error::{IngestError, Result};

/// Fetches an article page and reads its text, preferring JSON-LD
/// `articleBody` over the configured CSS selectors.
#[derive(Debug, Clone)]
pub struct ArticleExtractor {
    name: String,
    client: Client,
    selectors: Vec<String>,
}

impl ArticleExtractor {
    pub fn new(name: impl Into<String>, client: Client, selectors: Vec<String>) -> Self {
        Self {
            name: name.into(),
            client,
            selectors,
        }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    /// Parse synchronously; `Html` must not live across an await point.
    pub fn text_from_page(&self, page: &str) -> String {
        let document = Html::parse_document(page);
        if let Some(body) = article_body_from_ld_json(&document) {
            return body;
        }
        for selector in &self.selectors {
            if let Some(text) = text_from_selector(&document, selector) {
                debug!(extractor = %self.name, selector = %selector, "fell back to dom text");
                return text;
            }
        }
        String::new()
    }
}

#[async_trait]
impl Extractor for ArticleExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, url: &str) -> Result<String> {
        let page = self.fetch(url).await?;
        Ok(self.text_from_page(&page))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn extractor(selectors: &[&str]) -> ArticleExtractor {
        ArticleExtractor::new(
            "test",
            Client::new(),
            selectors.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn structured_data_wins_over_dom() {
        let page = r#"<script type="application/ld+json">{"articleBody":"From json."}</script>
            <div class="content"><p>From dom.</p></div>"#;
        assert_eq!(extractor(&[".content p"]).text_from_page(page), "From json.");
    }

    #[test]
    fn dom_fallback_and_empty_result() {
        let page = r#"<div class="content"><p>From dom.</p></div>"#;
        assert_eq!(extractor(&[".missing", ".content p"]).text_from_page(page), "From dom.");
        assert_eq!(extractor(&[]).text_from_page(page), "");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = extractor(&[])
            .extract(&format!("{}/gone", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn fetches_and_extracts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/read/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><script type="application/ld+json">{"articleBody":"hello world"}</script></html>"#,
            ))
            .mount(&server)
            .await;

        let text = extractor(&[])
            .extract(&format!("{}/read/1", server.uri()))
            .await
            .unwrap();
        assert_eq!(text, "hello world");
    }
}
