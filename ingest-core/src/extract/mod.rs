//! Source-specific article extraction.
//!
//! Workers never branch on a site name. They ask the [`ExtractorRegistry`]
//! for the extractor whose matcher accepts the article URL; adding a source
//! means registering another entry.

pub mod article;
pub mod html;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::config::SourceConfig;
use crate::error::Result;

pub use article::ArticleExtractor;

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Plain article text. Unparsable pages yield an empty string; only
    /// transport failures and non-2xx responses are errors.
    async fn extract(&self, url: &str) -> Result<String>;
}

type UrlPredicate = dyn Fn(&Url) -> bool + Send + Sync;

#[derive(Clone)]
pub enum SourceMatcher {
    /// Host equals the domain or is one of its subdomains.
    Host(String),
    Predicate(Arc<UrlPredicate>),
}

impl SourceMatcher {
    pub fn host(domain: impl Into<String>) -> Self {
        Self::Host(domain.into().trim().trim_start_matches('.').to_ascii_lowercase())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, url: &Url) -> bool {
        match self {
            Self::Host(domain) => url.host_str().is_some_and(|host| {
                let host = host.to_ascii_lowercase();
                host == *domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }),
            Self::Predicate(f) => f(url),
        }
    }
}

impl fmt::Debug for SourceMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(domain) => f.debug_tuple("Host").field(domain).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    entries: Vec<(SourceMatcher, Arc<dyn Extractor>)>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`ArticleExtractor`] per configured host, sharing `client`.
    pub fn from_sources(client: &Client, sources: &[SourceConfig]) -> Self {
        let mut registry = Self::new();
        for source in sources {
            let extractor = ArticleExtractor::new(
                source.host.clone(),
                client.clone(),
                source.selectors.clone(),
            );
            registry.register(SourceMatcher::host(&source.host), Arc::new(extractor));
        }
        registry
    }

    pub fn register(&mut self, matcher: SourceMatcher, extractor: Arc<dyn Extractor>) -> &mut Self {
        self.entries.push((matcher, extractor));
        self
    }

    /// First registered extractor accepting `url`. Unparsable URLs match nothing.
    pub fn resolve(&self, url: &str) -> Option<Arc<dyn Extractor>> {
        let parsed = Url::parse(url.trim()).ok()?;
        self.entries
            .iter()
            .find(|(matcher, _)| matcher.matches(&parsed))
            .map(|(_, extractor)| Arc::clone(extractor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|(matcher, extractor)| (matcher, extractor.name())),
            )
            .finish()
    }
}
