//! Text extraction helpers over a parsed page.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::debug;

/// Concatenated `articleBody` of every JSON-LD block on the page.
///
/// Handles a single object, a top-level array, and `@graph` containers.
/// Blocks that fail to decode are skipped.
pub fn article_body_from_ld_json(document: &Html) -> Option<String> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;
    let mut bodies = Vec::new();

    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => collect_article_bodies(&value, &mut bodies),
            Err(err) => debug!(error = %err, "skipping malformed ld+json block"),
        }
    }

    let joined = bodies.join("\n");
    let joined = joined.trim();
    (!joined.is_empty()).then(|| joined.to_owned())
}

fn collect_article_bodies(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_article_bodies(v, out)),
        Value::Object(map) => {
            if let Some(Value::String(body)) = map.get("articleBody") {
                let body = body.trim();
                if !body.is_empty() {
                    out.push(body.to_owned());
                }
            }
            if let Some(graph) = map.get("@graph") {
                collect_article_bodies(graph, out);
            }
        }
        _ => {}
    }
}

/// Text of every element matching `selector`, one line per element.
/// Returns `None` for an invalid selector or when nothing matched.
pub fn text_from_selector(document: &Html, selector: &str) -> Option<String> {
    let selector = match Selector::parse(selector) {
        Ok(selector) => selector,
        Err(err) => {
            debug!(selector, error = %err, "invalid css selector");
            return None;
        }
    };

    let lines: Vec<String> = document
        .select(&selector)
        .map(element_text)
        .filter(|line| !line.is_empty())
        .collect();

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Trimmed text nodes of `element`, joined by single spaces.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
