use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::analyzer::{AnalysisResult, PageAnalyzer};
use crate::browser::PageHandle;

/// Tags that mark a page as built for pre-HTML5 browsers
const DEPRECATED_TAGS: &[&str] = &["font", "center", "marquee", "blink", "frame", "frameset", "applet"];

/// A form found on the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormInfo {
    pub action: Option<String>,
    pub method: String,
    pub fields: Vec<String>,
}

/// Signals of legacy construction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyMarkers {
    pub uses_frames: bool,
    pub layout_tables: usize,
    pub inline_event_handlers: usize,
    pub deprecated_tags: Vec<String>,
}

/// Structural inventory of a rendered page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInventory {
    pub title: Option<String>,
    pub description: Option<String>,
    pub headings: Vec<String>,
    pub internal_links: Vec<String>,
    pub external_links: Vec<String>,
    pub forms: Vec<FormInfo>,
    pub scripts: Vec<String>,
    pub inline_scripts: usize,
    pub iframes: Vec<String>,
    pub legacy: LegacyMarkers,
}

/// Default analyzer: inventories the rendered DOM of each page
pub struct HtmlPageAnalyzer {
    max_links: usize,
}

impl HtmlPageAnalyzer {
    pub fn new(max_links: usize) -> Self {
        Self { max_links }
    }
}

impl Default for HtmlPageAnalyzer {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl PageAnalyzer for HtmlPageAnalyzer {
    async fn analyze(&self, page: &PageHandle, url: &str, _output_root: &Path) -> Result<AnalysisResult> {
        let source = page.source().await.context("Failed to get page source")?;
        let final_url = page
            .current_url()
            .await
            .unwrap_or_else(|_| url.to_string());

        let inventory = build_inventory(&source, &final_url, self.max_links)?;
        debug!(
            "Analyzed {}: {} link(s), {} form(s)",
            url,
            inventory.internal_links.len() + inventory.external_links.len(),
            inventory.forms.len()
        );

        let mut result = AnalysisResult::new(url, serde_json::to_value(&inventory)?);
        result.title = inventory.title.clone();
        result.final_url = Some(final_url);
        Ok(result)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector '{}': {:?}", css, e))
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse `html` and collect the page inventory. Links are resolved against `base_url`.
pub fn build_inventory(html: &str, base_url: &str, max_links: usize) -> Result<PageInventory> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut inventory = PageInventory::default();

    inventory.title = document
        .select(&selector("title")?)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty());

    inventory.description = document
        .select(&selector("meta[name=description]")?)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|c| c.trim().to_string());

    inventory.headings = document
        .select(&selector("h1, h2, h3")?)
        .map(text_of)
        .filter(|t| !t.is_empty())
        .collect();

    let mut seen = HashSet::new();
    for anchor in document.select(&selector("a[href]")?) {
        if seen.len() >= max_links {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let resolved = match &base {
            Some(base) => base.join(href).ok(),
            None => Url::parse(href).ok(),
        };
        let Some(mut resolved) = resolved else {
            continue;
        };
        resolved.set_fragment(None);
        let link = resolved.to_string();
        if !seen.insert(link.clone()) {
            continue;
        }
        let internal = base
            .as_ref()
            .map_or(false, |b| b.host_str() == resolved.host_str());
        if internal {
            inventory.internal_links.push(link);
        } else {
            inventory.external_links.push(link);
        }
    }

    let field_selector = selector("input[name], select[name], textarea[name]")?;
    for form in document.select(&selector("form")?) {
        let fields = form
            .select(&field_selector)
            .filter_map(|f| f.value().attr("name").map(str::to_string))
            .collect();
        inventory.forms.push(FormInfo {
            action: form.value().attr("action").map(str::to_string),
            method: form.value().attr("method").unwrap_or("get").to_uppercase(),
            fields,
        });
    }

    for script in document.select(&selector("script")?) {
        match script.value().attr("src") {
            Some(src) => inventory.scripts.push(src.to_string()),
            None => inventory.inline_scripts += 1,
        }
    }

    inventory.iframes = document
        .select(&selector("iframe[src]")?)
        .filter_map(|f| f.value().attr("src").map(str::to_string))
        .collect();

    inventory.legacy = legacy_markers(&document)?;

    Ok(inventory)
}

fn legacy_markers(document: &Html) -> Result<LegacyMarkers> {
    let mut markers = LegacyMarkers {
        uses_frames: document.select(&selector("frameset, frame")?).next().is_some(),
        ..Default::default()
    };

    // Tables without header cells are almost always used for layout
    let header_cells = selector("th")?;
    markers.layout_tables = document
        .select(&selector("table")?)
        .filter(|t| t.select(&header_cells).next().is_none())
        .count();

    let mut deprecated = HashSet::new();
    for element in document.select(&selector("*")?) {
        let value = element.value();
        markers.inline_event_handlers += value
            .attrs()
            .filter(|(name, _)| name.len() > 2 && name.starts_with("on"))
            .count();
        if DEPRECATED_TAGS.contains(&value.name()) {
            deprecated.insert(value.name().to_string());
        }
    }
    markers.deprecated_tags = deprecated.into_iter().collect();
    markers.deprecated_tags.sort();

    Ok(markers)
}
