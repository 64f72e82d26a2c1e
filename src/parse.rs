//! Pluggable page parsers.
//!
//! The crawl core never interprets HTML itself; it goes through the
//! [`ListingPageParser`] and [`DetailPageParser`] boundaries. The shipped
//! implementations target the finn.no page shape: search-result pages link
//! each listing with a `finnkode=` query parameter, and detail pages lay
//! key facts out as label/value pairs.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::listing::PROPERTY_FIELDS;

/// Errors raised by detail-page parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The page does not look like a listing detail page at all.
    /// Treated as permanent for the affected item.
    #[error("unrecognized detail page shape: {reason}")]
    UnrecognizedShape {
        /// What was missing.
        reason: String,
    },
}

/// Extracts listing identifiers from a search-result page.
///
/// An empty result signals end-of-results to the discovery crawler.
pub trait ListingPageParser: Send + Sync {
    /// Returns the codes found on the page, in document order, deduplicated.
    fn parse_listing_page(&self, html: &str) -> Vec<String>;
}

/// Extracts a flat field map from a listing detail page.
///
/// Every known field name is present in the returned map; fields the page
/// does not provide hold empty strings.
pub trait DetailPageParser: Send + Sync {
    /// Parses the detail page into field/value pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnrecognizedShape`] when the page carries none
    /// of the expected structure.
    fn parse_detail_page(&self, html: &str) -> Result<BTreeMap<String, String>, ParseError>;
}

/// Default search-page parser: anchors whose href carries a `finnkode=`
/// query parameter.
pub struct FinnListingParser {
    link_selector: Selector,
}

impl Default for FinnListingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FinnListingParser {
    /// Creates the parser with its static selector.
    ///
    /// # Panics
    ///
    /// Panics if the static selector fails to compile, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            link_selector: Selector::parse(r#"a[href*="finnkode="]"#)
                .expect("static selector is valid"),
        }
    }
}

impl ListingPageParser for FinnListingParser {
    #[instrument(skip_all, fields(bytes = html.len()))]
    fn parse_listing_page(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut codes = Vec::new();

        for element in document.select(&self.link_selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            if let Some(code) = extract_finn_code(href) {
                if seen.insert(code.clone()) {
                    codes.push(code);
                }
            }
        }

        debug!(codes = codes.len(), "parsed listing page");
        codes
    }
}

/// Pulls the `finnkode` query value out of an href.
fn extract_finn_code(href: &str) -> Option<String> {
    let (_, tail) = href.split_once("finnkode=")?;
    let code: String = tail.chars().take_while(|c| *c != '&' && *c != '#').collect();
    if code.is_empty() { None } else { Some(code) }
}

/// Label/value vocabulary of the detail page, in field order.
///
/// Labels are matched case-insensitively against whole text lines; the
/// following non-empty line is the value. `true` marks numeric fields whose
/// values are reduced to digits.
const DETAIL_LABELS: [(&str, &str, bool); 15] = [
    ("prisantydning", "asking_price", true),
    ("totalpris", "total_price", true),
    ("omkostninger", "costs", true),
    ("fellesgjeld", "joint_debt", true),
    ("felleskost/mnd.", "monthly_fee", true),
    ("boligtype", "property_type", false),
    ("eieform", "ownership", false),
    ("soverom", "bedrooms", true),
    ("internt bruksareal", "internal_area", true),
    ("bruksareal", "usable_area", true),
    ("eksternt bruksareal", "external_usable_area", true),
    ("etasje", "floor", true),
    ("byggeår", "build_year", true),
    ("rom", "rooms", true),
    ("område", "local_area", false),
];

/// Bounded number of gallery images captured per record.
const MAX_IMAGES: usize = 3;

/// Default detail-page parser for the finn.no ad layout.
pub struct FinnDetailParser {
    address_selector: Selector,
    image_selector: Selector,
    title_selector: Selector,
    label_value_re: Regex,
}

impl Default for FinnDetailParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FinnDetailParser {
    /// Creates the parser with its static selectors.
    ///
    /// # Panics
    ///
    /// Panics if a static selector or regex fails to compile, which cannot
    /// happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            address_selector: Selector::parse(r#"[data-testid="object-address"]"#)
                .expect("static selector is valid"),
            image_selector: Selector::parse("img[src]").expect("static selector is valid"),
            title_selector: Selector::parse("title").expect("static selector is valid"),
            label_value_re: Regex::new(r"\s+").expect("static regex is valid"),
        }
    }

    fn title(&self, document: &Html) -> String {
        document
            .select(&self.title_selector)
            .next()
            .map(|t| t.text().collect::<String>())
            .map(|t| {
                t.split('|')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            })
            .unwrap_or_default()
    }

    fn address(&self, document: &Html, lines: &[String]) -> String {
        if let Some(element) = document.select(&self.address_selector).next() {
            let text: String = element.text().collect::<String>();
            return self.collapse(&text);
        }
        // Fallback: label line followed by the address value
        value_after_label(lines, "adresse").unwrap_or_default()
    }

    fn images(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.image_selector)
            .filter_map(|img| img.value().attr("src"))
            .filter(|src| src.starts_with("http"))
            .take(MAX_IMAGES)
            .map(ToString::to_string)
            .collect()
    }

    /// Collapses runs of whitespace into single spaces.
    fn collapse(&self, text: &str) -> String {
        self.label_value_re.replace_all(text.trim(), " ").to_string()
    }
}

impl DetailPageParser for FinnDetailParser {
    #[instrument(skip_all, fields(bytes = html.len()))]
    fn parse_detail_page(&self, html: &str) -> Result<BTreeMap<String, String>, ParseError> {
        let document = Html::parse_document(html);

        let lines: Vec<String> = document
            .root_element()
            .text()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();

        let mut fields: BTreeMap<String, String> = PROPERTY_FIELDS
            .iter()
            .map(|name| ((*name).to_string(), String::new()))
            .collect();

        let mut matched_labels = 0usize;
        for (label, field, numeric) in DETAIL_LABELS {
            if let Some(value) = value_after_label(&lines, label) {
                matched_labels += 1;
                let value = if numeric { digits(&value) } else { value };
                fields.insert(field.to_string(), value);
            }
        }

        let title = self.title(&document);
        if title.is_empty() && matched_labels == 0 {
            return Err(ParseError::UnrecognizedShape {
                reason: "no title and no known field labels".to_string(),
            });
        }

        fields.insert("title".to_string(), title);
        fields.insert("address".to_string(), self.address(&document, &lines));

        for (index, src) in self.images(&document).into_iter().enumerate() {
            fields.insert(format!("image_{index}"), src);
        }

        debug!(matched_labels, "parsed detail page");
        Ok(fields)
    }
}

/// Finds a line equal to `label` (case-insensitive) and returns the next line.
///
/// Exact-line equality keeps `bruksareal` from swallowing the
/// `internt bruksareal` and `eksternt bruksareal` entries.
fn value_after_label(lines: &[String], label: &str) -> Option<String> {
    let label_lower = label.to_lowercase();
    let position = lines.iter().position(|line| {
        let line = line.to_lowercase();
        line == label_lower || line.trim_end_matches(&[':', '.'][..]) == label_lower
    })?;
    lines.get(position + 1).cloned()
}

/// Reduces a value to its digits, normalizing prices ("4 500 000 kr") and
/// areas ("54 m²").
fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}
