//! CSS-selector based extraction for marketplace pages

use crate::extract::{is_asin, DealItem, ListingPage, PageExtractor};
use crate::storage::ProductData;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

/// Default [`PageExtractor`] for marketplace HTML
#[derive(Debug, Default, Clone)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl PageExtractor for HtmlExtractor {
    fn product(&self, document: &str) -> ProductData {
        let document = Html::parse_document(document);
        let availability = first_text(
            &document,
            &[".a-size-medium.a-color-success", "#availability"],
        );

        ProductData {
            title: first_text(&document, &["span#productTitle"]),
            price: first_text(
                &document,
                &[
                    ".a-price .a-offscreen",
                    "[data-a-color='price'] .a-offscreen",
                    "#size_name_0_price",
                ],
            ),
            category: extract_category(&document),
            is_prime: Some(has_any(
                &document,
                &[
                    "i.a-icon.a-icon-prime",
                    "#primeExclusiveBadge_feature_div",
                    "img[alt*='Prime']",
                ],
            )),
            brand: extract_brand(&document),
            rank: extract_rank(&document),
            availability_quantity: availability.as_deref().and_then(parse_left_in_stock),
            availability_status: availability,
            color: first_text(&document, &["#variation_color_name .selection"]),
            size: first_text(&document, &["#variation_size_name .selection"]),
            date_first_available: extract_bullet(&document, "date first available"),
            discount_coupon: first_text(&document, &[".couponLabelText"]),
            rating_stars: first_text(&document, &["#acrPopover .a-icon-alt"])
                .and_then(|text| text.split_whitespace().next().map(str::to_string)),
            purchase_info: first_text(
                &document,
                &[
                    "#social-proofing-faceout-title-tk_bought",
                    ".social-proofing-faceout-title",
                ],
            ),
            proxy_country: extract_proxy_country(&document),
        }
    }

    fn listing(&self, document: &str) -> ListingPage {
        let document = Html::parse_document(document);
        let mut seen = HashSet::new();
        let mut asins = Vec::new();

        if let Ok(selector) = Selector::parse(".s-result-item[data-asin]") {
            for element in document.select(&selector) {
                if let Some(asin) = element.value().attr("data-asin") {
                    if is_asin(asin) && seen.insert(asin.to_string()) {
                        asins.push(asin.to_string());
                    }
                }
            }
        }

        // Fallback for result tiles without data attributes
        if let Ok(selector) = Selector::parse("a[href*='/dp/']") {
            for element in document.select(&selector) {
                if let Some(asin) = element.value().attr("href").and_then(asin_from_href) {
                    if seen.insert(asin.clone()) {
                        asins.push(asin);
                    }
                }
            }
        }

        ListingPage {
            asins,
            is_last_page: extract_is_last_page(&document),
            proxy_country: extract_proxy_country(&document),
        }
    }

    fn deals(&self, document: &str) -> Vec<DealItem> {
        let document = Html::parse_document(document);
        let mut seen = HashSet::new();
        let mut deals = Vec::new();

        let Ok(tile) = Selector::parse("[data-asin]") else {
            return deals;
        };
        let badge = Selector::parse("[class*='CouponExperienceBadge'], .couponLabelText").ok();

        for element in document.select(&tile) {
            let Some(asin) = element.value().attr("data-asin") else {
                continue;
            };
            if !is_asin(asin) || !seen.insert(asin.to_string()) {
                continue;
            }
            let discount = badge
                .as_ref()
                .and_then(|badge| element.select(badge).next())
                .map(element_text)
                .filter(|s| !s.is_empty());
            deals.push(DealItem {
                asin: asin.to_string(),
                discount,
            });
        }

        deals
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns the text of the first matching, non-empty element
fn first_text(document: &Html, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        document
            .select(&selector)
            .map(element_text)
            .find(|text| !text.is_empty())
    })
}

fn has_any(document: &Html, selectors: &[&str]) -> bool {
    selectors.iter().any(|raw| {
        Selector::parse(raw)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    })
}

/// Last breadcrumb of the category trail
fn extract_category(document: &Html) -> Option<String> {
    first_text(document, &[".a-unordered-list.a-horizontal.a-size-small"]).and_then(|trail| {
        trail
            .split('›')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string)
    })
}

fn extract_brand(document: &Html) -> Option<String> {
    if let Some(brand) = extract_table_value(document, "#productOverview_feature_div tr", "brand")
    {
        return Some(brand);
    }
    first_text(document, &["#bylineInfo"]).map(|byline| match byline.split_once(": ") {
        Some((_, brand)) => brand.to_string(),
        None => byline,
    })
}

fn extract_rank(document: &Html) -> Option<u32> {
    if let Ok(selector) = Selector::parse(
        "#detailBulletsWrapper_feature_div li, #detailBullets_feature_div .a-list-item",
    ) {
        for element in document.select(&selector) {
            let text = element_text(element);
            if is_rank_label(&text) {
                if let Some(rank) = parse_rank(&text) {
                    return Some(rank);
                }
            }
        }
    }

    let selector = Selector::parse(
        "#productDetails_detailBullets_sections1 tr, #productDetails_techSpec_section_1 tr",
    )
    .ok()?;
    let th = Selector::parse("th").ok()?;
    let td = Selector::parse("td").ok()?;
    document.select(&selector).find_map(|row| {
        let label = row.select(&th).next().map(element_text)?;
        if !is_rank_label(&label) {
            return None;
        }
        row.select(&td).next().map(element_text).and_then(|v| parse_rank(&v))
    })
}

fn is_rank_label(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("best sellers rank")
        || lower.contains("best seller rank")
        || lower.contains("bestseller-rang")
}

/// Parses the first number after the label, e.g. `#1,234 in Toys` or `Nr. 1.234 in Spielzeug`
fn parse_rank(text: &str) -> Option<u32> {
    let start = match text.find('#') {
        Some(idx) => idx + 1,
        None => text.find(|c: char| c.is_ascii_digit())?,
    };
    let digits: String = text[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn parse_left_in_stock(text: &str) -> Option<u32> {
    let lower = text.to_lowercase();
    let rest = &lower[lower.find("only ")? + 5..];
    let (number, tail) = rest.split_once(' ')?;
    if !tail.starts_with("left in stock") {
        return None;
    }
    number.parse().ok()
}

fn extract_bullet(document: &Html, label: &str) -> Option<String> {
    let selector = Selector::parse("#detailBullets_feature_div .a-list-item").ok()?;
    document.select(&selector).find_map(|item| {
        let text = element_text(item);
        let (key, value) = text.split_once(':')?;
        let key = key.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ');
        if key.trim().eq_ignore_ascii_case(label) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn extract_table_value(document: &Html, rows: &str, label: &str) -> Option<String> {
    let selector = Selector::parse(rows).ok()?;
    let cell = Selector::parse("td").ok()?;
    document.select(&selector).find_map(|row| {
        let cells: Vec<String> = row.select(&cell).map(element_text).collect();
        match cells.as_slice() {
            [key, value, ..] if key.eq_ignore_ascii_case(label) => Some(value.clone()),
            _ => None,
        }
    })
}

fn extract_is_last_page(document: &Html) -> bool {
    if let Ok(selector) = Selector::parse(".a-pagination li.a-last") {
        if let Some(next) = document.select(&selector).next() {
            return next.value().classes().any(|c| c == "a-disabled");
        }
    }

    let Ok(selector) = Selector::parse(".s-pagination-strip .s-pagination-next") else {
        return true;
    };
    match document.select(&selector).next() {
        Some(next) => next.value().classes().any(|c| c == "s-pagination-disabled"),
        None => true,
    }
}

fn extract_proxy_country(document: &Html) -> Option<String> {
    let line = first_text(document, &["#glow-ingress-line2"])
        .filter(|text| !text.to_lowercase().contains("update location"));
    line.or_else(|| first_text(document, &["#glow-ingress-block"]))
}

fn asin_from_href(href: &str) -> Option<String> {
    let rest = &href[href.find("/dp/")? + 4..];
    let candidate = rest.get(..10)?;
    is_asin(candidate).then(|| candidate.to_string())
}
