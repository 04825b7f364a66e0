//! Workshop page extraction
//!
//! Pure functions over fetched HTML. Every field is recovered by an ordered
//! list of independent strategies; the first one returning something wins.
//! Nothing here fails: a page that changed shape yields empty lists and a
//! placeholder name.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::types::{compare_versions, major_minor, placeholder_name, Dependency, ModVersionInfo};

/// Name selectors, most specific first
const NAME_SELECTORS: &[&str] = &[
    ".workshopItemTitle",
    ".apphub_AppName",
    ".workshopItemDetailsHeader h1",
    "[class*=\"title\"]",
];

/// Page regions that normally carry the version tags
const VERSION_REGIONS: &[&str] = &[
    ".rightDetailsBlock",
    ".detailsStatsContainerRight",
    ".workshopItemTags",
    ".workshopItemDetailsHeader",
    ".workshopItemDescription",
];

/// Containers of the "Required items" list
const REQUIRED_CONTAINERS: &[&str] = &[
    "#RequiredItems",
    ".requiredItemsContainer",
    ".workshopItemRequiredItems",
    ".requiredItems",
    ".dependencyList",
];

/// IDs this short are never real workshop items
const MIN_PAGE_SCAN_ID_LEN: usize = 7;

type VersionStrategy = fn(&Html) -> Vec<String>;
type DependencyStrategy = fn(&Html, &str, &str) -> Vec<Dependency>;

const VERSION_STRATEGIES: &[(&str, VersionStrategy)] = &[
    ("item regions", versions_from_regions),
    ("whole page", versions_from_page),
];

const DEPENDENCY_STRATEGIES: &[(&str, DependencyStrategy)] = &[
    ("required items container", dependencies_from_containers),
    ("required items heading", dependencies_from_heading),
    ("page link scan", dependencies_from_page_links),
];

/// Extract everything we know how to read from an item page
pub fn parse_item_page(html: &str, item_id: &str) -> ModVersionInfo {
    let document = Html::parse_document(html);
    ModVersionInfo {
        mod_name: extract_name(&document, item_id),
        supported_versions: extract_versions(&document),
        dependencies: extract_dependencies(&document, html, item_id),
    }
}

/// Item title, or "Mod {id}" when no selector matched
pub fn extract_name(document: &Html, item_id: &str) -> String {
    NAME_SELECTORS
        .iter()
        .find_map(|sel| first_text(document, sel))
        .unwrap_or_else(|| placeholder_name(item_id))
}

/// Declared game versions as sorted, unique `major.minor` strings
pub fn extract_versions(document: &Html) -> Vec<String> {
    for (name, strategy) in VERSION_STRATEGIES {
        let found = strategy(document);
        if !found.is_empty() {
            debug!("Versions found via {}: {:?}", name, found);
            return found;
        }
    }
    Vec::new()
}

/// Required items, deduplicated by ID and never including the item itself
pub fn extract_dependencies(document: &Html, html: &str, item_id: &str) -> Vec<Dependency> {
    for (name, strategy) in DEPENDENCY_STRATEGIES {
        let found = strategy(document, html, item_id);
        if !found.is_empty() {
            debug!("{} dependencies found via {}", found.len(), name);
            return found;
        }
    }
    Vec::new()
}

/// Pull version tokens out of free text.
///
/// Matches a keyword ("Mod", "version", "versions") followed by a run of
/// comma or space separated version numbers, e.g. `Mod, 1.4, 1.5`.
pub fn versions_in_text(text: &str) -> Vec<String> {
    static LIST_RE: OnceLock<Regex> = OnceLock::new();
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let list_re = LIST_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:mod|versions?)[\s:,]+((?:\d+\.\d+(?:\.\d+)*[\s,]*)+)")
            .expect("valid version list regex")
    });
    let token_re = TOKEN_RE
        .get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)*").expect("valid version token regex"));

    let mut versions: Vec<String> = list_re
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .flat_map(|list| token_re.find_iter(list.as_str()))
        .filter_map(|m| major_minor(m.as_str()))
        .collect();
    versions.sort_by(|a, b| compare_versions(a, b));
    versions.dedup();
    versions
}

fn versions_from_regions(document: &Html) -> Vec<String> {
    let text: Vec<String> = VERSION_REGIONS
        .iter()
        .filter_map(|sel| Selector::parse(sel).ok())
        .flat_map(|sel| {
            document
                .select(&sel)
                .map(|el| element_text(&el))
                .collect::<Vec<_>>()
        })
        .collect();
    versions_in_text(&text.join("\n"))
}

fn versions_from_page(document: &Html) -> Vec<String> {
    versions_in_text(&element_text(&document.root_element()))
}

fn dependencies_from_containers(document: &Html, _html: &str, item_id: &str) -> Vec<Dependency> {
    let mut deps = DependencySet::new(item_id);
    for sel in REQUIRED_CONTAINERS {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        for container in document.select(&selector) {
            deps.collect_links(&container);
        }
    }
    deps.into_vec()
}

/// Find a "Required items" heading and read links from its surroundings
fn dependencies_from_heading(document: &Html, _html: &str, item_id: &str) -> Vec<Dependency> {
    let Ok(any) = Selector::parse("*") else {
        return Vec::new();
    };

    for heading in document.select(&any).filter(has_required_heading_text) {
        // The list is usually a sibling of the heading, so look one or two
        // levels up
        let mut node = heading.parent();
        for _ in 0..2 {
            let Some(ancestor) = node.and_then(ElementRef::wrap) else {
                break;
            };
            let mut deps = DependencySet::new(item_id);
            deps.collect_links(&ancestor);
            if !deps.is_empty() {
                return deps.into_vec();
            }
            node = ancestor.parent();
        }
    }
    Vec::new()
}

/// Last resort: every item link in the raw page.
///
/// Only used when the page mentions required items at all, otherwise the
/// "related items" links would all look like dependencies.
fn dependencies_from_page_links(_document: &Html, html: &str, item_id: &str) -> Vec<Dependency> {
    if !html.to_ascii_lowercase().contains("required items") {
        return Vec::new();
    }

    let mut deps = DependencySet::new(item_id);
    for caps in item_link_re().captures_iter(html) {
        if let Some(id) = caps.get(1).map(|m| m.as_str()) {
            if id.len() >= MIN_PAGE_SCAN_ID_LEN {
                deps.push(id, None);
            }
        }
    }
    deps.into_vec()
}

fn item_link_re() -> &'static Regex {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    LINK_RE.get_or_init(|| Regex::new(r"filedetails/\?id=(\d+)").expect("valid item link regex"))
}

/// Workshop item ID from a link target
pub fn item_id_from_href(href: &str) -> Option<&str> {
    item_link_re()
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn has_required_heading_text(el: &ElementRef<'_>) -> bool {
    el.children()
        .filter_map(|child| child.value().as_text())
        .any(|text| text.to_ascii_lowercase().contains("required items"))
}

/// Ordered, ID-unique dependency list that skips the page's own item
struct DependencySet {
    self_id: String,
    seen: HashSet<String>,
    deps: Vec<Dependency>,
}

impl DependencySet {
    fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            seen: HashSet::new(),
            deps: Vec::new(),
        }
    }

    fn push(&mut self, id: &str, name: Option<String>) {
        if id == self.self_id || !self.seen.insert(id.to_string()) {
            return;
        }
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| placeholder_name(id));
        self.deps.push(Dependency::required(id, name));
    }

    fn collect_links(&mut self, scope: &ElementRef<'_>) {
        let Ok(links) = Selector::parse("a[href]") else {
            return;
        };
        for link in scope.select(&links) {
            if let Some(id) = link.value().attr("href").and_then(item_id_from_href) {
                self.push(id, Some(element_text(&link)));
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    fn into_vec(self) -> Vec<Dependency> {
        self.deps
    }
}

/// Trimmed text of the first element matching `selector`, if non-empty
fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .map(|el| element_text(&el))
        .find(|text| !text.is_empty())
}

/// Element text with whitespace collapsed
fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
