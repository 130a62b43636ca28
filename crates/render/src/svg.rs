//! Element id discovery in floorplan SVG documents.

use once_cell::sync::Lazy;
use regex::Regex;

static ID_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\sid\s*=\s*(?:"([^"]+)"|'([^']+)')"#).unwrap());

/// Every `id` attribute value in document order, duplicates removed.
pub fn element_ids(svg: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in ID_ATTR.captures_iter(svg) {
        let Some(m) = cap.get(1).or_else(|| cap.get(2)) else { continue };
        let id = m.as_str();
        if !out.iter().any(|x| x == id) {
            out.push(id.to_string());
        }
    }
    out
}
