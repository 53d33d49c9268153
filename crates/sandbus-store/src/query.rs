//! SPARQL text construction
//!
//! Everything the harness sends to the store is built here, so quoting rules
//! live in one place.

use std::sync::LazyLock;

use regex::Regex;

use sandbus_core::ResourceId;

/// `prefix:local` with no further colons, e.g. `nie:url`
static PREFIXED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][\w-]*:[A-Za-z_][\w-]*$").expect("Invalid prefixed name regex")
});

/// Escape a string for use inside a double-quoted literal
pub fn escape_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// A double-quoted literal
pub fn literal(value: &str) -> String {
    format!("\"{}\"", escape_literal(value))
}

/// Render a class, property or resource reference
///
/// Prefixed names, bracketed IRIs, variables, blank nodes and the `a`
/// keyword pass through; anything else is wrapped in angle brackets.
pub fn term(value: &str) -> String {
    if value == "a"
        || value.starts_with('<')
        || value.starts_with('?')
        || value.starts_with("_:")
        || PREFIXED_NAME.is_match(value)
    {
        value.to_string()
    } else {
        format!("<{}>", value)
    }
}

/// Optional filters of a resource creation query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub url: Option<String>,
    pub title: Option<String>,
}

/// `SELECT ?urn` confirming that `id` is a resource of `class` with the
/// given URL/title
pub fn confirm_resource_query(class: &str, filter: &ResourceFilter, id: ResourceId) -> String {
    let mut pattern = format!("?urn a {}", term(class));
    if let Some(url) = &filter.url {
        pattern.push_str(&format!(" ; nie:url {}", literal(url)));
    }
    if let Some(title) = &filter.title {
        pattern.push_str(&format!(" ; nie:title {}", literal(title)));
    }
    format!(
        "SELECT ?urn WHERE {{ {} . FILTER (tracker:id(?urn) = {}) }}",
        pattern, id
    )
}

pub fn count_instances_query(class: &str) -> String {
    format!("SELECT COUNT(?u) WHERE {{ ?u a {} . }}", term(class))
}

pub fn resource_id_by_uri_query(uri: &str) -> String {
    format!("SELECT tracker:id({}) WHERE {{ }}", term(uri))
}

pub fn resource_id_by_url_query(url: &str) -> String {
    format!("SELECT tracker:id(?r) WHERE {{ ?r nie:url {} }}", literal(url))
}

/// `INSERT DATA` for one subject with `(predicate, object)` pairs
///
/// Objects are inserted verbatim, so literals must already be quoted.
pub fn insert_data(subject: &str, pairs: &[(&str, String)]) -> String {
    let body = pairs
        .iter()
        .map(|(predicate, object)| format!("{} {}", term(predicate), object))
        .collect::<Vec<_>>()
        .join(" ; ");
    format!("INSERT DATA {{ {} {} }}", term(subject), body)
}

pub fn delete_resource(subject: &str) -> String {
    format!("DELETE DATA {{ {} a rdfs:Resource }}", term(subject))
}
