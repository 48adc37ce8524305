//! JSON codec for the values exchanged with the reading engine.
//!
//! Decoding is lenient about extra fields: the engine owns these shapes and
//! may grow them at any time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Metadata reported by the engine once a book finished loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookMetaData {
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub identifier: Option<String>,
    pub toc: Vec<TocItem>,
}

/// A table-of-contents entry. The locator is opaque to native code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TocItem {
    pub label: String,
    #[serde(alias = "href", default)]
    pub locator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subitems: Vec<TocItem>,
}

impl TocItem {
    pub fn new(label: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            locator: locator.into(),
            subitems: Vec::new(),
        }
    }
}

/// Reading position reported on every relocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelocationInfo {
    pub fraction: f64,
    #[serde(default)]
    pub toc_item: Option<TocItem>,
}

impl RelocationInfo {
    pub fn percent(&self) -> u8 {
        progress_percent(self.fraction)
    }
}

/// Presentation settings of the engine, carried verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReaderTheme(Map<String, Value>);

impl ReaderTheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for ReaderTheme {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// `floor(fraction * 100)`, clamped to `0..=100`. Non-finite input reads as 0.
pub fn progress_percent(fraction: f64) -> u8 {
    if !fraction.is_finite() {
        return 0;
    }

    (fraction * 100.0).floor().clamp(0.0, 100.0) as u8
}

pub fn decode_book_metadata(raw: &str) -> Result<BookMetaData> {
    decode(raw, "book metadata")
}

pub fn decode_relocation(raw: &str) -> Result<RelocationInfo> {
    decode(raw, "relocation info")
}

pub fn decode_theme(raw: &str) -> Result<ReaderTheme> {
    decode(raw, "reader theme")
}

/// The engine answers `getFlow()` with the bare literal `null` when no flow is
/// set; every other (already unwrapped) result is the flow itself.
pub fn decode_flow(raw: &str) -> Option<String> {
    if raw == "null" {
        None
    } else {
        Some(raw.to_string())
    }
}

fn decode<T: DeserializeOwned>(raw: &str, what: &'static str) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| Error::Decode { what, source })
}

/// Strips one pair of surrounding double quotes added by the scripting bridge
/// to string results. Only a fully quote-delimited result is unwrapped.
pub fn unwrap_script_result(raw: &str) -> &str {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

/// Renders `value` as a double-quoted script string literal.
pub fn script_string_literal(value: &str) -> String {
    // serializing a &str cannot fail
    let json = serde_json::to_string(value).unwrap_or_else(|_| String::from("\"\""));
    escape_line_terminators(json)
}

/// Renders `value` as a script object/array literal.
pub fn script_value_literal<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value).map_err(Error::Encode)?;
    Ok(escape_line_terminators(json))
}

// JSON allows U+2028/U+2029 raw inside strings; older script engines do not.
fn escape_line_terminators(json: String) -> String {
    if !json.contains(['\u{2028}', '\u{2029}']) {
        return json;
    }

    json.replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn unwrap_strips_only_outer_quotes() {
        assert_eq!(unwrap_script_result("42"), "42");
        assert_eq!(unwrap_script_result("\"hello\""), "hello");
        assert_eq!(
            unwrap_script_result(r#""a \"quoted\" b""#),
            r#"a \"quoted\" b"#
        );
        assert_eq!(unwrap_script_result("null"), "null");
        assert_eq!(unwrap_script_result(r#"{"a":"b"}"#), r#"{"a":"b"}"#);
        assert_eq!(unwrap_script_result("\""), "\"");
        assert_eq!(unwrap_script_result("\"\""), "");
        assert_eq!(unwrap_script_result(r#"x "inner" y"#), r#"x "inner" y"#);
    }

    proptest! {
        #[test]
        fn unwrap_is_identity_without_leading_quote(raw in "[^\"].*") {
            prop_assert_eq!(unwrap_script_result(&raw), raw.as_str());
        }

        #[test]
        fn unwrap_removes_exactly_one_pair(inner in ".*") {
            let quoted = format!("\"{inner}\"");
            prop_assert_eq!(unwrap_script_result(&quoted), inner.as_str());
        }

        #[test]
        fn string_literal_parses_back(value in any::<String>()) {
            let literal = script_string_literal(&value);
            prop_assert!(!literal.contains('\u{2028}'), "literal contains raw U+2028");
            prop_assert!(!literal.contains('\n'));
            let parsed: String = serde_json::from_str(&literal).expect("literal is valid json");
            prop_assert_eq!(parsed, value);
        }
    }

    #[test]
    fn flow_null_sentinel_is_none() {
        assert_eq!(decode_flow("null"), None);
        assert_eq!(decode_flow(unwrap_script_result("\"paginated\"")), Some("paginated".into()));
        assert_eq!(decode_flow(""), Some(String::new()));
    }

    #[test]
    fn percent_floors_instead_of_rounding() {
        assert_eq!(progress_percent(0.0), 0);
        assert_eq!(progress_percent(0.5), 50);
        assert_eq!(progress_percent(0.999), 99);
        assert_eq!(progress_percent(1.0), 100);
        assert_eq!(progress_percent(1.7), 100);
        assert_eq!(progress_percent(-0.2), 0);
        assert_eq!(progress_percent(f64::NAN), 0);
    }

    #[test]
    fn metadata_ignores_unknown_fields() {
        let meta = decode_book_metadata(
            r#"{"title":"Dracula","author":"Bram Stoker","rendition":{"layout":"reflowable"},"cover":42}"#,
        )
        .expect("decode metadata");

        assert_eq!(meta.title.as_deref(), Some("Dracula"));
        assert_eq!(meta.author.as_deref(), Some("Bram Stoker"));
        assert!(meta.toc.is_empty());
    }

    #[test]
    fn metadata_decodes_nested_toc_with_href_locators() {
        let meta = decode_book_metadata(
            r#"{"toc":[{"label":"Part I","href":"p1.xhtml","subitems":[{"label":"Ch.1","href":"c1.xhtml"}]}]}"#,
        )
        .expect("decode metadata");

        assert_eq!(meta.toc[0].locator, "p1.xhtml");
        assert_eq!(meta.toc[0].subitems[0], TocItem::new("Ch.1", "c1.xhtml"));
    }

    #[test]
    fn type_mismatch_is_a_decode_error() {
        let err = decode_book_metadata(r#"{"title":7}"#).expect_err("title must be a string");
        assert!(matches!(err, Error::Decode { what: "book metadata", .. }));
    }

    #[test]
    fn relocation_allows_missing_or_null_toc_item() {
        let info = decode_relocation(r#"{"fraction":0.25,"tocItem":null}"#).expect("decode");
        assert_eq!(info.percent(), 25);
        assert_eq!(info.toc_item, None);

        let info = decode_relocation(r#"{"fraction":0.5,"cfi":"epubcfi(/6/4)"}"#).expect("decode");
        assert_eq!(info.toc_item, None);

        let info = decode_relocation(
            r#"{"fraction":0.5,"tocItem":{"label":"Ch.2","locator":"c2.xhtml"}}"#,
        )
        .expect("decode");
        assert_eq!(info.toc_item, Some(TocItem::new("Ch.2", "c2.xhtml")));
    }

    #[test]
    fn theme_fields_round_trip_verbatim() {
        let raw = r##"{"fontSize":18,"lineHeight":1.4,"colors":{"fg":"#111","bg":"#fafafa"},"custom":[1,"x",null]}"##;
        let theme = decode_theme(raw).expect("decode theme");
        let reencoded: Value =
            serde_json::from_str(&script_value_literal(&theme).expect("encode theme"))
                .expect("literal is json");

        assert_eq!(reencoded, serde_json::from_str::<Value>(raw).expect("raw is json"));
        assert_eq!(theme.get("fontSize"), Some(&json!(18)));
    }

    #[test]
    fn literals_escape_quotes_and_line_terminators() {
        assert_eq!(script_string_literal("it's"), r#""it's""#);
        assert_eq!(script_string_literal("a\"b\\c\n"), r#""a\"b\\c\n""#);
        assert_eq!(script_string_literal("x\u{2028}y"), r#""x\u2028y""#);

        let mut theme = ReaderTheme::new();
        theme.set("name", json!("');alert(1);//\u{2029}"));
        let literal = script_value_literal(&theme).expect("encode theme");
        assert_eq!(literal, r#"{"name":"');alert(1);//\u2029"}"#);
    }
}
