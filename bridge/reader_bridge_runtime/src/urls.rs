use std::borrow::Cow;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Everything but the unreserved characters `- _ . ! ~ * ' ( )` is escaped,
/// matching what web views expect from an appended query parameter.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

pub fn decode_component(raw: &str) -> Option<Cow<'_, str>> {
    percent_decode_str(raw).decode_utf8().ok()
}

/// Appends `key=value` to `base`, starting a query string if there is none.
pub fn append_query_param(base: &str, key: &str, value: &str) -> String {
    let (without_fragment, fragment) = match base.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (base, None),
    };

    let separator = match without_fragment.find('?') {
        None => "?",
        Some(idx) if idx + 1 == without_fragment.len() => "",
        Some(_) if without_fragment.ends_with('&') => "",
        Some(_) => "&",
    };

    let mut url = format!(
        "{without_fragment}{separator}{}={}",
        encode_query_value(key),
        encode_query_value(value)
    );
    if let Some(fragment) = fragment {
        url.push('#');
        url.push_str(fragment);
    }
    url
}

/// Returns the raw (still encoded) value of the first `key` parameter.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| match pair.split_once('=') {
            Some((name, value)) => Some((name, value)),
            None if !pair.is_empty() => Some((pair, "")),
            None => None,
        })
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
}
