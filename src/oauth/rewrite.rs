//! Metadata rewriting
//!
//! Documents and redirect headers are produced against fixed internal base
//! addresses. [`MetadataRewriter`] swaps a leading internal base for the
//! request's [`PublicOrigin`] so nothing internal leaks to the client.

use serde_json::Value;

use crate::origin::PublicOrigin;

/// Rewrites internal base addresses to a public origin
#[derive(Debug, Clone)]
pub struct MetadataRewriter {
    internal_bases: Vec<String>,
}

impl MetadataRewriter {
    /// Create a rewriter for the given internal bases. Trailing slashes are
    /// ignored; longer bases are tried first.
    pub fn new<I, S>(internal_bases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bases: Vec<String> = internal_bases
            .into_iter()
            .map(|b| b.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|b| !b.is_empty())
            .collect();
        bases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        bases.dedup();
        Self {
            internal_bases: bases,
        }
    }

    /// Rewrite every matching string in a JSON value, recursively
    pub fn rewrite(&self, value: Value, origin: &PublicOrigin) -> Value {
        let public = origin.to_string();
        self.rewrite_value(value, &public)
    }

    fn rewrite_value(&self, value: Value, public: &str) -> Value {
        match value {
            Value::String(s) => match self.replace_prefix(&s, public) {
                Some(rewritten) => Value::String(rewritten),
                None => Value::String(s),
            },
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.rewrite_value(v, public))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.rewrite_value(v, public)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Rewrite a single header value (`Location`, `WWW-Authenticate`).
    ///
    /// A `Location` value is a URL and is matched as a whole. Parameter-style
    /// values are matched inside each double-quoted parameter.
    pub fn rewrite_str(&self, value: &str, origin: &PublicOrigin) -> String {
        let public = origin.to_string();
        if let Some(rewritten) = self.replace_prefix(value, &public) {
            return rewritten;
        }
        if !value.contains('"') {
            return value.to_string();
        }

        // Odd-numbered segments are the quoted parameter values
        value
            .split('"')
            .enumerate()
            .map(|(i, segment)| {
                if i % 2 == 1 {
                    self.replace_prefix(segment, &public)
                        .unwrap_or_else(|| segment.to_string())
                } else {
                    segment.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\"")
    }

    fn replace_prefix(&self, s: &str, public: &str) -> Option<String> {
        self.internal_bases.iter().find_map(|base| {
            let rest = s.strip_prefix(base.as_str())?;
            let boundary = rest.is_empty() || rest.starts_with(['/', '?', '#']);
            boundary.then(|| format!("{public}{rest}"))
        })
    }
}
