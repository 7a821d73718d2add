//! Header fields for requests and responses.
//!
//! Names compare ASCII case-insensitively. Order is kept as received, and a
//! name may appear more than once.

/// Ordered list of `(name, value)` header fields.
///
/// # Examples
///
/// ```
/// use rstash::http::Headers;
///
/// let mut fields = Headers::new();
/// fields.insert("Content-Type", "image/webp");
/// fields.insert("Content-Length", "2048");
///
/// assert_eq!(fields.get("content-type"), Some("image/webp"));
/// assert_eq!(fields.content_length(), Some(2048));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sized for `n` fields; the request parser knows the count up front.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            fields: Vec::with_capacity(n),
        }
    }

    /// Adds a field after the existing ones. Earlier fields with the same
    /// name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    fn named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.named(name).next()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// `Content-Length` as a number; `None` when absent or not a number.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// Field count, duplicates included.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}
