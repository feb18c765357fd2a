//! Per-query string arena.
//!
//! Every string the parser allocates (identifiers, attribute names, string
//! literals) is interned here and handed out as an [`ArenaStr`]. Handles stay
//! valid for as long as anything holds them; the arena itself drops its
//! references only when the owning query is torn down.

use std::borrow::Borrow;
use std::collections::TryReserveError;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Shared handle to an interned string. The empty string is a static
/// sentinel that owns no allocation.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaStr(Option<Arc<str>>);

impl ArenaStr {
    /// The empty-string sentinel.
    pub const EMPTY: ArenaStr = ArenaStr(None);

    /// Wraps a string that does not come from a query arena (e.g. a
    /// deserialized plan or a bind parameter value).
    pub fn new(text: &str) -> Self {
        if text.is_empty() {
            Self::EMPTY
        } else {
            ArenaStr(Some(Arc::from(text)))
        }
    }

    /// Borrowed view.
    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or("")
    }

    /// Whether this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Shared string for building values.
    pub fn to_arc(&self) -> Arc<str> {
        match &self.0 {
            Some(text) => Arc::clone(text),
            None => Arc::from(""),
        }
    }

    /// Whether both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &ArenaStr) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Hash for ArenaStr {
    // Must agree with `str` so maps keyed by `ArenaStr` can be probed with `&str`.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl Deref for ArenaStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for ArenaStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for ArenaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ArenaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ArenaStr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ArenaStr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(ArenaStr::new(&text))
    }
}

/// Append-only string store owned by one query.
#[derive(Default)]
pub struct StringArena {
    entries: Vec<Arc<str>>,
    bytes: usize,
}

impl StringArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `text`, decoding escape sequences first when `must_unescape`
    /// is set. The empty string (before or after decoding) returns the
    /// sentinel without allocating.
    pub fn register(&mut self, text: &str, must_unescape: bool) -> Result<ArenaStr, TryReserveError> {
        if text.is_empty() {
            return Ok(ArenaStr::EMPTY);
        }
        let mut owned = String::new();
        owned.try_reserve(text.len())?;
        if must_unescape {
            unescape_into(text, &mut owned);
        } else {
            owned.push_str(text);
        }
        if owned.is_empty() {
            return Ok(ArenaStr::EMPTY);
        }
        self.entries.try_reserve(1)?;
        let shared: Arc<str> = Arc::from(owned);
        self.bytes += shared.len();
        self.entries.push(Arc::clone(&shared));
        Ok(ArenaStr(Some(shared)))
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes interned.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Decodes JSON-style escapes: `\n \r \t \b \f \\ \/ \' \"` and `\uXXXX`
/// (including surrogate pairs). Unknown escapes keep the escaped character;
/// malformed `\u` sequences are copied through unchanged.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    unescape_into(text, &mut out);
    out
}

fn unescape_into(text: &str, out: &mut String) {
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escaped) = chars.next() else {
            out.push('\\');
            break;
        };
        match escaped {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'u' => {
                let rest: String = chars.clone().take(4).collect();
                match u16::from_str_radix(&rest, 16) {
                    Ok(unit) if rest.len() == 4 => {
                        for _ in 0..4 {
                            chars.next();
                        }
                        push_utf16_unit(unit, &mut chars, out);
                    }
                    _ => {
                        out.push('\\');
                        out.push('u');
                    }
                }
            }
            other => out.push(other),
        }
    }
}

fn push_utf16_unit(
    unit: u16,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
) {
    if (0xD800..0xDC00).contains(&unit) {
        let lookahead: String = chars.clone().take(6).collect();
        if let Some(hex) = lookahead.strip_prefix("\\u") {
            if let Ok(low) = u16::from_str_radix(hex, 16) {
                if hex.len() == 4 && (0xDC00..0xE000).contains(&low) {
                    for _ in 0..6 {
                        chars.next();
                    }
                    let code = 0x10000 + ((u32::from(unit) - 0xD800) << 10) + (u32::from(low) - 0xDC00);
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                    return;
                }
            }
        }
    }
    out.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
}
