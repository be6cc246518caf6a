//! authorized_keys line parsing and merging
//!
//! A line is `[options] [keytype] base64 [comment]`. Options are
//! comma-separated and may contain spaces inside double quotes, so they are
//! only looked for when a line has four or more whitespace-separated tokens.

use std::fmt;

/// One line of an authorized_keys file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthKeyLine {
    /// Line as read
    pub source: String,
    pub options: Option<String>,
    pub keytype: Option<String>,
    pub base64: Option<String>,
    pub comment: Option<String>,
}

impl AuthKeyLine {
    /// Parse a line, using `default_options` when it carries none
    ///
    /// Blank and `#` lines keep only their source text.
    pub fn parse(src_line: &str, default_options: Option<&str>) -> Self {
        let line = src_line.trim_end_matches(['\r', '\n']);
        if line.starts_with('#') || line.trim().is_empty() {
            return Self::comment_line(src_line);
        }

        let ent = line.trim();
        let default_options = default_options.filter(|o| !o.is_empty()).map(String::from);
        if split_ws(ent, 4).len() < 4 {
            return Self::from_tokens(src_line, split_ws(ent, 3), default_options);
        }

        let (options, rest) = extract_options(ent);
        let options = options.or(default_options);
        Self::from_tokens(src_line, rest, options)
    }

    fn comment_line(src_line: &str) -> Self {
        Self {
            source: src_line.to_string(),
            ..Default::default()
        }
    }

    fn from_tokens(src_line: &str, toks: Vec<&str>, options: Option<String>) -> Self {
        let owned = |s: &str| Some(s.to_string());
        let (keytype, base64, comment) = match toks.as_slice() {
            [b64] => (None, owned(b64), None),
            [b64, comment] => (None, owned(b64), owned(comment)),
            [keytype, b64, comment] => (owned(keytype), owned(b64), owned(comment)),
            _ => (None, None, None),
        };
        Self {
            source: src_line.to_string(),
            options,
            keytype,
            base64,
            comment,
        }
    }

    /// True when no structured field is present
    pub fn is_empty(&self) -> bool {
        self.base64.is_none() && self.comment.is_none() && self.keytype.is_none() && self.options.is_none()
    }
}

impl fmt::Display for AuthKeyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let toks: Vec<&str> = [&self.options, &self.keytype, &self.base64, &self.comment]
            .into_iter()
            .filter_map(|t| t.as_deref())
            .collect();
        if toks.is_empty() {
            write!(f, "{}", self.source)
        } else {
            write!(f, "{}", toks.join(" "))
        }
    }
}

/// Split on whitespace into at most `n` tokens; the last keeps the remainder
fn split_ws(s: &str, n: usize) -> Vec<&str> {
    let mut toks = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if toks.len() + 1 == n {
            toks.push(rest.trim_end());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                toks.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                toks.push(rest);
                break;
            }
        }
    }
    toks
}

/// Pull the leading options segment off an entry
///
/// The segment ends at the first unquoted space or tab; `\"` does not
/// toggle quoting. Empty comma-separated items are dropped.
fn extract_options(ent: &str) -> (Option<String>, Vec<&str>) {
    let bytes = ent.as_bytes();
    let mut quoted = false;
    let mut i = 0;
    while i < bytes.len() && (quoted || !matches!(bytes[i], b' ' | b'\t')) {
        match bytes[i] {
            b'\\' if bytes.get(i + 1) == Some(&b'"') => i += 1,
            b'"' => quoted = !quoted,
            _ => {}
        }
        i += 1;
    }
    let i = i.min(bytes.len());

    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in ent[..i].chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);

    let items: Vec<&str> = items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    let options = (!items.is_empty()).then(|| items.join(","));
    let rest = ent.get(i + 1..).map(|r| split_ws(r, 3)).unwrap_or_default();
    (options, rest)
}

/// Parse the text of an authorized_keys file
pub fn parse_authorized_keys(content: &str) -> Vec<AuthKeyLine> {
    content.lines().map(|l| AuthKeyLine::parse(l, None)).collect()
}

/// Merge `keys` into `existing`
///
/// An existing entry with the same base64 material is replaced in place;
/// unmatched keys are appended in order. Entries without base64 material
/// never match. The result ends with a newline.
pub fn update_authorized_keys(existing: Vec<AuthKeyLine>, keys: &[AuthKeyLine]) -> String {
    let mut entries = existing;
    let mut matched = vec![false; keys.len()];

    for entry in entries.iter_mut() {
        let Some(b64) = entry.base64.clone() else {
            continue;
        };
        for (i, key) in keys.iter().enumerate() {
            if key.base64.as_deref() == Some(b64.as_str()) {
                *entry = key.clone();
                matched[i] = true;
            }
        }
    }

    entries.extend(
        keys.iter()
            .zip(&matched)
            .filter(|(_, m)| !**m)
            .map(|(k, _)| k.clone()),
    );

    let mut out: Vec<String> = entries.iter().map(ToString::to_string).collect();
    out.push(String::new());
    out.join("\n")
}
