//! MIME message parsing for user-data
//!
//! Parses MIME messages as used for combining multiple user-data parts
//! (scripts, configs, etc.). Nested multipart containers are flattened into
//! one list of leaf parts in document order.

use super::types;
use crate::CloudInitError;
use std::collections::HashMap;
use tracing::debug;

/// Nesting limit for multipart containers
const MAX_NESTING: usize = 10;

/// A single leaf part of a MIME message
#[derive(Debug, Clone)]
pub struct MimePart {
    /// Normalized media type (`text/x-shellscript`)
    pub mime_type: String,
    /// Optional filename from Content-Disposition
    pub filename: Option<String>,
    /// Body after transfer-encoding is undone
    pub payload: Vec<u8>,
    /// Headers, keyed by lowercased name
    pub headers: HashMap<String, String>,
}

/// Whether raw user-data looks like a MIME message
///
/// Only the first 4096 bytes are inspected.
pub fn is_mime_message(data: &[u8]) -> bool {
    let head = &data[..data.len().min(4096)];
    String::from_utf8_lossy(head)
        .to_lowercase()
        .contains("mime-version:")
}

/// Parse a MIME message into its leaf parts
pub fn parse_message(data: &str) -> Result<Vec<MimePart>, CloudInitError> {
    let mut parts = Vec::new();
    collect_parts(data, 0, &mut parts)?;
    debug!("Parsed {} MIME parts", parts.len());
    Ok(parts)
}

fn collect_parts(data: &str, depth: usize, out: &mut Vec<MimePart>) -> Result<(), CloudInitError> {
    if depth > MAX_NESTING {
        return Err(CloudInitError::InvalidData(
            "MIME multipart nesting too deep".to_string(),
        ));
    }

    let (headers, body) = split_headers(data);
    let raw_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| types::PLAIN.to_string());
    let mime_type = types::normalize(&raw_type);

    if !mime_type.starts_with("multipart/") {
        let payload = decode_body(&headers, body)?;
        let filename = headers
            .get("content-disposition")
            .and_then(|cd| extract_param(cd, "filename"));
        out.push(MimePart {
            mime_type,
            filename,
            payload,
            headers,
        });
        return Ok(());
    }

    let boundary = extract_param(&raw_type, "boundary").ok_or_else(|| {
        CloudInitError::InvalidData(format!("No MIME boundary in '{}'", raw_type))
    })?;
    debug!("Found MIME boundary: {}", boundary);

    let delimiter = format!("--{}", boundary);
    for (i, section) in body.split(delimiter.as_str()).enumerate() {
        // Skip preamble (first section) and epilogue (after --)
        if i == 0 || section.starts_with("--") || section.trim().is_empty() {
            continue;
        }
        let section = section
            .strip_prefix("\r\n")
            .or_else(|| section.strip_prefix('\n'))
            .unwrap_or(section);
        collect_parts(strip_trailing_newline(section), depth + 1, out)?;
    }

    Ok(())
}

/// The line break before a delimiter belongs to the delimiter
fn strip_trailing_newline(section: &str) -> &str {
    section
        .strip_suffix("\r\n")
        .or_else(|| section.strip_suffix('\n'))
        .unwrap_or(section)
}

/// Split a message into (headers, body) at the first empty line
fn split_headers(data: &str) -> (HashMap<String, String>, &str) {
    let (headers_str, body) = if let Some(idx) = data.find("\r\n\r\n") {
        (&data[..idx], &data[idx + 4..])
    } else if let Some(idx) = data.find("\n\n") {
        (&data[..idx], &data[idx + 2..])
    } else {
        (data, "")
    };

    // A body without headers: the first line is not a header line
    let looks_like_headers = headers_str
        .lines()
        .next()
        .is_some_and(|l| l.split_once(':').is_some_and(|(n, _)| !n.is_empty() && !n.contains(' ')));
    if !looks_like_headers {
        return (HashMap::new(), data);
    }

    let mut headers = HashMap::new();
    let mut current_header: Option<(String, String)> = None;

    for line in headers_str.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of previous header
            if let Some((_, ref mut value)) = current_header {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            if let Some((n, v)) = current_header.take() {
                headers.insert(n.to_lowercase(), v);
            }
            current_header = Some((name.trim().to_string(), value.trim().to_string()));
        }
    }

    if let Some((n, v)) = current_header {
        headers.insert(n.to_lowercase(), v);
    }

    (headers, body)
}

/// Undo Content-Transfer-Encoding
fn decode_body(headers: &HashMap<String, String>, body: &str) -> Result<Vec<u8>, CloudInitError> {
    let encoding = headers
        .get("content-transfer-encoding")
        .map(|s| s.trim().to_lowercase());

    match encoding.as_deref() {
        Some("base64") => decode_base64(body),
        Some("quoted-printable") => Ok(decode_quoted_printable(body)),
        _ => Ok(body.as_bytes().to_vec()),
    }
}

/// Extract a `name=value` or `name="value"` header parameter
#[allow(clippy::manual_strip)]
fn extract_param(header: &str, name: &str) -> Option<String> {
    // ASCII folding keeps byte offsets valid for slicing `header`
    let lower = header.to_ascii_lowercase();
    let key = format!("{}=", name.to_ascii_lowercase());
    let idx = lower
        .match_indices(&key)
        .find(|(i, _)| {
            *i == 0 || matches!(lower.as_bytes()[i - 1], b';' | b' ' | b'\t')
        })?
        .0;
    let after = &header[idx + key.len()..];

    let value = if after.starts_with('"') {
        let end = after[1..].find('"')?;
        &after[1..=end]
    } else {
        // Unquoted value (ends at ; or whitespace or end of line)
        let end = after
            .find(|c: char| c == ';' || c.is_whitespace())
            .unwrap_or(after.len());
        &after[..end]
    };

    Some(value.to_string()).filter(|v| !v.is_empty())
}

/// Decode base64 content
fn decode_base64(data: &str) -> Result<Vec<u8>, CloudInitError> {
    use base64::Engine;

    let clean: String = data.chars().filter(|c| !c.is_whitespace()).collect();

    base64::engine::general_purpose::STANDARD
        .decode(&clean)
        .map_err(|e| CloudInitError::InvalidData(format!("Base64 decode error: {}", e)))
}

/// Decode quoted-printable content
fn decode_quoted_printable(data: &str) -> Vec<u8> {
    let bytes = data.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            result.push(bytes[i]);
            i += 1;
            continue;
        }

        // Soft line break (=\r\n or =\n)
        if bytes[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if bytes[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }

        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match hex {
            Some(byte) => {
                result.push(byte);
                i += 3;
            }
            None => {
                // Invalid encoding, pass through
                result.push(b'=');
                i += 1;
            }
        }
    }

    result
}

/// Create a MIME multipart message from (content-type, filename, body) parts
pub fn create_multipart(parts: &[(&str, Option<&str>, &str)], boundary: &str) -> String {
    let mut output = String::new();

    output.push_str("MIME-Version: 1.0\r\n");
    output.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n",
        boundary
    ));
    output.push_str("\r\n");

    for (mime_type, filename, body) in parts {
        output.push_str(&format!("--{}\r\n", boundary));
        output.push_str(&format!("Content-Type: {}\r\n", mime_type));

        if let Some(filename) = filename {
            output.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n",
                filename
            ));
        }

        output.push_str("\r\n");
        output.push_str(body);
        output.push_str("\r\n");
    }

    output.push_str(&format!("--{}--\r\n", boundary));

    output
}
