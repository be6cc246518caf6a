//! User-data content types
//!
//! Content types are plain MIME strings so that handlers registered at
//! runtime can claim types this crate has never heard of.

pub const CLOUD_CONFIG: &str = "text/cloud-config";
pub const CLOUD_CONFIG_ARCHIVE: &str = "text/cloud-config-archive";
pub const SHELLSCRIPT: &str = "text/x-shellscript";
pub const BOOTHOOK: &str = "text/cloud-boothook";
pub const INCLUDE_URL: &str = "text/x-include-url";
pub const INCLUDE_ONCE_URL: &str = "text/x-include-once-url";
pub const UPSTART_JOB: &str = "text/upstart-job";
pub const PLAIN: &str = "text/plain";

/// Reserved type whose payload registers a new handler mid-walk
pub const PART_HANDLER: &str = "text/part-handler";

/// Type given to payloads that are not MIME messages
pub const NOT_MULTIPART: &str = "text/x-not-multipart";

/// Lifecycle marker passed to handlers before the walk
pub const CONTENT_START: &str = "__begin__";

/// Lifecycle marker passed to handlers after the walk
pub const CONTENT_END: &str = "__end__";

/// Types whose real type is sniffed from the payload's first bytes
pub const RETYPE_TYPES: [&str; 2] = [PLAIN, NOT_MULTIPART];

/// Leading markers and the type they select, longest marker first
const STARTS_WITH_TYPES: [(&str, &str); 8] = [
    ("#cloud-config-archive", CLOUD_CONFIG_ARCHIVE),
    ("#cloud-boothook", BOOTHOOK),
    ("#include-once", INCLUDE_ONCE_URL),
    ("#cloud-config", CLOUD_CONFIG),
    ("#part-handler", PART_HANDLER),
    ("#upstart-job", UPSTART_JOB),
    ("#include", INCLUDE_URL),
    ("#!", SHELLSCRIPT),
];

/// Guess a content type from the leading marker of a payload
///
/// Leading whitespace is ignored and the match is case-insensitive.
pub fn type_from_starts_with(payload: &[u8]) -> Option<&'static str> {
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let head = &payload[start..];

    STARTS_WITH_TYPES
        .iter()
        .find(|(marker, _)| {
            head.len() >= marker.len() && head[..marker.len()].eq_ignore_ascii_case(marker.as_bytes())
        })
        .map(|(_, ctype)| *ctype)
}

/// Lowercased media type without parameters (`Text/Plain; charset=x` -> `text/plain`)
pub fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_lowercase()
}

/// Whether a type should be re-detected from its payload
pub fn needs_retype(content_type: &str) -> bool {
    RETYPE_TYPES.contains(&content_type)
}
