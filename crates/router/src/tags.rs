//! Request tags attached to every resolved call.

use vkgate_types::RouteKind;

/// Longest custom tag accepted, in bytes.
pub const MAX_TAG_LEN: usize = 64;

/// Prefixes owned by the router; callers cannot forge them.
const RESERVED_PREFIXES: [&str; 4] = ["scope:", "product:", "user:", "routing:"];

/// Whether a caller-supplied tag may be forwarded.
#[must_use]
pub fn is_valid_custom_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'.' | b'/' | b'-'))
        && !RESERVED_PREFIXES.iter().any(|p| tag.starts_with(p))
}

/// Builds the tag list: the four routing tags, then every valid custom tag
/// that does not contain one of `secrets`.
#[must_use]
pub fn build_tags(
    scope: &str,
    product: &str,
    caller_id: &str,
    route: RouteKind,
    custom: &[String],
    secrets: &[&str],
) -> Vec<String> {
    let mut tags = vec![
        format!("scope:{scope}"),
        format!("product:{product}"),
        format!("user:{caller_id}"),
        format!("routing:{route}"),
    ];
    for tag in custom {
        if !is_valid_custom_tag(tag) {
            tracing::debug!(tag_len = tag.len(), "dropping malformed tag");
            continue;
        }
        if secrets.iter().any(|s| !s.is_empty() && tag.contains(s)) {
            tracing::warn!("dropping tag that contains secret material");
            continue;
        }
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}
