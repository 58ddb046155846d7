//! Retry bookkeeping for failed provisioning attempts.

/// Longest `last_error` kept on a row, in characters.
pub const MAX_ERROR_CHARS: usize = 500;

/// Seconds to wait after the `retry_count`-th failure: `min(2^retry_count, max_secs)`.
#[must_use]
pub fn backoff_secs(retry_count: u32, max_secs: u64) -> u64 {
    2u64.checked_pow(retry_count).unwrap_or(u64::MAX).min(max_secs)
}

/// Truncates an error message to [`MAX_ERROR_CHARS`] characters.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_secs(0, 3600), 1);
        assert_eq!(backoff_secs(1, 3600), 2);
        assert_eq!(backoff_secs(5, 3600), 32);
        assert_eq!(backoff_secs(11, 3600), 2048);
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(backoff_secs(12, 3600), 3600);
        assert_eq!(backoff_secs(64, 3600), 3600);
        assert_eq!(backoff_secs(u32::MAX, 10), 10);
    }

    #[test]
    fn test_truncate_error() {
        assert_eq!(truncate_error("short"), "short");
        let long = "x".repeat(600);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_CHARS);
        // multi-byte characters are never split
        let wide = "é".repeat(600);
        assert_eq!(truncate_error(&wide).chars().count(), MAX_ERROR_CHARS);
    }
}
