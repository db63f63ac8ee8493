//! Utility functions for shareplane

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for store keys and path components
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a name for use as a single store-key or path component
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a share name: alphanumeric start, then alphanumerics, `_` or `-`,
/// at least two characters.
pub fn validate_share_name(name: &str) -> crate::Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest: Vec<char> = chars.collect();

    if !valid_start
        || rest.is_empty()
        || !rest
            .iter()
            .all(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
    {
        return Err(crate::Error::Validation(format!(
            "invalid share name: {:?}",
            name
        )));
    }

    if name.len() > 255 {
        return Err(crate::Error::Validation(
            "share name too long (max 255 bytes)".into(),
        ));
    }

    Ok(())
}

/// Validate a caller-supplied mount id
pub fn validate_mount_id(mount_id: &str) -> crate::Result<()> {
    if mount_id.is_empty() {
        return Err(crate::Error::Validation("mount id cannot be empty".into()));
    }

    if mount_id.chars().any(|c| c.is_control()) || mount_id == "." || mount_id == ".." {
        return Err(crate::Error::Validation(format!(
            "invalid mount id: {:?}",
            mount_id
        )));
    }

    Ok(())
}
