use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Display names are announced to the whole mesh. Strip control characters
/// and cap the length before anything leaves the node.
pub(crate) fn normalize_display_name(value: &str) -> String {
    const MAX_DISPLAY_NAME_CHARS: usize = 64;
    value
        .trim()
        .chars()
        .filter(|ch| !ch.is_control())
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect()
}
