use std::sync::{Mutex, MutexGuard, PoisonError};

/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let encoded = hex::encode_upper(bytes);
    let mut rendered = String::with_capacity(bytes.len().saturating_mul(3));
    for (index, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.extend(pair.iter().map(|byte| char::from(*byte)));
    }
    rendered
}

/// Renders adapter text with control characters made visible.
pub(crate) fn format_escaped(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}

/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
