use std::io;

use serde::Serialize;
use serde_json::Value;

/// Appended to every value cut by [`SizePolicy::truncate_field`].
pub const TRUNCATION_MARKER: &str = "…[truncated]";

pub const DEFAULT_MAX_RESULT_SIZE: u64 = 200;
pub const DEFAULT_RESULT_SIZE: u64 = 10;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_FIELD_CHARS: usize = 1000;
pub const DEFAULT_MAX_LIST_ITEMS: usize = 100;

// An empty shaped envelope plus the transport reserve must always fit inside the budget.
const MIN_RESPONSE_BYTES: usize = 4096;
// Kept free for the JSON-RPC envelope and summary text around an embedded payload.
const TRANSPORT_RESERVE_BYTES: usize = 2048;
const MIN_FIELD_CHARS: usize = 16;

struct ByteCount(usize);

impl io::Write for ByteCount {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compact JSON length without allocating the serialized form.
pub fn json_len<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut counter = ByteCount(0);
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => usize::MAX,
    }
}

struct EscapedCount(usize);

impl io::Write for EscapedCount {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += escaped_len(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Bytes `raw` occupies once written inside a JSON string literal.
pub fn escaped_len(raw: &[u8]) -> usize {
    raw.iter()
        .map(|byte| match byte {
            b'"' | b'\\' | b'\n' | b'\r' | b'\t' | 0x08 | 0x0c => 2,
            0x00..=0x1f => 6,
            _ => 1,
        })
        .sum()
}

/// Length of the compact encoding once it is itself embedded as a JSON string, the way tool
/// payloads travel inside MCP text content. The surrounding quotes are not counted.
pub fn embedded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut counter = EscapedCount(0);
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => usize::MAX,
    }
}

/// Numeric limits applied to every request. Built once at startup and passed by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePolicy {
    max_result_size: u64,
    default_size: u64,
    max_response_bytes: usize,
    max_field_chars: usize,
    max_list_items: usize,
}

impl Default for SizePolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RESULT_SIZE,
            DEFAULT_RESULT_SIZE,
            DEFAULT_MAX_RESPONSE_BYTES,
            DEFAULT_MAX_FIELD_CHARS,
            DEFAULT_MAX_LIST_ITEMS,
        )
    }
}

impl SizePolicy {
    pub fn new(
        max_result_size: u64,
        default_size: u64,
        max_response_bytes: usize,
        max_field_chars: usize,
        max_list_items: usize,
    ) -> Self {
        let max_result_size = max_result_size.max(1);
        Self {
            max_result_size,
            default_size: default_size.min(max_result_size),
            max_response_bytes: max_response_bytes.max(MIN_RESPONSE_BYTES),
            max_field_chars: max_field_chars.max(MIN_FIELD_CHARS),
            max_list_items: max_list_items.max(1),
        }
    }

    pub fn max_result_size(&self) -> u64 {
        self.max_result_size
    }

    pub fn default_size(&self) -> u64 {
        self.default_size
    }

    pub fn max_response_bytes(&self) -> usize {
        self.max_response_bytes
    }

    /// What a shaped payload may occupy, measured with [`embedded_len`].
    pub fn payload_budget(&self) -> usize {
        self.max_response_bytes - TRANSPORT_RESERVE_BYTES
    }

    pub fn max_field_chars(&self) -> usize {
        self.max_field_chars
    }

    pub fn max_list_items(&self) -> usize {
        self.max_list_items
    }

    pub fn clamp_size(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_size)
            .min(self.max_result_size)
    }

    pub fn is_oversized_field(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => s.chars().count() > self.max_field_chars,
            other => json_len(other) > self.max_field_chars,
        }
    }

    /// Returns the cut value, or `None` when the input is within the limit or was already
    /// cut under this policy.
    pub fn truncate_field(&self, value: &str) -> Option<String> {
        if self.is_truncated_field(value) {
            return None;
        }

        let cut = match value.char_indices().nth(self.max_field_chars) {
            Some((byte_idx, _)) => byte_idx,
            None => return None,
        };

        let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
        out.push_str(&value[..cut]);
        out.push_str(TRUNCATION_MARKER);
        Some(out)
    }

    pub fn is_truncated_field(&self, value: &str) -> bool {
        value
            .strip_suffix(TRUNCATION_MARKER)
            .map(|head| head.chars().count() == self.max_field_chars)
            .unwrap_or(false)
    }

    /// Truncates every string reachable from `value`. Returns how many were cut.
    pub fn truncate_strings(&self, value: &mut Value) -> usize {
        // A container whose whole encoding fits cannot hold an oversized string.
        if !value.is_string() && !self.is_oversized_field(value) {
            return 0;
        }

        match value {
            Value::String(s) => match self.truncate_field(s) {
                Some(cut) => {
                    *s = cut;
                    1
                }
                None => 0,
            },
            Value::Array(items) => items.iter_mut().map(|v| self.truncate_strings(v)).sum(),
            Value::Object(map) => map.values_mut().map(|v| self.truncate_strings(v)).sum(),
            _ => 0,
        }
    }
}
