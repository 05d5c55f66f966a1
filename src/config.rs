//! Flat `key=value` configuration store, parsed once from the boot loader's
//! command-line byte string. No new grammar: a line per entry, separated by
//! `\n` or `\0`, `key=value` per line, leading/trailing whitespace trimmed.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Once;

struct Entry {
    key: String,
    value: String,
}

static STORE: Once<Vec<Entry>> = Once::new();

/// Parses `cmdline` and installs it as the process-wide config store. Must be
/// called exactly once, by the BSP, before any `read_*` call.
pub fn init(cmdline: &str) {
    STORE.call_once(|| {
        let mut entries = Vec::new();
        for line in cmdline.split(|c| c == '\n' || c == '\0') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.push(Entry {
                    key: key.trim().into(),
                    value: value.trim().into(),
                });
            }
        }
        entries
    });
}

fn lookup(key: &str) -> Option<&'static str> {
    STORE
        .get()
        .and_then(|entries| entries.iter().find(|e| e.key == key))
        .map(|e| e.value.as_str())
}

/// Reads an unsigned integer config value, falling back to `default` if the
/// key is absent or does not parse.
pub fn read_u64(key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
}

/// Reads a string config value, falling back to `default` if the key is
/// absent. The returned value borrows from the store for its process
/// lifetime.
pub fn read_str(key: &str, default: &'static str) -> &'static str {
    lookup(key).unwrap_or(default)
}

/// `npk.pm.temp_mapping_count` — Page-Access Cache slot count.
pub fn pac_slot_count() -> u64 {
    read_u64("npk.pm.temp_mapping_count", 512)
}

/// `npk.vmd.wake_timeout_ms` — page-out daemon wake interval.
pub fn pageout_wake_ms() -> u64 {
    read_u64("npk.vmd.wake_timeout_ms", 500)
}

/// `npk.sched.quantum_ms` — time-share scheduling quantum.
pub fn sched_quantum_ms() -> u64 {
    read_u64("npk.sched.quantum_ms", 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_only(cmdline: &str) -> Vec<Entry> {
        let mut entries = Vec::new();
        for line in cmdline.split(|c| c == '\n' || c == '\0') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.push(Entry {
                    key: key.trim().into(),
                    value: value.trim().into(),
                });
            }
        }
        entries
    }

    #[test]
    fn parses_key_value_pairs() {
        let entries = parse_only("npk.pm.temp_mapping_count=256\nnpk.vmd.wake_timeout_ms=750");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "npk.pm.temp_mapping_count");
        assert_eq!(entries[0].value, "256");
    }

    #[test]
    fn unrecognized_line_is_skipped() {
        let entries = parse_only("not_a_kv_pair\nnpk.pm.temp_mapping_count=1");
        assert_eq!(entries.len(), 1);
    }
}
