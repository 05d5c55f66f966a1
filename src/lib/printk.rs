//! Leveled log pipeline: per-CPU ring buffers feeding a shared MPSC queue,
//! drained to pluggable sinks (UART by default). Matches the inter-CPU
//! mailbox shape in `smp::mod` — one ring per logical CPU, an `IplLock`
//! ceiling of `Dpc` so a log call from an ISR doesn't deadlock against
//! itself.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::ipl::{Ipl, IplLock};
use crate::smp::MAX_CPUS;

use super::ringbuf::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

const MSG_CAP: usize = 128;
const RING_CAP: usize = 64;
const DRAIN_BATCH: usize = 64;

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub timestamp: u64,
    pub cpu_id: u32,
    pub level: LogLevel,
    pub text: [u8; MSG_CAP],
    pub len: u8,
}

impl LogEntry {
    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.text[..self.len as usize]).unwrap_or("<invalid utf8>")
    }
}

/// `Write(span)` / `Reset()` / `BeginPanic()` sink contract from §4.10.
pub trait LogSink: Sync {
    fn write(&self, entries: &[LogEntry]);
    fn reset(&self) {}
    fn begin_panic(&self) {}
}

struct UartSink;

impl LogSink for UartSink {
    fn write(&self, entries: &[LogEntry]) {
        let mut writer = UartWriter;
        for entry in entries {
            let _ = write!(writer, "[{:>5}] {}\n", entry.level.as_str(), entry.message());
        }
    }
}

struct UartWriter;

impl Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        unsafe {
            crate::uart_print(s.as_bytes());
        }
        Ok(())
    }
}

const MAX_SINKS: usize = 4;

struct SinkRegistry {
    sinks: spin::Mutex<Vec<&'static dyn LogSink>>,
}

static SINKS: SinkRegistry = SinkRegistry { sinks: spin::Mutex::new(Vec::new()) };
static UART_SINK: UartSink = UartSink;

/// Registers an additional sink. The UART sink is always present and needs
/// no registration. No-op past `MAX_SINKS` registered sinks.
pub fn add_log_sink(sink: &'static dyn LogSink) {
    let mut sinks = SINKS.sinks.lock();
    if sinks.len() < MAX_SINKS {
        sinks.push(sink);
    }
}

type PerCpuRing = IplLock<RingBuffer<LogEntry, RING_CAP>>;

static RINGS: [PerCpuRing; MAX_CPUS] = {
    const INIT: PerCpuRing = IplLock::new(Ipl::Dpc, RingBuffer::new());
    [INIT; MAX_CPUS]
};

static QUEUE: IplLock<VecDeque<LogEntry>> = IplLock::new(Ipl::Dpc, VecDeque::new());
static DROPPED: AtomicUsize = AtomicUsize::new(0);

/// Formats `args` and routes it through the pipeline described in §4.10:
/// local ring, then the shared MPSC queue, then a best-effort sink drain.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut text = [0u8; MSG_CAP];
    let formatted = alloc::format!("{}", args);
    let len = core::cmp::min(formatted.len(), MSG_CAP);
    text[..len].copy_from_slice(&formatted.as_bytes()[..len]);

    let entry = LogEntry {
        timestamp: crate::hal::hw_read_timestamp(),
        cpu_id: crate::hal::my_core_id(),
        level,
        text,
        len: len as u8,
    };

    let cpu_id = entry.cpu_id as usize;
    {
        let mut ring = RINGS[cpu_id].lock();
        if !ring.push(entry) {
            DROPPED.fetch_add(1, Ordering::Relaxed);
        }
    }

    QUEUE.lock().push_back(entry);
    try_write_logs();
}

/// Drains up to `DRAIN_BATCH` queued entries to every registered sink,
/// skipping entirely if the sinks registry is already held elsewhere.
fn try_write_logs() {
    let Some(sinks) = SINKS.sinks.try_lock() else { return };
    let mut batch = Vec::new();
    {
        let mut queue = QUEUE.lock();
        for _ in 0..DRAIN_BATCH {
            match queue.pop_front() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
    }
    if batch.is_empty() {
        return;
    }
    UART_SINK.write(&batch);
    for sink in sinks.iter() {
        sink.write(&batch);
    }
}

/// Panic-path drain (§7): bounded try-locks only, never blocks, prints
/// whatever was captured with interrupts already disabled by the caller.
pub fn drain_for_panic(max: usize) -> Vec<LogEntry> {
    let mut out = Vec::new();
    if let Some(mut queue) = QUEUE.try_lock() {
        for _ in 0..max {
            match queue.pop_front() {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
    }
    out
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_message_roundtrips_ascii() {
        let mut text = [0u8; MSG_CAP];
        text[..5].copy_from_slice(b"hello");
        let entry = LogEntry { timestamp: 0, cpu_id: 0, level: LogLevel::Info, text, len: 5 };
        assert_eq!(entry.message(), "hello");
    }
}
