use crate::protocol::{LogEntry, LogLevel};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Entries kept when `SOURCELENS_LOG_BUFFER_CAPACITY` is unset
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Messages longer than this are cut before they reach the buffer
pub const MAX_LOG_MESSAGE_SIZE: usize = 4096;

/// Ring buffer of recent log entries, served by the `logs` method.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    sequence_counter: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let capacity = std::env::var("SOURCELENS_LOG_BUFFER_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LOG_CAPACITY);
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sequence_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A poisoned lock only means a writer panicked mid-push; the deque is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry, assigning its sequence number and dropping the oldest on overflow.
    pub fn push(&self, mut entry: LogEntry) {
        entry.sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The most recent `count` entries, oldest first.
    pub fn get_last(&self, count: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(count);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn get_all(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cut `message` to [`MAX_LOG_MESSAGE_SIZE`] bytes on a char boundary.
pub fn truncate_message(message: String) -> String {
    if message.len() <= MAX_LOG_MESSAGE_SIZE {
        return message;
    }
    let mut end = MAX_LOG_MESSAGE_SIZE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}... [TRUNCATED - original size: {} bytes]",
        &message[..end],
        message.len()
    )
}

/// Tracing layer that mirrors every event into a [`LogBuffer`].
pub struct MemoryLogLayer {
    buffer: LogBuffer,
}

impl MemoryLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn convert_level(level: &tracing::Level) -> LogLevel {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }

    fn format_message(event: &Event<'_>) -> String {
        struct MessageVisitor {
            message: String,
            fields: Vec<String>,
        }

        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{value:?}");
                } else {
                    self.fields.push(format!("{}={:?}", field.name(), value));
                }
            }

            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                if field.name() == "message" {
                    self.message = value.to_string();
                } else {
                    self.fields.push(format!("{}={}", field.name(), value));
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
            fields: Vec::new(),
        };
        event.record(&mut visitor);

        let mut message = if visitor.message.is_empty() {
            event.metadata().target().to_string()
        } else {
            visitor.message
        };
        if !visitor.fields.is_empty() {
            message.push(' ');
            message.push_str(&visitor.fields.join(" "));
        }
        truncate_message(message)
    }
}

impl<S> Layer<S> for MemoryLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        self.buffer.push(LogEntry {
            sequence: 0,
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
            level: Self::convert_level(metadata.level()),
            target: metadata.target().to_string(),
            message: Self::format_message(event),
            file: metadata.file().map(str::to_string),
            line: metadata.line(),
        });
    }
}
