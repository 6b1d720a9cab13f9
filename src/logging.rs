//! Structured logging with correlation ids for the controller and worker sides.
//!
//! Provides JSON-formatted logs with pluggable output handlers. A logger
//! without a handler is silent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::protocol::{CallId, ContextId};

/// Log levels for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Standard log events for the worker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    // Lifecycle
    WorkerSpawn,
    WorkerTerminate,
    TerminationDeferred,
    ChannelClosed,

    // Contexts
    ContextCreate,
    ContextDestroy,

    // Requests
    RequestStart,
    RequestEnd,
    RequestError,
    StaleReply,
    InvalidFrame,

    // Outbound queue
    QueueFlush,
    QueueReject,

    // Published state
    StateSubscribe,
    StateUnsubscribe,

    // Delegation
    DelegationStart,
    DelegationEnd,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Structured log entry with all context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub event: String,
    pub level: String,
    pub message: String,
    pub timestamp: f64,

    // Correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,

    // Context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    // Timing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    // Status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    /// Convert to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Type alias for log handler function.
pub type LogHandler = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Structured logger with pluggable handlers.
///
/// # Example
///
/// ```rust,no_run
/// use workerlink::{StructuredLogger, LogEvent, LogLevel, LogOptions};
/// use std::sync::Arc;
///
/// let logger = StructuredLogger::new(
///     Some(Arc::new(|entry| {
///         println!("{}", entry.to_json());
///     })),
///     LogLevel::Info,
///     Some("controller".to_string()),
/// );
///
/// logger.info(LogEvent::WorkerSpawn, "Worker spawned", LogOptions::default());
/// ```
#[derive(Clone)]
pub struct StructuredLogger {
    handler: Option<LogHandler>,
    level: LogLevel,
    worker_id: Option<String>,
    worker_path: Option<String>,
}

impl StructuredLogger {
    pub fn new(handler: Option<LogHandler>, level: LogLevel, worker_id: Option<String>) -> Self {
        Self {
            handler,
            level,
            worker_id,
            worker_path: None,
        }
    }

    /// Logger that drops every entry.
    pub fn silent() -> Self {
        Self::new(None, LogLevel::Info, None)
    }

    pub fn set_handler(&mut self, handler: LogHandler) {
        self.handler = Some(handler);
    }

    /// Copy of this logger tagged with a worker instance and path.
    pub fn for_worker(&self, worker_id: &str, worker_path: &str) -> Self {
        Self {
            handler: self.handler.clone(),
            level: self.level,
            worker_id: Some(worker_id.to_string()),
            worker_path: Some(worker_path.to_string()),
        }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level as u8 >= self.level as u8
    }

    /// Log an event with structured data.
    pub fn log(&self, event: LogEvent, message: &str, level: LogLevel, options: LogOptions) {
        let handler = match self.handler {
            Some(ref handler) if self.should_log(level) => handler,
            _ => return,
        };

        let entry = LogEntry {
            event: event.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            timestamp: current_timestamp(),
            call_id: options.call_id,
            context_id: options.context_id,
            worker_id: self.worker_id.clone(),
            worker_path: self.worker_path.clone(),
            activity: options.activity,
            method: options.method,
            duration_ms: options.duration_ms,
            success: options.success,
            error: options.error,
            error_type: options.error_type,
            metadata: options.metadata,
        };

        handler(&entry);
    }

    pub fn debug(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Debug, options);
    }

    pub fn info(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Info, options);
    }

    pub fn warn(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Warn, options);
    }

    pub fn error(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Error, options);
    }

    // Convenience methods for common events

    pub fn request_start(&self, call_id: CallId, activity: &str, context_id: Option<ContextId>) {
        self.debug(
            LogEvent::RequestStart,
            &format!("Sending {}", activity),
            LogOptions {
                call_id: Some(call_id),
                context_id,
                activity: Some(activity.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn request_end(&self, call_id: CallId, duration_ms: f64, error: Option<&crate::WorkerError>) {
        let success = error.is_none();
        let (event, level) = if success {
            (LogEvent::RequestEnd, LogLevel::Debug)
        } else {
            (LogEvent::RequestError, LogLevel::Warn)
        };

        self.log(
            event,
            &format!("Call {} {}", call_id, if success { "completed" } else { "failed" }),
            level,
            LogOptions {
                call_id: Some(call_id),
                duration_ms: Some(duration_ms),
                success: Some(success),
                error: error.map(|e| e.to_string()),
                error_type: error.map(|e| e.kind().to_string()),
                ..Default::default()
            },
        );
    }

    pub fn stale_reply(&self, call_id: CallId) {
        self.debug(
            LogEvent::StaleReply,
            &format!("Ignoring reply for unknown call {}", call_id),
            LogOptions {
                call_id: Some(call_id),
                ..Default::default()
            },
        );
    }

    pub fn context_created(&self, context_id: ContextId) {
        self.info(
            LogEvent::ContextCreate,
            &format!("Context {} created", context_id),
            LogOptions {
                context_id: Some(context_id),
                ..Default::default()
            },
        );
    }

    pub fn context_destroyed(&self, context_id: ContextId, remaining: usize) {
        self.info(
            LogEvent::ContextDestroy,
            &format!("Context {} destroyed ({} remaining)", context_id, remaining),
            LogOptions {
                context_id: Some(context_id),
                metadata: Some(serde_json::json!({ "remaining": remaining })),
                ..Default::default()
            },
        );
    }

    pub fn worker_spawned(&self) {
        self.info(LogEvent::WorkerSpawn, "Worker spawned", LogOptions::default());
    }

    pub fn worker_terminated(&self) {
        self.info(LogEvent::WorkerTerminate, "Worker terminated", LogOptions::default());
    }

    pub fn termination_deferred(&self, reason: &str) {
        self.info(
            LogEvent::TerminationDeferred,
            &format!("Termination skipped: {}", reason),
            LogOptions::default(),
        );
    }

    pub fn channel_closed(&self, rejected: usize) {
        self.warn(
            LogEvent::ChannelClosed,
            &format!("Channel closed, rejecting {} pending calls", rejected),
            LogOptions {
                metadata: Some(serde_json::json!({ "rejected": rejected })),
                ..Default::default()
            },
        );
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredLogger")
            .field("level", &self.level)
            .field("worker_id", &self.worker_id)
            .field("worker_path", &self.worker_path)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Options for log entries.
#[derive(Default)]
pub struct LogOptions {
    pub call_id: Option<CallId>,
    pub context_id: Option<ContextId>,
    pub activity: Option<String>,
    pub method: Option<String>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Default handler that prints JSON to stdout.
pub fn default_json_handler(entry: &LogEntry) {
    println!("{}", entry.to_json());
}

/// Default handler that prints human-readable output.
pub fn default_pretty_handler(entry: &LogEntry) {
    let seconds = entry.timestamp as u64;
    let time_str = format!(
        "{:02}:{:02}:{:02}",
        (seconds / 3600) % 24,
        (seconds / 60) % 60,
        seconds % 60
    );
    let level = format!("{:<5}", entry.level.to_uppercase());
    let mut parts = vec![format!("[{}] [{}]", time_str, level), entry.event.clone(), entry.message.clone()];

    if let Some(ref path) = entry.worker_path {
        parts.push(format!("worker={}", path));
    }
    if let Some(call_id) = entry.call_id {
        parts.push(format!("call={}", call_id));
    }
    if let Some(context_id) = entry.context_id {
        parts.push(format!("ctx={}", context_id));
    }
    if let Some(ref method) = entry.method {
        parts.push(format!("fn={}", method));
    }
    if let Some(duration) = entry.duration_ms {
        parts.push(format!("{:.1}ms", duration));
    }
    if let Some(ref err) = entry.error {
        parts.push(format!("error={}", err));
    }

    println!("{}", parts.join(" "));
}

fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_logger;
    use crate::WorkerError;

    #[test]
    fn test_log_event_display() {
        assert_eq!(LogEvent::WorkerSpawn.to_string(), "worker_spawn");
        assert_eq!(LogEvent::TerminationDeferred.to_string(), "termination_deferred");
        assert_eq!(LogEvent::StaleReply.to_string(), "stale_reply");
    }

    #[test]
    fn test_silent_logger_does_nothing() {
        let logger = StructuredLogger::silent();
        logger.error(LogEvent::ChannelClosed, "ignored", LogOptions::default());
    }

    #[test]
    fn test_level_filtering() {
        let (logger, logs) = create_test_logger();
        let logger = StructuredLogger { level: LogLevel::Warn, ..logger };

        logger.debug(LogEvent::RequestStart, "debug", LogOptions::default());
        logger.info(LogEvent::ContextCreate, "info", LogOptions::default());
        logger.warn(LogEvent::ChannelClosed, "warn", LogOptions::default());
        logger.error(LogEvent::RequestError, "error", LogOptions::default());

        assert_eq!(logs.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_for_worker_tags_entries() {
        let (logger, logs) = create_test_logger();
        let tagged = logger.for_worker("instance-1", "workers/math");
        tagged.worker_spawned();

        let captured = logs.lock().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&captured[0]).unwrap();
        assert_eq!(parsed["event"], "worker_spawn");
        assert_eq!(parsed["worker_id"], "instance-1");
        assert_eq!(parsed["worker_path"], "workers/math");
    }

    #[test]
    fn test_request_end_failure_carries_error_type() {
        let (logger, logs) = create_test_logger();
        logger.request_end(4, 1.5, Some(&WorkerError::ChannelClosed));

        let captured = logs.lock().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&captured[0]).unwrap();
        assert_eq!(parsed["event"], "request_error");
        assert_eq!(parsed["level"], "warn");
        assert_eq!(parsed["call_id"], 4);
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error_type"], "ChannelClosed");
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let entry = LogEntry {
            event: "context_create".to_string(),
            level: "info".to_string(),
            message: "Context 1 created".to_string(),
            context_id: Some(1),
            ..Default::default()
        };
        let json = entry.to_json();
        assert!(json.contains("\"context_id\":1"));
        assert!(!json.contains("call_id"));
    }

    #[test]
    fn test_default_pretty_handler() {
        let entry = LogEntry {
            event: "request_end".to_string(),
            level: "debug".to_string(),
            message: "Call 1 completed".to_string(),
            timestamp: 1234567890.0,
            call_id: Some(1),
            duration_ms: Some(2.5),
            ..Default::default()
        };
        default_pretty_handler(&entry);
        default_json_handler(&entry);
    }
}
