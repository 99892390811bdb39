//! Log filter selection, the rolling file sink, secret redaction and the
//! crash-artifact panic hook.
//!
//! Subscriber assembly lives in the binary; this module only computes the
//! pieces so they can be tested without a global subscriber.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt, fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use chrono::{DateTime, Utc};
use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,reqwest=warn,tower_http=info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "sketchsplit";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

static HOOK_INSTALL: Mutex<()> = Mutex::new(());
static HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static HOOK_BUSY: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// `selected` is what the user asked for; `effective` is what the
/// subscriber gets (noise directives first when the choice was implicit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub selected: String,
    pub effective: String,
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::ConsoleOnly {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookStatus {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Disabled(String),
}

pub fn select_filters(options: &LoggingOptions) -> LogFilters {
    let explicit = options.cli_log_filter.is_some() || options.verbose > 0;
    let selected = match (&options.cli_log_filter, options.verbose) {
        (Some(filter), _) => filter.clone(),
        (None, v) if v >= 2 => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, _) => options
            .rust_log_env
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| options.default_log_filter.clone()),
    };

    let noise = options.noise_filter.trim();
    let effective = if explicit || noise.is_empty() {
        selected.clone()
    } else {
        format!("{noise},{selected}")
    };
    LogFilters {
        selected,
        effective,
    }
}

/// Daily rolling appender under `<data_dir>/logs`; any failure degrades to
/// console-only logging with the reason attached.
pub fn open_file_sink(options: &LoggingOptions) -> FileSink {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::ConsoleOnly {
            attempted_log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(err) = fs::create_dir_all(&log_dir) {
        return FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {err}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);
    match built {
        Ok(appender) => FileSink::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(err) => FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {err}"),
        },
    }
}

/// Wraps a `MakeWriter` so every line is redacted before it reaches `inner`.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers until a newline so a secret split across writes is still caught.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.line.drain(..upto).collect();
        let redacted = redact_sensitive_text(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(newline) = self.line.iter().position(|b| *b == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit(self.line.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Masks URL userinfo and the values of secret-looking `key=value` /
/// `key: value` pairs, including `Authorization: Bearer <token>`.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_assignments(&redact_userinfo(input))
}

fn redact_userinfo(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(scheme_end) = rest.find("://") {
        let authority_start = scheme_end + 3;
        let authority_len = rest[authority_start..]
            .find(|c: char| c.is_whitespace() || "/?#\"'<>".contains(c))
            .unwrap_or(rest.len() - authority_start);
        let authority = &rest[authority_start..authority_start + authority_len];

        out.push_str(&rest[..authority_start]);
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                out.push_str(REDACTION_PLACEHOLDER);
                out.push_str(&authority[at..]);
            }
            _ => out.push_str(authority),
        }
        rest = &rest[authority_start + authority_len..];
    }

    out.push_str(rest);
    out
}

fn redact_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if !matches!(bytes[i], b'=' | b':') {
            i += 1;
            continue;
        }
        let key_start = input[..i]
            .char_indices()
            .rev()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
            .map_or(0, |(idx, c)| idx + c.len_utf8());
        if key_start == i || !is_sensitive_key(&input[key_start..i].to_ascii_lowercase()) {
            i += 1;
            continue;
        }

        match secret_span(input, i + 1) {
            Some((start, end)) => {
                out.push_str(&input[copied..start]);
                out.push_str(REDACTION_PLACEHOLDER);
                copied = end;
                i = end;
            }
            None => i += 1,
        }
    }

    out.push_str(&input[copied..]);
    out
}

/// Byte range of the secret value that starts at or after `from`.
fn secret_span(input: &str, from: usize) -> Option<(usize, usize)> {
    let mut start = from + (input[from..].len() - input[from..].trim_start().len());
    if input[start..]
        .get(..7)
        .is_some_and(|p| p.eq_ignore_ascii_case("bearer "))
    {
        start += 7;
    }
    let value = &input[start..];
    let first = value.chars().next()?;

    let (start, len) = if first == '"' || first == '\'' {
        let body = &value[1..];
        (start + 1, body.find(first).unwrap_or(body.len()))
    } else {
        let len = value
            .find(|c: char| c.is_whitespace() || "&,;)]}\"'".contains(c))
            .unwrap_or(value.len());
        (start, len)
    };

    (len > 0).then_some((start, start + len))
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(key, "key" | "pwd" | "passwd" | "authorization")
        || ["token", "secret", "password"].iter().any(|w| key.contains(w))
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}

/// Installs a process-wide hook that writes one crash file per panic under
/// `<data_dir>/logs/crash` before delegating to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookStatus {
    if let Some(dir) = HOOK_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled(dir.clone());
    }
    let Some(data_dir) = data_dir else {
        return PanicHookStatus::Disabled("no data directory configured".to_string());
    };

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(err) = fs::create_dir_all(&crash_dir) {
        return PanicHookStatus::Disabled(format!(
            "failed to create crash directory {}: {err}",
            crash_dir.display()
        ));
    }

    let _guard = HOOK_INSTALL.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(dir) = HOOK_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled(dir.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));
    let _ = HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookStatus::Installed(crash_dir)
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if HOOK_BUSY
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {err}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    HOOK_BUSY.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    timestamp: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let trace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match trace.status() {
            BacktraceStatus::Captured => ("captured", trace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                "<disabled>".to_string(),
            ),
            _ => ("unsupported", "<unavailable>".to_string()),
        };

        Self {
            timestamp: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));
        let mut file = fs::File::create(&path)?;
        write!(file, "{self}")?;
        file.flush()?;
        Ok(path)
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(f, "thread={}", self.thread)?;
        writeln!(f, "location={}", self.location)?;
        writeln!(f, "payload={}", self.payload)?;
        writeln!(f, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(f, "backtrace:")?;
        writeln!(f, "{}", self.backtrace)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
