//! Logging: tag-prefixed rendering to stdio or the system log.
//!
//! Supervisor messages are emitted through `tracing` macros and rendered
//! as `tag[pid]: message`. In foreground mode info lines go to stdout and
//! warnings/errors to stderr; in daemon mode every line goes to syslog
//! with the daemon facility. Lines read from the child's PTY are logged
//! under a dedicated event target carrying the child PID, so they get the
//! child tag instead of the supervisor's.

use std::fmt;
use std::io::Write;

use nix::syslog::{Facility, Priority, Severity, syslog};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Event target for lines produced by the supervised child.
pub const CHILD_TARGET: &str = "child";

pub struct Options {
    pub daemon: bool,
    pub parent_tag: String,
    pub child_tag: String,
}

/// Install the global subscriber. Called once, after daemonising, so the
/// destination decision is final.
pub fn init(opts: Options) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(TagLayer {
            daemon: opts.daemon,
            parent_tag: opts.parent_tag,
            child_tag: opts.child_tag,
        })
        .init();
}

/// Log one line of child output under the child tag.
///
/// The line arrives without its terminator. Child output is arbitrary
/// bytes; non-UTF-8 sequences are rendered lossily.
pub fn child_line(pid: i32, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    tracing::info!(target: "child", pid = i64::from(pid), "{}", text);
}

/// Renders `tag[pid]: message` and routes by mode and level.
struct TagLayer {
    daemon: bool,
    parent_tag: String,
    child_tag: String,
}

impl<S: Subscriber> Layer<S> for TagLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let is_child = meta.target() == CHILD_TARGET;
        let mut visitor = MessageVisitor::new(is_child);
        event.record(&mut visitor);

        let own_pid = i64::from(std::process::id());
        let (tag, pid) = if is_child {
            (self.child_tag.as_str(), visitor.pid.unwrap_or(own_pid))
        } else {
            (self.parent_tag.as_str(), own_pid)
        };

        let line = format_line(tag, pid, &visitor.message, &visitor.extra);
        if self.daemon {
            emit_syslog(*meta.level(), &line);
        } else {
            emit_stdio(*meta.level(), &line);
        }
    }
}

fn format_line(tag: &str, pid: i64, message: &str, extra: &str) -> String {
    format!("{tag}[{pid}]: {message}{extra}")
}

fn emit_stdio(level: Level, line: &str) {
    // Level orders by verbosity: ERROR is the smallest value.
    if level <= Level::WARN {
        let _ = writeln!(std::io::stderr(), "{line}");
    } else {
        let _ = writeln!(std::io::stdout(), "{line}");
    }
}

fn emit_syslog(level: Level, line: &str) {
    let _ = syslog(Priority::new(severity_for(level), Facility::LOG_DAEMON), line);
}

fn severity_for(level: Level) -> Severity {
    if level == Level::ERROR {
        Severity::LOG_ERR
    } else if level == Level::WARN {
        Severity::LOG_WARNING
    } else if level == Level::INFO {
        Severity::LOG_INFO
    } else {
        Severity::LOG_DEBUG
    }
}

/// Collects an event's `message` text and remaining fields.
///
/// For child-output events the `pid` field names the child and becomes
/// the tag suffix; for supervisor events every non-message field is
/// appended to the line as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    capture_pid: bool,
    message: String,
    pid: Option<i64>,
    extra: String,
}

impl MessageVisitor {
    fn new(capture_pid: bool) -> Self {
        MessageVisitor {
            capture_pid,
            ..Default::default()
        }
    }

    fn push_extra(&mut self, field: &Field, value: impl fmt::Display) {
        use fmt::Write as _;
        let _ = write!(self.extra, " {}={}", field.name(), value);
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            use fmt::Write as _;
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_extra(field, format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_extra(field, value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if self.capture_pid && field.name() == "pid" {
            self.pid = Some(value);
        } else {
            self.push_extra(field, value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if self.capture_pid && field.name() == "pid" {
            self.pid = Some(value as i64);
        } else {
            self.push_extra(field, value);
        }
    }
}
