//! Per-stage log files.
//!
//! [`StageLogLayer`] mirrors every event recorded inside a span named `stage`
//! (with a `name` field) to `logs/<name>.log`, one line per event:
//!
//! ```text
//! 2026-03-01 12:00:00,123 - preprocessing - INFO - normalized text train=800 test=200
//! ```

use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// Name of the span the layer keys on.
pub const STAGE_SPAN: &str = "stage";

/// Stage name stored in the extensions of a `stage` span.
struct StageName(String);

/// Appends stage events to `<dir>/<stage>.log`.
pub struct StageLogLayer {
    dir: PathBuf,
    // serializes appends from concurrent events
    lock: Mutex<()>,
}

impl StageLogLayer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self, stage: &str) -> PathBuf {
        log_path(&self.dir, stage)
    }

    fn append(&self, stage: &str, line: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(stage))
        {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Log file of `stage` under `dir`.
pub fn log_path(dir: &Path, stage: &str) -> PathBuf {
    dir.join(format!("{stage}.log"))
}

#[derive(Default)]
struct NameVisitor(Option<String>);

impl Visit for NameVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "name" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "name" && self.0.is_none() {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}

/// Message first, then `key=value` for every other field.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

impl<S> Layer<S> for StageLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != STAGE_SPAN {
            return;
        }
        let mut visitor = NameVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(name), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(StageName(name));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        // innermost stage span wins
        let Some(stage) = scope
            .into_iter()
            .find_map(|span| span.extensions().get::<StageName>().map(|n| n.0.clone()))
        else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
        let line = format!(
            "{timestamp} - {stage} - {} - {}{}",
            event.metadata().level(),
            visitor.message,
            visitor.fields
        );
        self.append(&stage, &line);
    }
}
