//! Tracing subscriber setup shared by the Outpost binaries.
//!
//! Everything is driven by `OUTPOST_LOG_*` environment variables so the API
//! server and provisioner daemons log the same way:
//!
//! | variable | values | default |
//! |---|---|---|
//! | `OUTPOST_LOG_LEVEL` | any `EnvFilter` directive | `info` |
//! | `OUTPOST_LOG_OUTPUT` | `console`, `file`, `both`, `none` | `console` |
//! | `OUTPOST_LOG_FORMAT` | `human`, `json` | `human` |
//! | `OUTPOST_LOG_FILE` | path of the daily-rolled log file | `/tmp/outpost.log` |
//! | `OUTPOST_LOG_TAGS` | `key:value,...` span field filters | none |
//!
//! `RUST_LOG`, when set, takes precedence over `OUTPOST_LOG_LEVEL`.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry::{self, LookupSpan},
    EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/outpost.log";

/// Crates that are too chatty at `debug`.
const QUIET_CRATES: [&str; 4] = ["tokio=warn", "hyper=warn", "sqlx=warn", "tungstenite=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Self::File,
            "both" => Self::Both,
            "none" | "off" => Self::None,
            _ => Self::Console,
        }
    }

    fn console(self) -> bool {
        matches!(self, Self::Console | Self::Both)
    }

    fn file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Human
        }
    }
}

/// Only events inside a span carrying `key` with a value containing
/// `value` (`*` matches anything) pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

/// Parses `key:value,key:value`. Malformed entries are skipped.
pub fn parse_tags(spec: &str) -> Vec<TagFilter> {
    spec.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(TagFilter {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file: PathBuf,
    pub tags: Vec<TagFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file: PathBuf::from(DEFAULT_LOG_FILE),
            tags: Vec::new(),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("OUTPOST_LOG_LEVEL").unwrap_or(defaults.level),
            output: lookup("OUTPOST_LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            format: lookup("OUTPOST_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.format),
            file: lookup("OUTPOST_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file),
            tags: lookup("OUTPOST_LOG_TAGS")
                .map(|v| parse_tags(&v))
                .unwrap_or_default(),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        for directive in QUIET_CRATES {
            if let Ok(directive) = directive.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }

    fn file_parts(&self) -> (&Path, &Path) {
        let dir = self
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = self
            .file
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("outpost.log"));
        (dir, name)
    }
}

/// Writes every line to both sinks; succeeds if either one did.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let a = self.a.write(buf);
        let b = self.b.write(buf);
        a.or(b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

struct MakeTee<A, B> {
    a: A,
    b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.a.make_writer(),
            b: self.b.make_writer(),
        }
    }
}

struct SpanFields(HashMap<String, String>);

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

struct TagFilterLayer {
    filters: Vec<TagFilter>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    // The decision depends on the current span, so it is never cached.
    fn register_callsite(&self, _meta: &'static Metadata<'static>) -> Interest {
        if self.filters.is_empty() {
            Interest::always()
        } else {
            Interest::sometimes()
        }
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if self.filters.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        if self.filters.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
                values.record(&mut FieldVisitor(fields));
            }
        }
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() || meta.is_span() {
            return true;
        }

        // With tags set, events outside any span are dropped.
        let Some(scope) = ctx.lookup_current().map(|span| span.scope()) else {
            return false;
        };

        let mut seen: HashMap<String, String> = HashMap::new();
        for span in scope {
            if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                for (k, v) in fields {
                    seen.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            seen.get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

/// Installs the global subscriber from `OUTPOST_LOG_*`. Keep the returned
/// guard alive for the life of the process when file output is on, or
/// buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogConfig::from_env())
}

pub fn init_with(config: &LogConfig) -> Option<WorkerGuard> {
    let base = registry::Registry::default()
        .with(config.env_filter())
        .with(TagFilterLayer {
            filters: config.tags.clone(),
        });
    let json = config.format == LogFormat::Json;

    macro_rules! install {
        ($writer:expr) => {{
            let layer = tracing_subscriber::fmt::layer().with_writer($writer);
            let result = if json {
                base.with(layer.json()).try_init()
            } else {
                base.with(layer).try_init()
            };
            if let Err(e) = result {
                eprintln!("tracing subscriber already installed: {e}");
            }
        }};
    }

    let (dir, name) = config.file_parts();
    match (config.output.console(), config.output.file()) {
        (true, true) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            install!(MakeTee {
                a: io::stdout,
                b: writer,
            });
            Some(guard)
        }
        (true, false) => {
            install!(io::stdout);
            None
        }
        (false, true) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            install!(writer);
            Some(guard)
        }
        (false, false) => {
            if let Err(e) = base.try_init() {
                eprintln!("tracing subscriber already installed: {e}");
            }
            None
        }
    }
}
