//! Common logging setup, shared by every pyzord daemon and tool.

/// Logging flags accepted by every binary. The verbosity flag takes any
/// tracing env-filter directive, so `-v debug` and
/// `-v relay=trace,info` both work.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity: trace|debug|info|warn|error|off, or a full
    /// env-filter directive.
    #[arg(
        long = "log.level",
        short = 'v',
        default_value = "info",
        num_args(0..=1),
        default_missing_value = "debug",
        env = "PYZORD_LOG",
        global = true
    )]
    pub level: String,

    #[arg(long = "log.format", value_enum, global = true)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line on stderr, for log shippers.
    Json,
    /// Plain text without colors.
    Text,
    /// Text with colors, for interactive terminals.
    Color,
}

fn default_log_format() -> LogFormat {
    if atty::is(atty::Stream::Stderr) {
        LogFormat::Color
    } else {
        // Non-interactive runs are almost always under a supervisor that
        // collects structured logs.
        LogFormat::Json
    }
}

/// Initializes the global tracing subscriber. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.level.as_str())
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false);

    match args.format.unwrap_or_else(default_log_format) {
        LogFormat::Json => {
            builder.json().flatten_event(true).with_current_span(true).init();
        }
        LogFormat::Text => {
            builder.compact().with_ansi(false).init();
        }
        LogFormat::Color => {
            builder.compact().with_ansi(true).init();
        }
    }
}
