use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Targets that `BUILDER_QUEUE_LOG` applies to.
const TARGETS: &[&str] = &[
    "builder_queue",
    "builder_queue_cli",
    "container_builder",
];

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence. Otherwise `BUILDER_QUEUE_LOG`
/// (`debug`, `info`, `warn` or `error`; default `info`) sets the level for
/// this workspace's crates. `LOG_FORMAT=json` emits JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("BUILDER_QUEUE_LOG").ok();
        EnvFilter::new(directives(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}
