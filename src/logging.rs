use std::io::IsTerminal;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `VESPER_LOG` takes precedence over
/// `RUST_LOG`. Output goes to stderr so command results on stdout stay
/// machine-readable.
pub fn init_tracing(component: &str) {
    let default_filter = format!("warn,vesper=info,{component}=info");

    let filter = std::env::var("VESPER_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .compact()
        .try_init();
}
