use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber.
///
/// Process-wide and idempotent: only the first call installs anything, so
/// the binary and every test can call it before building a pipeline.
/// `RUST_LOG` takes precedence over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        // Another subscriber may already be installed by a host process.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::uptime())
            .try_init();
    });
}

/// Render a rate for log lines
pub fn format_fps(fps: f64) -> String {
    if fps > 0.0 {
        format!("{fps:.1} fps")
    } else {
        "-- fps".to_string()
    }
}
