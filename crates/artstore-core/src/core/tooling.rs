use std::env;

/// Install a global fmt subscriber for embedding binaries and tests.
///
/// `ARTSTORE_LOG` replaces the filter derived from `verbose` (0 = info,
/// 1 = debug, more = trace). A second call keeps the first subscriber.
pub fn init_tracing(verbose: u8) {
    let filter = env::var("ARTSTORE_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_filter(verbose));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn default_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("artstore_core={level},artstore_domain={level}")
}
