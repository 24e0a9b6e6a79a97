//! Tracing subscriber setup.
//!
//! One-shot initialization of the global subscriber: a formatted layer
//! with file and line information, filtered by `RUST_LOG` when set.

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static INIT: OnceCell<()> = OnceCell::new();

/// Initializes the global tracing subscriber; repeat calls are no-ops.
pub fn init_tracing() {
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_filter(filter),
            )
            .init();
    });
}
