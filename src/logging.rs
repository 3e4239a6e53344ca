use std::io::Write;
use std::sync::Once;

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Initialize logging for embedders and tests. Honors `RUST_LOG`; defaults
/// to debug for this crate and warn for everything else. Safe to call more
/// than once.
pub fn init_logging() {
    INIT.call_once(|| {
        let mut builder = Builder::new();

        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            builder.parse_filters(&rust_log);
        } else {
            builder.filter_module("gleiswerk", LevelFilter::Debug);
            builder.filter_level(LevelFilter::Warn);
        }

        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

        builder.target(env_logger::Target::Stderr);
        let _ = builder.try_init();
    });
}
