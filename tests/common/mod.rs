//! Shared helpers for the integration tests: tracing setup and key
//! generation.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let keys = common::shuffled_keys(1..1000, 7);
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g. `olckv=debug,olckv::tree=trace`)
//! - `OLCKV_LOG_DIR`: log directory (default: `logs/`)
//! - `OLCKV_LOG_CONSOLE`: set to "0" to disable console output
//!
//! The library only emits events when built with `--features tracing`.
//!
//! # Log Files
//!
//! Events are appended to `logs/olckv.jsonl` as newline-delimited JSON:
//!
//! ```bash
//! # Commits and aborts of one transaction
//! cat logs/olckv.jsonl | jq 'select(.fields.txn == 16)'
//!
//! # Splits only
//! cat logs/olckv.jsonl | jq 'select(.fields.message | test("split"))'
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Once;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

/// Install the console and NDJSON file subscribers once per process.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Decimal keys for every number in `range`, in a seeded random order.
pub fn shuffled_keys(range: Range<u64>, seed: u64) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = range.map(|n| n.to_string().into_bytes()).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));
    keys
}

struct LogSettings {
    dir: PathBuf,
    console: bool,
    default_level: Level,
}

impl LogSettings {
    fn from_env() -> Self {
        Self {
            dir: env::var("OLCKV_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from),
            console: !env::var("OLCKV_LOG_CONSOLE").is_ok_and(|v| v == "0"),
            default_level: Level::INFO,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_level.to_string()))
    }
}

#[allow(clippy::expect_used)]
fn setup_tracing() {
    let settings = LogSettings::from_env();

    std::fs::create_dir_all(&settings.dir).expect("Failed to create log directory");

    // Append: test binaries run in separate processes.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(settings.dir.join("olckv.jsonl"))
        .expect("Failed to open log file");

    let console_layer = settings.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .with_target(true)
            .with_line_number(true)
            .compact()
            .with_filter(settings.filter())
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .with_filter(settings.filter());

    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
