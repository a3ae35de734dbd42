// SPDX-License-Identifier: (MIT OR Apache-2.0)
#![allow(dead_code)]
//! Shared integration test utilities.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use proptest::prelude::ProptestConfig;
use strand_rt::{Executor, LooperExecutor};

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Spin until `cond` holds, failing the test after five seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn looper() -> Arc<dyn Executor> {
    Arc::new(LooperExecutor::new())
}

/// Cases per property; `PROPTEST_CASES` overrides.
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cases);
    ProptestConfig::with_cases(cases)
}
