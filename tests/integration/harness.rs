//! Shared setup for the integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aptlink::sim::{SimConfig, SimProvider};
use aptlink::{DeviceClass, Link, LinkConfig};

/// Timings short enough to keep the suite fast, long enough for CI.
pub fn fast_config() -> LinkConfig {
    LinkConfig {
        cooldown_ms: 1,
        ftdi_cooldown_ms: 2,
        writer_idle_timeout_ms: 20,
        response_timeout_ms: 500,
        handshake_timeout_ms: 100,
        handshake_retries: 3,
        auto_reconnect: false,
        ..LinkConfig::default()
    }
}

pub fn provider(class: DeviceClass) -> Arc<SimProvider> {
    Arc::new(SimProvider::new(SimConfig::default(), class))
}

pub fn link_with(provider: &Arc<SimProvider>, config: LinkConfig) -> Link {
    Link::builder(provider.clone())
        .config(config)
        .build()
        .expect("valid config")
}

/// A connected link to a fresh application-mode simulator.
pub fn connected() -> (Link, Arc<SimProvider>) {
    let sim = provider(DeviceClass::Application);
    let link = link_with(&sim, fast_config());
    link.connect().expect("connect to simulator");
    (link, sim)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
