//! aptlink-sim: run a link session against the built-in simulator.
//!
//! ```text
//! aptlink-sim [config.json]
//! ```
//!
//! Connects, prints the motherboard identity, queries every slot, uploads a
//! small file to the embedded file system, reads it back and prints the
//! per-profile write statistics. `RUST_LOG` controls verbosity.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use aptlink::apt::protocol::SLOT_COUNT;
use aptlink::apt::waiter::block_on;
use aptlink::efs::{Attributes, FileId};
use aptlink::sim::{SimConfig, SimProvider};
use aptlink::{DeviceClass, Link, LinkConfig};

fn load_config() -> Result<LinkConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(LinkConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config: LinkConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    config.validate().context("invalid link configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;
    info!("aptlink-sim: {} baud, auto_reconnect={}", config.baud_rate, config.auto_reconnect);

    let provider = Arc::new(SimProvider::new(SimConfig::default(), DeviceClass::Application));
    let link = Link::builder(provider)
        .config(config)
        .build()
        .context("building link")?;

    let state = link.connect().context("connecting")?;
    let Some(hw) = link.hw_info() else {
        bail!("connected in {state:?} without hardware info");
    };
    println!("{}", serde_json::to_string_pretty(&hw)?);

    block_on(async {
        for slot in 0..SLOT_COUNT {
            match link.query_device(slot).await {
                Ok(dev) if dev.detected => {
                    info!("slot {}: {} (id {:#06x})", slot, dev.part_number, dev.device_id);
                }
                Ok(_) => {}
                Err(e) => warn!("slot {}: {}", slot, e),
            }
        }

        let id = FileId::new(1, 0);
        let data = b"aptlink demo payload".to_vec();
        let file = link
            .efs()
            .upload(id, Attributes::ALL, &data)
            .await
            .context("uploading demo file")?;
        let readback = file.read(0, data.len()).await.context("reading demo file")?;
        info!("efs {}: {}", id, String::from_utf8_lossy(&readback));
        Ok::<_, anyhow::Error>(())
    })?;

    println!("{}", serde_json::to_string_pretty(&link.efs().capacity())?);
    println!("{}", serde_json::to_string_pretty(&link.stats().snapshot())?);
    for event in link.events().drain_to_vec() {
        info!("event: {:?}", event);
    }

    link.disconnect();
    Ok(())
}
