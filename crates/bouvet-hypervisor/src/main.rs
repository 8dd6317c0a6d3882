//! Boot a single Firecracker sandbox and keep it running until Ctrl-C.
//!
//! Configuration comes from the `BOUVET_*` environment variables read by
//! [`HypervisorConfig::from_env`], plus these:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `BOUVET_TAP` | tap device to attach as `eth0` (optional) |
//! | `BOUVET_GUEST_MAC` | guest MAC for that interface (optional) |
//! | `BOUVET_BOOT_TIMEOUT` | seconds to wait for the guest, default 30 |

use bouvet_hypervisor::{Device, FileStore, Firecracker, HypervisorConfig, TapEndpoint};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("bouvet_hypervisor=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = HypervisorConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    let boot_timeout: i64 = std::env::var("BOUVET_BOOT_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let id = Uuid::new_v4().to_string();
    let store = Arc::new(FileStore::open(config.sandbox_dir(&id))?);
    let fc = Firecracker::create(id.clone(), config, store);

    if let Ok(tap_name) = std::env::var("BOUVET_TAP") {
        fc.add_device(Device::Network(Arc::new(TapEndpoint {
            name: "eth0".into(),
            hardware_addr: std::env::var("BOUVET_GUEST_MAC").unwrap_or_default(),
            tap_name,
        })))
        .await?;
    }

    fc.start_sandbox(boot_timeout).await?;

    match fc.vcpu_thread_ids().await {
        Ok(ids) => tracing::info!(sandbox_id = %id, vcpus = ?ids.vcpus, "vCPU threads"),
        Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Could not locate vCPU threads"),
    }

    tracing::info!(sandbox_id = %id, pid = fc.pid().await, "Sandbox running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    fc.stop_sandbox().await?;
    Ok(())
}
