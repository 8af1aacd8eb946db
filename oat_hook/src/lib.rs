//! Library preloaded into dex2oat. Installs the key-value store hooks when loaded.

#![cfg(any(target_os = "android", target_os = "linux"))]

use tracing::info;

#[ctor::ctor]
fn install_on_load() {
    // The host may have installed its own subscriber.
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    let stage = dex2oat_wrapper::hooks::initialize();
    info!(pid = std::process::id(), ?stage, "oat hook loaded");
}
