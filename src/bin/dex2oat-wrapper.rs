//! Stands in for dex2oat: fetches the real compiler and the hook library from the supervisor, then
//! executes the compiler through the dynamic linker with the hook library preloaded.

use std::process::ExitCode;

use dex2oat_wrapper::relay;
use tracing::error;

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    match relay::run(relay::SOCKET_NAME, std::env::args_os().collect()) {
        Ok(never) => match never {},
        Err(err) => {
            error!(%err, "dex2oat wrapper failed");
            ExitCode::from(err.exit_code())
        }
    }
}
