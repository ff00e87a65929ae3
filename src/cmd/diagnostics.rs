//! Diagnostics and system information.
//!
//! Kept as a thin stub: the full diagnostics bundle (log collection,
//! VM state dump) is assembled by the application, not this binary.

use anyhow::Result;

pub async fn run() -> Result<()> {
    println!("vmhost-core {}", env!("CARGO_PKG_VERSION"));
    println!("logical cpus: {}", num_cpus::get());
    Ok(())
}
