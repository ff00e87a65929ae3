//! Interactive configuration setup.
//!
//! The real implementation lives in the product's settings UI (an
//! external collaborator); this subcommand exists only so the CLI
//! surface matches the teacher's shape. It reports that it is not
//! available from this binary rather than silently doing nothing.

use anyhow::Result;

pub async fn run() -> Result<()> {
    println!("Interactive configuration is managed by the application UI, not this binary.");
    Ok(())
}
