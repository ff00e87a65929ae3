//! CLI command handlers.

use clap::Subcommand;

pub mod configure;
pub mod diagnostics;
pub mod migrate;
pub mod serve;

#[derive(Subcommand)]
pub enum Commands {
    /// Migrate images, volumes, networks and containers from a foreign
    /// Docker engine into this product's engine.
    Migrate(migrate::MigrateArgs),

    /// Run the user-space network stack as a long-running process.
    Serve(serve::ServeArgs),

    /// Interactive configuration setup (external collaborator surface;
    /// not implemented beyond argument parsing).
    Configure,

    /// Run diagnostics and display system information (external
    /// collaborator surface; not implemented beyond argument parsing).
    Diagnostics,
}
