//! C1b — Entity Migrators. One module per entity kind; each exposes a
//! single async `migrate` function invoked by the orchestrator's worker
//! pool / dependency runner.

pub mod container;
pub mod image;
pub mod network;
pub mod volume;
