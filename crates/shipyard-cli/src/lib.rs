//! # Shipyard CLI
//!
//! Command-line interface for running pipelines, deciding on gated
//! environments and inspecting runs and releases.
//!
//! ## Usage
//!
//! ```bash
//! # Run a pipeline against HEAD as a push to main
//! shipyard run pipeline.yaml --branch main
//!
//! # Approve a gated deployment of a running pipeline
//! shipyard approve --run 1b9d --job deploy-production --as alice
//!
//! # Inspect the last runs
//! shipyard history -n 5
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod commands;
pub mod config;
pub mod logging;

pub use commands::run;
pub use config::ShipyardConfig;
