//! Policy sources for the Davit autoscaler.
//!
//! A source supplies two things to the policy manager: a long-running
//! monitor publishing the current set of policy IDs it owns, and on-demand
//! retrieval of the latest validated document for one ID. Two sources ship
//! here:
//! - [`FilePolicySource`]: a directory of TOML policy documents with stable
//!   hashed IDs, rescanned on reload
//! - [`ApiPolicySource`]: blocking queries against an orchestrator API,
//!   advancing a wait index as policies change

#![forbid(unsafe_code)]

mod api;
mod error;
mod file;
mod source;

pub use api::{ApiPolicySource, HttpOrchestratorApi, OrchestratorApi, PolicyListing, PolicyStub};
pub use error::{Result, SourceError};
pub use file::FilePolicySource;
pub use source::{IdMessage, PolicySource, SourceName};
