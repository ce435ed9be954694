//! Sync logic for the service catalog API server
//!
//! A pass reads the control resource fresh, converges the operand for its
//! management state and writes back status. Cluster access goes through the
//! traits re-exported here so passes can be driven against mocks.

pub mod client;
pub mod probe;
pub mod removal;
mod workload;

pub use client::{KubeOperatorClient, OperatorClient};
pub use probe::{check_for_apis, ApiProbe, KubeApiProbe};
pub use removal::{DependentBinding, KubeRemovalClient, RemovalClient, RemovalSequencer};
pub use workload::{
    sync, Context, ContextBuilder, SyncOutcome, INJECT_CA_BUNDLE_ANNOTATION, PULL_SPEC_ANNOTATION,
};
