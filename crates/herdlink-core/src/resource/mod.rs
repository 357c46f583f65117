//! Per-resource CRUD access on top of the gateway.

mod client;
pub mod params;

pub use client::{
    ChangeSet, ConditionalFetch, FetchSource, ResourceClient, ResourceMetadata, Validators,
    WriteOutcome,
};
pub use params::{parse_pairs, QueryParams};
