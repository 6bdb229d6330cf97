//! Off-chain revenue distribution: ingest contract events, snapshot
//! beneficiaries per epoch, split and allocate revenue, and publish Merkle
//! roots that back per-account claims.

#[macro_use]
extern crate diesel;

#[macro_use]
extern crate log;

pub mod allocation;
pub mod claims;
pub mod config;
pub mod constants;
pub mod db;
pub mod distribution;
pub mod errors;
pub mod events;
pub mod ingest;
pub mod merkle;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod responses;
pub mod rpc;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod testkit;
