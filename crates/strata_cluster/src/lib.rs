//! Cluster model crate for the strata datastore.
//!
//! This crate provides the cluster-state model consumed by the write
//! coordination engine in `strata_store`. The API surface is intentionally
//! small: higher layers read immutable `ClusterState` snapshots and subscribe
//! to changes through a `ClusterStateObserver`.

pub mod cluster;
