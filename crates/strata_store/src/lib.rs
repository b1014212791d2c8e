//! Write coordination engine for the strata datastore.
//!
//! A write lands on the node that currently holds the target shard's primary
//! copy, executes there, and fans out to every active replica copy before a
//! single consolidated response goes back to the caller. This crate provides
//! the three-phase engine that coordinates that flow (`action::replication`),
//! the concrete document-index action built on it (`action::index`), and the
//! node-side collaborators the engine consumes: the shard/engine/translog
//! storage stack, the transport abstraction with an in-process mesh, and the
//! master-side mapping-update and shard-failure services.

pub mod action;
pub mod engine;
pub mod indices;
pub mod master;
pub mod node;
pub mod shard;
pub mod translog;
pub mod transport;
