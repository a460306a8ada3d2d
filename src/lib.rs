//! Replicated state over a Raft-style log.
//!
//! A [`raft::Node`] couples a [`application::StateMachine`] with a journal,
//! a full-dump snapshot file and a [`network::Transport`]. Commands submitted
//! through a [`raft::NodeHandle`] are applied in the same order on every
//! member of the cluster.

pub mod application;
pub mod client;
pub mod config;
pub mod network;
pub mod raft;
pub mod storage;
pub mod util;

pub use application::StateMachine;
pub use client::{CommandHandle, FailReason};
pub use config::Config;
pub use raft::{Node, NodeHandle, NodeOptions, NodeStatus, Scheduler};
pub use util::errors::{RaftError, Result};
