//! Peer-to-peer sensor hub node.
//!
//! Homogeneous nodes produce synthetic sensor readings and replicate
//! them to every peer over a length-prefixed JSON protocol. State
//! converges through a last-write-wins register map; membership
//! converges through transitive JOIN/PEER_LIST gossip. There is no
//! coordinator — a node joins by contacting any existing member.

pub mod config;
pub mod dispatch;
pub mod inbound;
pub mod membership;
pub mod node;
pub mod outbound;
pub mod peers;
pub mod proto;
pub mod publisher;
pub mod sensors;
pub mod state;
pub mod web;
