//! A compact length-prefixed TCP application server. Client connections are
//! sharded into buckets that drive batched, fair frame reads; decoded frames
//! are dispatched to user routers by message id, directly or through a worker
//! pool; fan-out back to clients filters by connection id or tag. An idle
//! reaper evicts stale connections.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod shared;
pub mod config;
pub mod frame;
pub mod buffer;
pub mod channel;
pub mod registry;
pub mod dispatch;
pub mod bucket;
pub mod group;
pub mod endpoint;
