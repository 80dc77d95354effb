//! Small runtime utilities shared by the server crates: the logging facade,
//! wall-clock helpers and the two background-task primitives (periodic ticker
//! and single-consumer queue).

#![allow(clippy::new_without_default)]

pub mod logging;
pub mod queue;
pub mod ticker;
pub mod time;
