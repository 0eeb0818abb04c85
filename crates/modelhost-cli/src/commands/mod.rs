//! Command implementations for the modelhost CLI

pub mod events;
pub mod launch;
pub mod stats;
pub mod status;
pub mod watch;
