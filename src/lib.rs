//! runner-pool - per-session sandbox containers behind an HTTP front door.
//!
//! Each caller session gets its own sandbox container, bounded by a global
//! ceiling. Overflow waits in a FIFO queue, idle sandboxes are reclaimed in
//! the background, and every sandbox is destroyed on shutdown.

pub mod config;
pub mod error;
pub mod http_server;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod state;

#[cfg(test)]
mod testing;
