//! IoT Gateway
//!
//! Device-management gateway that accepts JSON commands over TCP, UDP and
//! HTTP, including:
//! - A prioritized, resizable worker pool with pause/resume and cancellable tasks
//! - A single-threaded event loop for the socket transports and an axum HTTP adapter
//! - A runtime-extensible command registry with built-in device registration
//! - Out-of-process command plugins loaded from a watched directory

// Gateway configuration file
pub mod config;

// Command decoding, registry and routing
pub mod command;

// TCP/UDP event loop and HTTP adapter
pub mod net;

// Plugin loading and process hosting
pub mod plugin;

// Worker pool and priority queue
pub mod pool;

// Device registry storage
pub mod store;
