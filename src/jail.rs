//! Jail management module
//!
//! This module provides:
//! - FFI bindings to FreeBSD jail syscalls
//! - Type-safe parameter handling
//! - The kernel seam used by the lifecycle engine
//! - State machine for jail lifecycle management
//! - Runtime instances and their on-disk records

#[cfg(target_os = "freebsd")]
pub mod ffi;
pub mod instance;
pub mod kernel;
pub mod state;
pub mod types;

// Re-exports
pub use instance::{JailInstance, RecordLock, Resource};
pub use kernel::{HostKernel, JailKernel, JailParams, StopPolicy, build_params, terminate};
pub use state::{JailState, Lifecycle};
