//! # strand-core
//!
//! Core types for strand fiber-local and execution-local storage.
//!
//! This crate knows nothing about how fibers are scheduled. It provides the
//! pieces every scheduler backend shares; the reference backend lives in
//! `strand-runtime`.
//!
//! ## Modules
//!
//! - `index_alloc` - Tagged slot-index allocator with LIFO recycling
//! - `erased` - Type-erased owning slot entry (pointer + deleter)
//! - `overflow` - Address-stable overflow slots beyond the inline arrays
//! - `traits` - Fiber entity interface consumed by local storage
//! - `id` - Fiber identifier type
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod id;
pub mod index_alloc;
pub mod erased;
pub mod overflow;
pub mod error;
pub mod spinlock;
pub mod traits;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use index_alloc::{IndexAlloc, LazyIndex};
pub use erased::ErasedPtr;
pub use overflow::OverflowSlots;
pub use error::{StrandError, StrandResult};
pub use spinlock::SpinLock;
pub use traits::{FiberEntity, TrivialFls, TrivialValue};
pub use env::{
    env_get, env_get_bool, env_get_duration_ms, env_get_duration_us, env_get_opt, env_get_str,
    env_is_set,
};

/// Constants for storage layout
pub mod constants {
    /// Boxed fiber-local slots stored inline in each fiber entity
    pub const INLINE_FLS_SLOTS: usize = 8;

    /// Trivial (one machine word) fiber-local slots stored inline
    pub const INLINE_TRIVIAL_FLS_SLOTS: usize = 8;

    /// Execution-local slots stored inline in each execution context.
    ///
    /// Execution-local storage is not used heavily, 8 is enough for the
    /// common case. Anything beyond goes to a locked overflow map.
    pub const INLINE_ELS_SLOTS: usize = 8;

    /// Size of one trivial slot in bytes
    pub const TRIVIAL_SLOT_SIZE: usize = 8;
}
