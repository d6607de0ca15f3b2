//! Timer backend implementations
//!
//! Only a binary heap for now. A timing wheel would slot in next to it.

mod heap;

pub use heap::{HeapTimerBackend, HeapTimerStats};

use std::sync::Arc;

use crate::timer::TimerBackend;

/// Backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerBackendType {
    /// O(log n) insert, O(1) kill, O(1) next deadline
    #[default]
    BinaryHeap,
}

impl TimerBackendType {
    pub fn name(&self) -> &'static str {
        match self {
            TimerBackendType::BinaryHeap => "binary_heap",
        }
    }
}

pub fn create_backend(backend_type: TimerBackendType) -> Arc<dyn TimerBackend> {
    match backend_type {
        TimerBackendType::BinaryHeap => Arc::new(HeapTimerBackend::new()),
    }
}
