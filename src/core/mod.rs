//! Core domain models for orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: task nodes, task state, and the execution
//! DAG.

pub mod dag;
pub mod task;

pub use dag::TaskDag;
pub use task::{ParallelHint, TaskId, TaskNode, TaskRecord, TaskState};
