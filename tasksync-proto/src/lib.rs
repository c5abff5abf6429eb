//! Shared data model and wire protocol definitions for `TaskSync`.

pub mod change;
pub mod codec;
pub mod documents;
pub mod remote;
pub mod task;
