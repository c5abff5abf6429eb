//! `TaskSync`: offline-first task store with a replaying sync queue.
//!
//! Mutations go through [`repo::TaskRepository`], which writes the local
//! [`store::LocalStore`] first and then tries the [`remote::RemoteBackend`],
//! deferring failed or skipped writes into the [`queue::PendingQueue`].
//! [`sync::SyncProcessor`] replays that queue at startup and on a timer.
//! [`engine::SyncEngine`] wires the pieces together.

pub mod config;
pub mod engine;
pub mod events;
pub mod queue;
pub mod remote;
pub mod repo;
pub mod store;
pub mod sync;
