// ABOUTME: Queen module - phase scheduling, dispatch waves and between-wave housekeeping.
// ABOUTME: Error classification and quorum merging are pure helpers used by the waves.

mod classify;
mod observer;
mod queen;
mod quorum;

pub use classify::{ErrorClass, classify_error};
pub use observer::{ColonyObserver, NoopObserver};
pub use queen::{Queen, REVIEW_TITLE};
pub use quorum::quorum_merge;
