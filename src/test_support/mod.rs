//! Shared helpers for unit tests.

pub mod scripted;

#[path = "../../tests/support/socket_guard.rs"]
pub mod socket_guard;
