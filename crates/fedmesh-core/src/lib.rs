//! # fedmesh-core
//!
//! Shared runtime helpers for federation controllers: framed async
//! networking, non-blocking sends, the one-shot event notifier and the
//! operator-facing federation formatter.

pub mod net;
pub mod notifier;
pub mod present;
pub mod send;
