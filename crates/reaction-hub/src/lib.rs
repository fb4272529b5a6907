// SPDX-License-Identifier: Apache-2.0
//! Connection registry, frame dispatch and sync relay, and the 1 Hz
//! aggregation tick for the live audience-reaction hub.

mod aggregator;
mod conn;
mod dispatch;
mod hub;

pub use aggregator::{compute_tick, run_tick, spawn_aggregator};
pub use conn::{ConnHandle, Registration, OUTBOUND_QUEUE_CAPACITY};
pub use dispatch::{dispatch_frame, DispatchCtx};
pub use hub::Hub;
