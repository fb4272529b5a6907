// SPDX-License-Identifier: Apache-2.0
//! Wire schema for the live audience-reaction hub.
//!
//! Defines the data model shared by every component (`Sample`, `Effect`,
//! `Session`, …) and the JSON framing used on the `/ws` channel between
//! browsers and the hub.

pub mod model;
pub mod wire;

pub use model::{
    Effect, EffectDebug, EffectType, Events, ExperimentGroup, Sample, Session, States, UserRecord,
    ACTIVE_WINDOW_MS, EVENT_NAMES, STATE_NAMES, WINDOW_SIZE,
};
pub use wire::{parse_frame, parse_handshake, ClientFrame, FrameError, HandshakeFrame, ParsedFrame, ReactionFrame, TransportKind};
