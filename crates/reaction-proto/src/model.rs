// SPDX-License-Identifier: Apache-2.0
//! Core data model: samples, windows of boolean/count reactions, and effects.

use std::collections::BTreeMap;

/// Fixed set of boolean reaction states a client reports once per second.
pub const STATE_NAMES: [&str; 4] = [
    "isSmiling",
    "isSurprised",
    "isConcentrating",
    "isHandUp",
];

/// Fixed set of countable reaction events a client reports once per second.
pub const EVENT_NAMES: [&str; 6] = [
    "nod",
    "shakeHead",
    "swayVertical",
    "swayHorizontal",
    "cheer",
    "clap",
];

/// Sliding-window size: a `UserWindow` holds at most this many samples.
pub const WINDOW_SIZE: usize = 3;

/// Inactivity ceiling: a user falls out of the active set after this many
/// milliseconds without a new sample.
pub const ACTIVE_WINDOW_MS: u64 = (WINDOW_SIZE as u64) * 1000;

/// Boolean reaction states for a single sample. Unknown names in an inbound
/// payload are ignored; missing names default to `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct States {
    /// Client-reported smiling state.
    pub is_smiling: bool,
    /// Client-reported surprise state.
    pub is_surprised: bool,
    /// Client-reported concentration state.
    pub is_concentrating: bool,
    /// Client-reported hand-raised state.
    pub is_hand_up: bool,
}

impl States {
    /// Iterate `(state name, value)` pairs in the fixed, canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> {
        [
            ("isSmiling", self.is_smiling),
            ("isSurprised", self.is_surprised),
            ("isConcentrating", self.is_concentrating),
            ("isHandUp", self.is_hand_up),
        ]
        .into_iter()
    }
}

/// Countable reaction events for a single sample. Unknown names in an
/// inbound payload are ignored; missing names default to `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Events {
    /// Count of head-nod events this second.
    pub nod: u32,
    /// Count of head-shake events this second.
    pub shake_head: u32,
    /// Count of vertical sway events this second.
    pub sway_vertical: u32,
    /// Count of horizontal sway events this second.
    pub sway_horizontal: u32,
    /// Count of cheer events this second.
    pub cheer: u32,
    /// Count of clap events this second.
    pub clap: u32,
}

impl Events {
    /// Iterate `(event name, count)` pairs in the fixed, canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> {
        [
            ("nod", self.nod),
            ("shakeHead", self.shake_head),
            ("swayVertical", self.sway_vertical),
            ("swayHorizontal", self.sway_horizontal),
            ("cheer", self.cheer),
            ("clap", self.clap),
        ]
        .into_iter()
    }
}

/// Immutable record of one client-second of reaction data.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Identifier of the reporting user.
    pub user_id: String,
    /// Server monotonic-clock receive time, in milliseconds. Authoritative
    /// for windowing; never replaced by a client-supplied timestamp.
    pub server_receive_ms: u64,
    /// Boolean states reported for this second.
    pub states: States,
    /// Event counts reported for this second.
    pub events: Events,
    /// Client-reported video playback position, if any.
    pub video_time_seconds: Option<f64>,
    /// Opaque viewing-session tag, if any.
    pub session_id: Option<String>,
}

/// A declared experiment cohort for a connected viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExperimentGroup {
    /// Treatment group.
    Experiment,
    /// First control group.
    Control1,
    /// Second control group (default).
    #[default]
    Control2,
    /// Debug/instrumentation group; the only group allowed to send
    /// `manual_effect` frames.
    Debug,
}

impl ExperimentGroup {
    /// Parse from the wire string, defaulting to `Control2` for anything
    /// unrecognized (matching handshake's documented default).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "experiment" => Self::Experiment,
            "control1" => Self::Control1,
            "debug" => Self::Debug,
            _ => Self::Control2,
        }
    }

    /// Wire representation of this group.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Experiment => "experiment",
            Self::Control1 => "control1",
            Self::Control2 => "control2",
            Self::Debug => "debug",
        }
    }

    /// Whether this group may send `manual_effect` frames.
    #[must_use]
    pub const fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }
}

/// The finite set of visual effects the aggregator may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectType {
    /// Rank 9: broad smiling.
    Sparkle,
    /// Rank 7/8: cheering or nodding density.
    Wave,
    /// Rank 2: widespread surprise.
    Excitement,
    /// Rank 4: vertical-sway density.
    Bounce,
    /// Rank 1: widespread hands-up.
    Cheer,
    /// Rank 5: head-shake density.
    Shimmer,
    /// Rank 10: widespread concentration.
    Focus,
    /// Rank 6: horizontal-sway density.
    Groove,
    /// Rank 3: clap density.
    ClappingIcons,
}

impl EffectType {
    /// Wire representation of this effect type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sparkle => "sparkle",
            Self::Wave => "wave",
            Self::Excitement => "excitement",
            Self::Bounce => "bounce",
            Self::Cheer => "cheer",
            Self::Shimmer => "shimmer",
            Self::Focus => "focus",
            Self::Groove => "groove",
            Self::ClappingIcons => "clapping_icons",
        }
    }

    /// Parse from the wire string. Used to validate `manual_effect` frames.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "sparkle" => Self::Sparkle,
            "wave" => Self::Wave,
            "excitement" => Self::Excitement,
            "bounce" => Self::Bounce,
            "cheer" => Self::Cheer,
            "shimmer" => Self::Shimmer,
            "focus" => Self::Focus,
            "groove" => Self::Groove,
            "clapping_icons" => Self::ClappingIcons,
            _ => return None,
        })
    }
}

/// Debug payload attached to an `Effect`, carrying the statistics that
/// justified the decision. Present in this implementation's broadcasts,
/// though a production deployment may choose to omit it.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDebug {
    /// Number of active users considered at decision time.
    pub active_users: usize,
    /// Fraction of active users holding each boolean state this tick.
    pub ratio_state: BTreeMap<&'static str, f64>,
    /// Events-per-user-per-second for each countable event this tick.
    pub density_event: BTreeMap<&'static str, f64>,
}

/// One broadcast decision: at most one is emitted per aggregation tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    /// Which visual effect to play.
    pub effect_type: EffectType,
    /// Intensity in `[0, 1]`.
    pub intensity: f64,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Server send time, in milliseconds (monotonic clock).
    pub server_send_ms: u64,
    /// Justification payload for testing/analysis.
    pub debug: Option<EffectDebug>,
}

/// Per-viewing-instance metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Opaque session identifier.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Identifier of the video being watched.
    pub video_id: String,
    /// Server-receive time the session was created, in milliseconds.
    pub started_ms: u64,
}

/// A user record as tracked by persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// Identifier of the user.
    pub user_id: String,
    /// Declared experiment cohort.
    pub experiment_group: ExperimentGroup,
    /// Server-receive time of first connection, in milliseconds.
    pub created_ms: u64,
}
