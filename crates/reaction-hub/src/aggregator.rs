// SPDX-License-Identifier: Apache-2.0
//! The 1 Hz aggregation tick — ratios, densities, and the priority ladder
//! that picks at most one [`Effect`] per second.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use reaction_proto::{Effect, EffectDebug, EffectType, Sample, EVENT_NAMES, STATE_NAMES, WINDOW_SIZE};
use reaction_persistence::Persistence;
use reaction_store::Store;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::Hub;

const TICK_PERIOD_MS: u64 = 1000;
const DEFAULT_DURATION_MS: u64 = 2000;

/// `ratio_state[s]`: fraction of active users who held state `s` in any
/// sample of their current window.
fn ratio_state(active: &HashMap<String, Vec<Sample>>) -> BTreeMap<&'static str, f64> {
    let total = active.len() as f64;
    STATE_NAMES
        .iter()
        .map(|&name| {
            let holders = active
                .values()
                .filter(|samples| samples.iter().any(|s| s.states.iter().any(|(n, v)| n == name && v)))
                .count();
            (name, holders as f64 / total)
        })
        .collect()
}

/// `density_event[e]`: events per user per second across the window.
fn density_event(active: &HashMap<String, Vec<Sample>>) -> BTreeMap<&'static str, f64> {
    let total = active.len() as f64;
    EVENT_NAMES
        .iter()
        .map(|&name| {
            let sum: u32 = active
                .values()
                .flat_map(|samples| samples.iter())
                .flat_map(|s| s.events.iter())
                .filter(|(n, _)| *n == name)
                .map(|(_, count)| count)
                .sum();
            (name, f64::from(sum) / (total * WINDOW_SIZE as f64))
        })
        .collect()
}

fn get(map: &BTreeMap<&'static str, f64>, key: &str) -> f64 {
    map.get(key).copied().unwrap_or(0.0)
}

/// Run the priority ladder over precomputed ratios and densities, returning
/// the `(effect_type, intensity)` of the
/// highest-ranked predicate that holds, if any.
fn pick_effect(ratio_state: &BTreeMap<&'static str, f64>, density_event: &BTreeMap<&'static str, f64>) -> Option<(EffectType, f64)> {
    let hand_up = get(ratio_state, "isHandUp");
    let surprised = get(ratio_state, "isSurprised");
    let clap = get(density_event, "clap");
    let sway_vertical = get(density_event, "swayVertical");
    let shake_head = get(density_event, "shakeHead");
    let sway_horizontal = get(density_event, "swayHorizontal");
    let cheer = get(density_event, "cheer");
    let nod = get(density_event, "nod");
    let smiling = get(ratio_state, "isSmiling");
    let concentrating = get(ratio_state, "isConcentrating");

    if hand_up >= 0.30 {
        Some((EffectType::Cheer, hand_up))
    } else if surprised >= 0.30 {
        Some((EffectType::Excitement, surprised))
    } else if clap >= 0.15 {
        Some((EffectType::ClappingIcons, (clap / 0.8).min(1.0)))
    } else if sway_vertical >= 0.20 {
        Some((EffectType::Bounce, sway_vertical.clamp(0.0, 1.0)))
    } else if shake_head >= 0.20 {
        Some((EffectType::Shimmer, shake_head.clamp(0.0, 1.0)))
    } else if sway_horizontal >= 0.20 {
        Some((EffectType::Groove, sway_horizontal.clamp(0.0, 1.0)))
    } else if cheer >= 0.15 {
        Some((EffectType::Wave, (cheer / 0.8).min(1.0)))
    } else if nod >= 0.30 {
        Some((EffectType::Wave, (nod / 0.5).min(1.0)))
    } else if smiling >= 0.35 {
        Some((EffectType::Sparkle, smiling))
    } else if concentrating >= 0.40 {
        Some((EffectType::Focus, concentrating))
    } else {
        None
    }
}

/// Compute one tick's decision from a snapshot, or `None` if no effect
/// fires (either because the active set is empty or no predicate holds).
#[must_use]
pub fn compute_tick(active: &HashMap<String, Vec<Sample>>, now_ms: u64) -> Option<Effect> {
    if active.is_empty() {
        return None;
    }
    let ratios = ratio_state(active);
    let densities = density_event(active);
    let (effect_type, intensity) = pick_effect(&ratios, &densities)?;
    Some(Effect {
        effect_type,
        intensity: intensity.clamp(0.0, 1.0),
        duration_ms: DEFAULT_DURATION_MS,
        server_send_ms: now_ms,
        debug: Some(EffectDebug {
            active_users: active.len(),
            ratio_state: ratios,
            density_event: densities,
        }),
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Run one full tick against live collaborators: snapshot, decide, log,
/// broadcast. Exposed separately from [`spawn_aggregator`] so a caller (or
/// a test) can drive a single tick deterministically.
pub async fn run_tick(store: &Store, hub: &Hub, persistence: &Persistence) {
    let t = now_ms();
    let active = store.snapshot_active(t);
    if active.is_empty() {
        debug!(tick_ms = t, "idle tick: no active users");
        return;
    }
    let Some(effect) = compute_tick(&active, t) else {
        debug!(tick_ms = t, active_users = active.len(), "tick computed, no predicate fired");
        return;
    };
    persistence.log_effect(&effect, active.len(), None, None).await;
    hub.broadcast(&reaction_proto::wire::encode::effect(&effect));
}

/// Spawn the Aggregator as a standalone task firing every 1000 ms of server
/// monotonic time. If a tick's work exceeds its budget, the next tick is
/// skipped rather than queued, via `tokio`'s `MissedTickBehavior::Skip`.
/// Exits as soon as `shutdown` is cancelled, rather than running to
/// completion only on `JoinHandle::abort`.
pub fn spawn_aggregator(
    store: Arc<Store>,
    hub: Arc<Hub>,
    persistence: Arc<Persistence>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(TICK_PERIOD_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("aggregator shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let started = std::time::Instant::now();
                    run_tick(&store, &hub, &persistence).await;
                    let elapsed = started.elapsed();
                    if elapsed > Duration::from_millis(TICK_PERIOD_MS) {
                        warn!(elapsed_ms = elapsed.as_millis(), "aggregation tick overran its budget");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reaction_proto::{Events, States};

    fn sample(states: States, events: Events) -> Sample {
        Sample {
            user_id: "u".to_owned(),
            server_receive_ms: 0,
            states,
            events,
            video_time_seconds: None,
            session_id: None,
        }
    }

    #[test]
    fn empty_active_set_emits_nothing() {
        assert!(compute_tick(&HashMap::new(), 0).is_none());
    }

    #[test]
    fn single_smiler_emits_sparkle_at_full_intensity() {
        let mut active = HashMap::new();
        active.insert(
            "u1".to_owned(),
            vec![sample(
                States {
                    is_smiling: true,
                    ..States::default()
                },
                Events::default(),
            )],
        );
        let effect = compute_tick(&active, 1000).expect("effect");
        assert_eq!(effect.effect_type, EffectType::Sparkle);
        assert!((effect.intensity - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hands_up_outranks_smiling() {
        let mut active = HashMap::new();
        active.insert(
            "u1".to_owned(),
            vec![sample(
                States {
                    is_smiling: true,
                    ..States::default()
                },
                Events::default(),
            )],
        );
        active.insert(
            "u2".to_owned(),
            vec![sample(
                States {
                    is_smiling: true,
                    is_hand_up: true,
                    ..States::default()
                },
                Events::default(),
            )],
        );
        let effect = compute_tick(&active, 0).expect("effect");
        assert_eq!(effect.effect_type, EffectType::Cheer);
        assert!((effect.intensity - 0.5).abs() < 1e-9);
    }

    #[test]
    fn clap_density_saturates_at_one() {
        let mut active = HashMap::new();
        for id in ["u1", "u2", "u3"] {
            active.insert(
                id.to_owned(),
                vec![
                    sample(States::default(), Events { clap: 4, ..Events::default() }),
                    sample(States::default(), Events { clap: 4, ..Events::default() }),
                    sample(States::default(), Events { clap: 4, ..Events::default() }),
                ],
            );
        }
        let effect = compute_tick(&active, 0).expect("effect");
        assert_eq!(effect.effect_type, EffectType::ClappingIcons);
        assert!((effect.intensity - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn below_every_threshold_emits_nothing() {
        let mut active = HashMap::new();
        active.insert("u1".to_owned(), vec![sample(States::default(), Events::default())]);
        assert!(compute_tick(&active, 0).is_none());
    }

    #[tokio::test]
    async fn run_tick_logs_and_broadcasts_exactly_one_effect() {
        let store = Store::new();
        let hub = Hub::new();
        let persistence = Persistence::open_in_memory().unwrap();
        let t = now_ms();
        store.ensure_user("u1", reaction_proto::ExperimentGroup::Control2, t);
        store.append(Sample {
            user_id: "u1".to_owned(),
            server_receive_ms: t,
            states: States {
                is_smiling: true,
                ..States::default()
            },
            events: Events::default(),
            video_time_seconds: None,
            session_id: None,
        });
        let mut registration = hub.register("u1", reaction_proto::ExperimentGroup::Control2, false, t);
        run_tick(&store, &hub, &persistence).await;
        assert!(registration.receiver.try_recv().is_ok());
        let counts = persistence.table_counts().await.unwrap();
        assert_eq!(counts.effects_log, 1);
    }
}
