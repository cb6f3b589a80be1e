//! Scoring & selection (C4): ranks discovered peers and chooses which to
//! dial under capacity (spec §4.4).

use std::time::{Duration, Instant};

use crate::identity::Identity;
use crate::mac::Mac;
use crate::registry::{PeerSnapshot, PeerState};

/// Score components and their max contributions (spec §4.4).
pub const MAX_RSSI_SCORE: f32 = 70.0;
pub const MAX_HISTORY_SCORE: f32 = 50.0;
pub const MAX_FRESHNESS_SCORE: f32 = 25.0;
pub const MAX_SCORE: f32 = MAX_RSSI_SCORE + MAX_HISTORY_SCORE + MAX_FRESHNESS_SCORE;

const RSSI_FLOOR: f32 = -100.0;
const RSSI_CEIL: f32 = -30.0;
const FRESHNESS_FULL: Duration = Duration::from_secs(5);
const FRESHNESS_ZERO: Duration = Duration::from_secs(30);

/// RSSI component, 0–70: clamp to [-100, -30], map linearly to [0, 70].
pub fn rssi_score(rssi_dbm: i16) -> f32 {
    let clamped = (rssi_dbm as f32).clamp(RSSI_FLOOR, RSSI_CEIL);
    (clamped - RSSI_FLOOR) / (RSSI_CEIL - RSSI_FLOOR) * MAX_RSSI_SCORE
}

/// History component, 0–50: benefit of the doubt at 25 with no attempts,
/// else proportional to the success rate.
pub fn history_score(attempts_total: u32, attempts_success: u32) -> f32 {
    if attempts_total == 0 {
        25.0
    } else {
        MAX_HISTORY_SCORE * attempts_success as f32 / attempts_total as f32
    }
}

/// Freshness component, 0–25: full marks within 5s, linear decay to 30s,
/// zero after. Callers additionally exclude peers stale past 30s from
/// selection (spec §4.4).
pub fn freshness_score(seen_at: Instant, now: Instant) -> f32 {
    let age = now.saturating_duration_since(seen_at);
    if age <= FRESHNESS_FULL {
        MAX_FRESHNESS_SCORE
    } else if age >= FRESHNESS_ZERO {
        0.0
    } else {
        let span = (FRESHNESS_ZERO - FRESHNESS_FULL).as_secs_f32();
        let elapsed = (age - FRESHNESS_FULL).as_secs_f32();
        MAX_FRESHNESS_SCORE * (1.0 - elapsed / span)
    }
}

/// Total score for a peer at time `now` (max 145).
pub fn score(snapshot: &PeerSnapshot, now: Instant) -> f32 {
    rssi_score(snapshot.rssi_last)
        + history_score(snapshot.attempts_total, snapshot.attempts_success)
        + freshness_score(snapshot.seen_at, now)
}

/// Selection filter parameters (subset of [`crate::config::EngineConfig`]).
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams {
    pub min_rssi: i16,
    pub connect_rate_limit: Duration,
    pub max_peers: usize,
    pub active_count: usize,
}

/// One candidate under consideration, paired with its score for tie-break
/// and ordering.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub identity: Identity,
    pub mac: Mac,
    pub rssi: i16,
    pub score: f32,
}

/// Select the top `max_peers - active_count` candidates passing every
/// filter in spec §4.4. `initiates` decides, per candidate, whether the
/// direction arbiter says we should be the one to dial (spec §4.5);
/// callers pass a closure so this module stays decoupled from [`crate::mac`]
/// ordering policy beyond what `arbitrate` already encodes.
pub fn select<'a>(
    candidates: impl Iterator<Item = (Identity, &'a PeerSnapshot)>,
    params: SelectionParams,
    now: Instant,
    initiates: impl Fn(Mac) -> bool,
) -> Vec<Candidate> {
    let slots = params.max_peers.saturating_sub(params.active_count);
    if slots == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<Candidate> = candidates
        .filter(|(_, snap)| snap.state != PeerState::Blacklisted)
        .filter(|(_, snap)| snap.rssi_last >= params.min_rssi)
        .filter(|(_, snap)| !matches!(snap.state, PeerState::Dialing | PeerState::Active))
        .filter(|(_, snap)| {
            snap.last_attempt_at
                .map(|t| now.saturating_duration_since(t) >= params.connect_rate_limit)
                .unwrap_or(true)
        })
        .filter(|(_, snap)| freshness_score(snap.seen_at, now) > 0.0)
        .filter(|(_, snap)| initiates(snap.mac))
        .map(|(identity, snap)| Candidate {
            identity,
            mac: snap.mac,
            rssi: snap.rssi_last,
            score: score(snap, now),
        })
        .collect();

    // Stronger RSSI first, then lower MAC, matching spec's tie-break rule;
    // score is the primary ranking key.
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.rssi.cmp(&a.rssi))
            .then_with(|| a.mac.as_u64().cmp(&b.mac.as_u64()))
    });

    ranked.truncate(slots);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_score_clamps_and_scales() {
        assert_eq!(rssi_score(-30), MAX_RSSI_SCORE);
        assert_eq!(rssi_score(-20), MAX_RSSI_SCORE);
        assert_eq!(rssi_score(-100), 0.0);
        assert_eq!(rssi_score(-150), 0.0);
        assert!((rssi_score(-65) - 35.0).abs() < 0.5);
    }

    #[test]
    fn history_score_gives_benefit_of_doubt() {
        assert_eq!(history_score(0, 0), 25.0);
        assert_eq!(history_score(10, 10), MAX_HISTORY_SCORE);
        assert_eq!(history_score(10, 5), 25.0);
    }

    #[test]
    fn freshness_decays_linearly_then_zero() {
        let now = Instant::now();
        assert_eq!(freshness_score(now, now), MAX_FRESHNESS_SCORE);
        let stale = now - Duration::from_secs(60);
        assert_eq!(freshness_score(stale, now), 0.0);
        let mid = now - Duration::from_secs(17); // halfway between 5s and 30s
        let s = freshness_score(mid, now);
        assert!(s > 0.0 && s < MAX_FRESHNESS_SCORE);
    }

    #[test]
    fn max_score_is_145() {
        assert_eq!(MAX_SCORE, 145.0);
    }

    fn snap(mac: Mac, rssi: i16, state: PeerState, last_attempt_at: Option<Instant>) -> PeerSnapshot {
        PeerSnapshot {
            mac,
            rssi_last: rssi,
            seen_at: Instant::now(),
            attempts_total: 0,
            attempts_success: 0,
            consecutive_failures: 0,
            last_attempt_at,
            state,
            blacklisted_until: None,
        }
    }

    #[test]
    fn selection_honors_max_peers_as_strict_upper_bound() {
        let now = Instant::now();
        let snaps: Vec<(Identity, PeerSnapshot)> = (0..10)
            .map(|i| {
                let mac = Mac::new(i as u64);
                (
                    Identity::from_bytes([i as u8; 16]),
                    snap(mac, -40, PeerState::Discovered, None),
                )
            })
            .collect();
        let params = SelectionParams {
            min_rssi: -85,
            connect_rate_limit: Duration::from_secs(5),
            max_peers: 7,
            active_count: 5,
        };
        let selected = select(
            snaps.iter().map(|(id, s)| (*id, s)),
            params,
            now,
            |_| true,
        );
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn selection_excludes_blacklisted_and_rate_limited() {
        let now = Instant::now();
        let blacklisted = (
            Identity::from_bytes([1u8; 16]),
            snap(Mac::new(1), -40, PeerState::Blacklisted, None),
        );
        let rate_limited = (
            Identity::from_bytes([2u8; 16]),
            snap(Mac::new(2), -40, PeerState::Discovered, Some(now)),
        );
        let ok = (
            Identity::from_bytes([3u8; 16]),
            snap(Mac::new(3), -40, PeerState::Discovered, None),
        );
        let all = vec![blacklisted, rate_limited, ok];
        let params = SelectionParams {
            min_rssi: -85,
            connect_rate_limit: Duration::from_secs(5),
            max_peers: 7,
            active_count: 0,
        };
        let selected = select(all.iter().map(|(id, s)| (*id, s)), params, now, |_| true);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].identity, Identity::from_bytes([3u8; 16]));
    }

    proptest::proptest! {
        #[test]
        fn selection_never_exceeds_max_peers_minus_active(
            rssis in proptest::collection::vec(-100i16..=-30, 0..40),
            max_peers in 0usize..20,
            active_count in 0usize..20,
        ) {
            let now = Instant::now();
            let snaps: Vec<(Identity, PeerSnapshot)> = rssis
                .iter()
                .enumerate()
                .map(|(i, &rssi)| {
                    let mac = Mac::new(i as u64);
                    (
                        Identity::from_bytes([i as u8; 16]),
                        snap(mac, rssi, PeerState::Discovered, None),
                    )
                })
                .collect();
            let params = SelectionParams {
                min_rssi: -85,
                connect_rate_limit: Duration::from_secs(5),
                max_peers,
                active_count,
            };
            let selected = select(
                snaps.iter().map(|(id, s)| (*id, s)),
                params,
                now,
                |_| true,
            );
            let slots = max_peers.saturating_sub(active_count);
            proptest::prop_assert!(selected.len() <= slots);
        }
    }
}
