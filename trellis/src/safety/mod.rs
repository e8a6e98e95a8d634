//! Loop-safety: repeated-output, repeated-diff, and repeated-verification
//! stall detection.
//!
//! Counters are per-node scalars that reset on every non-match, so the
//! whole policy is one pure function over [`StallState`]; easy to unit
//! test in isolation and hard to get wrong in the scheduler.

use run_event::{StallEvidence, StallKind};
use sha2::{Digest, Sha256};

/// Default repeat threshold: a counter reaching 2 means 3 consecutive
/// identical values.
pub const DEFAULT_STALL_THRESHOLD: u32 = 2;

/// Hex SHA-256 of a turn output or diff, truncated for log readability.
pub fn sample_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// What a completed turn looked like, for repeat comparison.
#[derive(Clone, Debug, Default)]
pub struct TurnObservation {
    pub output_hash: Option<String>,
    pub diff_hash: Option<String>,
    pub verification_failure: Option<String>,
}

/// Per-node repeat counters plus the last observed values.
#[derive(Clone, Debug, Default)]
pub struct StallState {
    last_output_hash: Option<String>,
    last_diff_hash: Option<String>,
    last_verification_failure: Option<String>,
    output_repeat_count: u32,
    diff_repeat_count: u32,
    verification_repeat_count: u32,
}

impl StallState {
    pub fn reset(&mut self) {
        *self = StallState::default();
    }
}

/// Folds one completed-turn observation into the node's stall state and
/// returns evidence when any counter reaches the threshold.
///
/// Each counter increments when the current value equals the previous one
/// and resets to 0 otherwise; a missing value resets its counter. The
/// reported count is the number of consecutive identical values
/// (threshold 2 reports count 3).
pub fn update_stall_state(
    state: &mut StallState,
    node_id: &str,
    observation: &TurnObservation,
    threshold: u32,
) -> Option<StallEvidence> {
    fn bump(count: &mut u32, last: &mut Option<String>, current: &Option<String>) {
        match (last.as_deref(), current.as_deref()) {
            (Some(prev), Some(cur)) if prev == cur => *count += 1,
            _ => *count = 0,
        }
        *last = current.clone();
    }

    bump(
        &mut state.output_repeat_count,
        &mut state.last_output_hash,
        &observation.output_hash,
    );
    bump(
        &mut state.diff_repeat_count,
        &mut state.last_diff_hash,
        &observation.diff_hash,
    );
    bump(
        &mut state.verification_repeat_count,
        &mut state.last_verification_failure,
        &observation.verification_failure,
    );

    let hit = [
        (
            StallKind::OutputRepeat,
            state.output_repeat_count,
            &state.last_output_hash,
        ),
        (
            StallKind::DiffRepeat,
            state.diff_repeat_count,
            &state.last_diff_hash,
        ),
        (
            StallKind::VerificationRepeat,
            state.verification_repeat_count,
            &state.last_verification_failure,
        ),
    ]
    .into_iter()
    .find(|(_, count, _)| *count >= threshold);

    hit.map(|(kind, count, sample)| StallEvidence {
        kind,
        node_id: node_id.to_string(),
        sample_hash: sample.clone().unwrap_or_default(),
        count: count + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(output: &str) -> TurnObservation {
        TurnObservation {
            output_hash: Some(sample_hash(output)),
            ..Default::default()
        }
    }

    #[test]
    fn three_identical_outputs_trip_the_detector() {
        let mut state = StallState::default();
        assert!(update_stall_state(&mut state, "n1", &obs("same"), 2).is_none());
        assert!(update_stall_state(&mut state, "n1", &obs("same"), 2).is_none());
        let evidence = update_stall_state(&mut state, "n1", &obs("same"), 2)
            .expect("third identical output should stall");
        assert_eq!(evidence.kind, StallKind::OutputRepeat);
        assert_eq!(evidence.count, 3);
        assert_eq!(evidence.node_id, "n1");
        assert_eq!(evidence.sample_hash, sample_hash("same"));
    }

    #[test]
    fn non_match_resets_the_counter() {
        let mut state = StallState::default();
        update_stall_state(&mut state, "n1", &obs("a"), 2);
        update_stall_state(&mut state, "n1", &obs("a"), 2);
        update_stall_state(&mut state, "n1", &obs("b"), 2);
        assert!(update_stall_state(&mut state, "n1", &obs("b"), 2).is_none());
        assert!(update_stall_state(&mut state, "n1", &obs("b"), 2).is_some());
    }

    #[test]
    fn missing_value_resets_rather_than_matching() {
        let mut state = StallState::default();
        update_stall_state(&mut state, "n1", &TurnObservation::default(), 2);
        update_stall_state(&mut state, "n1", &TurnObservation::default(), 2);
        assert!(
            update_stall_state(&mut state, "n1", &TurnObservation::default(), 2).is_none(),
            "absent hashes never count as repeats"
        );
    }

    #[test]
    fn diff_repeat_reports_its_own_kind() {
        let mut state = StallState::default();
        let observation = TurnObservation {
            output_hash: None,
            diff_hash: Some(sample_hash("diff")),
            verification_failure: None,
        };
        update_stall_state(&mut state, "n1", &observation, 2);
        update_stall_state(&mut state, "n1", &observation, 2);
        let evidence = update_stall_state(&mut state, "n1", &observation, 2).unwrap();
        assert_eq!(evidence.kind, StallKind::DiffRepeat);
    }

    #[test]
    fn verification_failure_text_is_compared_verbatim() {
        let mut state = StallState::default();
        let fail = TurnObservation {
            verification_failure: Some("tests: 2 failed".to_string()),
            ..Default::default()
        };
        update_stall_state(&mut state, "n1", &fail, 2);
        update_stall_state(&mut state, "n1", &fail, 2);
        let evidence = update_stall_state(&mut state, "n1", &fail, 2).unwrap();
        assert_eq!(evidence.kind, StallKind::VerificationRepeat);
        assert_eq!(evidence.sample_hash, "tests: 2 failed");
    }

    #[test]
    fn sample_hash_is_stable_and_short() {
        assert_eq!(sample_hash("x"), sample_hash("x"));
        assert_ne!(sample_hash("x"), sample_hash("y"));
        assert_eq!(sample_hash("x").len(), 16);
    }
}
