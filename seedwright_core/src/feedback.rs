use crate::descriptor::Model;
use crate::model::{CallId, LifecycleState, ResourceTypeId};
use crate::sequence::Sequence;
use crate::tracker::{Effect, LifecycleTracker};
use std::collections::HashSet;

/// Decides whether a generated sequence adds anything to a batch.
pub trait Feedback: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_interesting(&self, sequence: &Sequence) -> bool;
    /// Records `sequence`; returns true if it was interesting.
    fn report_interesting(&mut self, sequence: &Sequence) -> bool;
}

/// `(type, state)` pairs and `(type, from, call)` transitions exercised so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionCoverage {
    states: HashSet<(ResourceTypeId, LifecycleState)>,
    transitions: HashSet<(ResourceTypeId, LifecycleState, CallId)>,
}

impl TransitionCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_state(&self, resource_type: &ResourceTypeId, state: LifecycleState) -> bool {
        self.states.contains(&(resource_type.clone(), state))
    }

    pub fn has_transition(
        &self,
        resource_type: &ResourceTypeId,
        from: LifecycleState,
        call: &CallId,
    ) -> bool {
        self.transitions
            .contains(&(resource_type.clone(), from, call.clone()))
    }

    /// Number of unvisited states and transitions `effect` would reach.
    pub fn novelty(&self, tracker: &LifecycleTracker<'_>, call: &CallId, effect: &Effect) -> usize {
        let mut novel = 0;
        for (id, to) in &effect.transitions {
            if let Some(instance) = tracker.instance(*id) {
                if !self.has_transition(&instance.resource_type, instance.state, call) {
                    novel += 1;
                }
                if !self.has_state(&instance.resource_type, *to) {
                    novel += 1;
                }
            }
        }
        if let Some(produced) = &effect.produced {
            if !self.has_state(&produced.resource_type, produced.state) {
                novel += 1;
            }
        }
        novel
    }

    /// Records what `effect` does; call before committing it to `tracker`.
    pub fn observe(&mut self, tracker: &LifecycleTracker<'_>, call: &CallId, effect: &Effect) {
        for (id, to) in &effect.transitions {
            if let Some(instance) = tracker.instance(*id) {
                self.transitions
                    .insert((instance.resource_type.clone(), instance.state, call.clone()));
                self.states.insert((instance.resource_type.clone(), *to));
            }
        }
        if let Some(produced) = &effect.produced {
            self.states
                .insert((produced.resource_type.clone(), produced.state));
        }
    }

    /// Replays `sequence` and records every transition it takes. Stops at the
    /// first invocation the model rejects.
    pub fn record_sequence(&mut self, model: &Model, sequence: &Sequence) {
        let Ok(mut tracker) = LifecycleTracker::with_external(model, &sequence.external) else {
            return;
        };
        for (index, invocation) in sequence.calls.iter().enumerate() {
            match tracker.check(index, invocation) {
                Ok(effect) => {
                    self.observe(&tracker, &invocation.call, &effect);
                    tracker.commit(effect);
                }
                Err(_) => return,
            }
        }
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }
}

/// Keeps sequences whose call/argument shape has not been seen before.
#[derive(Debug, Default)]
pub struct UniqueSequenceFeedback {
    pub known_hashes: HashSet<[u8; 16]>,
}

impl UniqueSequenceFeedback {
    pub fn new() -> Self {
        Self {
            known_hashes: HashSet::new(),
        }
    }
}

impl Feedback for UniqueSequenceFeedback {
    fn name(&self) -> &'static str {
        "UniqueSequenceFeedback"
    }

    fn is_interesting(&self, sequence: &Sequence) -> bool {
        !self.known_hashes.contains(&sequence.fingerprint())
    }

    fn report_interesting(&mut self, sequence: &Sequence) -> bool {
        self.known_hashes.insert(sequence.fingerprint())
    }
}

/// Keeps sequences that call some adjacent pair of library functions no
/// earlier sequence did.
#[derive(Debug, Default)]
pub struct CallPairFeedback {
    pub known_pairs: HashSet<(CallId, CallId)>,
}

impl CallPairFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    fn novel_pairs<'s>(&'s self, sequence: &'s Sequence) -> impl Iterator<Item = (&'s CallId, &'s CallId)> + 's {
        sequence
            .call_pairs()
            .filter(|(first, second)| !self.known_pairs.contains(&((*first).clone(), (*second).clone())))
    }
}

impl Feedback for CallPairFeedback {
    fn name(&self) -> &'static str {
        "CallPairFeedback"
    }

    fn is_interesting(&self, sequence: &Sequence) -> bool {
        self.novel_pairs(sequence).next().is_some()
    }

    fn report_interesting(&mut self, sequence: &Sequence) -> bool {
        let mut novel = false;
        for (first, second) in sequence.call_pairs() {
            novel |= self.known_pairs.insert((first.clone(), second.clone()));
        }
        novel
    }
}

/// Indices of the sequences worth keeping: unique shapes that each
/// contribute at least one new call pair, visited in order.
pub fn minimize(sequences: &[Sequence]) -> Vec<usize> {
    let mut unique = UniqueSequenceFeedback::new();
    let mut pairs = CallPairFeedback::new();
    let mut kept = Vec::new();
    for (index, sequence) in sequences.iter().enumerate() {
        if !unique.report_interesting(sequence) {
            continue;
        }
        // Too short to have a pair: judged by shape alone.
        if pairs.report_interesting(sequence) || sequence.len() < 2 {
            kept.push(index);
        }
    }
    tracing::debug!(
        total = sequences.len(),
        kept = kept.len(),
        call_pairs = pairs.known_pairs.len(),
        "minimized sequence batch"
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::CallInvocation;

    fn sequence(calls: &[&str]) -> Sequence {
        Sequence::new(calls.iter().map(|c| CallInvocation::new(*c)).collect())
    }

    #[test]
    fn unique_sequence_feedback_rejects_repeated_shapes() {
        let mut feedback = UniqueSequenceFeedback::new();
        let first = sequence(&["open", "close"]);

        assert!(feedback.is_interesting(&first));
        assert!(feedback.report_interesting(&first));
        assert!(!feedback.is_interesting(&first));
        assert!(!feedback.report_interesting(&first));

        let mut seeded = first.clone();
        seeded.seed = Some(7);
        assert!(!feedback.is_interesting(&seeded), "seed is not part of the shape");

        assert!(feedback.report_interesting(&sequence(&["open", "exec", "close"])));
        assert_eq!(feedback.known_hashes.len(), 2);
    }

    #[test]
    fn call_pair_feedback_tracks_adjacent_pairs_only() {
        let mut feedback = CallPairFeedback::new();
        assert!(feedback.report_interesting(&sequence(&["open", "prepare", "finalize", "close"])));
        assert!(!feedback.is_interesting(&sequence(&["open", "prepare"])));
        assert!(feedback.is_interesting(&sequence(&["open", "close"])));
    }

    #[test]
    fn minimize_keeps_sequences_adding_new_call_pairs() {
        let batch = vec![
            sequence(&["open", "prepare", "finalize", "close"]),
            sequence(&["open", "prepare", "finalize", "close"]),
            sequence(&["open", "prepare"]),
            sequence(&["open", "exec", "close"]),
        ];
        assert_eq!(minimize(&batch), vec![0, 3]);
    }

    #[test]
    fn coverage_records_transitions_of_a_replayed_sequence() {
        let model = crate::builtin::load("zlib").expect("bundled zlib descriptor");
        let stream = ResourceTypeId::new("z_stream");
        let mut coverage = TransitionCoverage::new();
        let sequence = Sequence::new(vec![
            CallInvocation::new("deflate_init")
                .with_scalar(crate::model::ScalarValue::Int(6))
                .producing(0),
            CallInvocation::new("deflate_end").with_instance(0),
        ]);

        coverage.record_sequence(&model, &sequence);
        assert!(coverage.has_state(&stream, LifecycleState::Activated));
        assert!(coverage.has_transition(&stream, LifecycleState::Activated, &CallId::new("deflate_end")));
        assert!(coverage.has_state(&stream, LifecycleState::Closed));
        assert_eq!(coverage.transition_count(), 1);
    }
}
