use crate::catalog::{CallSpec, ParamSpec};
use crate::descriptor::Model;
use crate::feedback::TransitionCoverage;
use crate::model::{ResourceTypeId, ScalarValue};
use crate::sequence::{Argument, CallInvocation, ExternalInstance, Sequence};
use crate::tracker::{Effect, LifecycleTracker};
use crate::validator::{SequenceValidator, Violation};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Upper bound on argument combinations tried per call and step.
const MAX_BINDINGS_PER_CALL: usize = 16;
const NOVELTY_BONUS: f64 = 4.0;
const TARGET_PRODUCER_BOOST: f64 = 8.0;
const LINEAGE_PRODUCER_BOOST: f64 = 4.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Target resource type '{0}' is not registered")]
    UnknownTarget(ResourceTypeId),

    #[error("No catalogued call produces an instance of '{0}'")]
    NoProducer(ResourceTypeId),

    /// No leak-free sequence was found within the step budget and retries.
    /// Recoverable with a larger budget or a different seed.
    #[error("Generation for '{target}' exhausted after {attempts} attempts")]
    GenerationExhausted {
        target: ResourceTypeId,
        attempts: usize,
    },

    /// A committed prefix failed to replay or the result failed validation.
    #[error("Generated sequence rejected: {0}")]
    Rejected(#[from] Violation),
}

fn default_operate_budget() -> usize {
    8
}

/// One generation request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub target: ResourceTypeId,
    /// Minimum number of invocations before the walk turns to cleanup.
    #[serde(default = "default_operate_budget")]
    pub operate_budget: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub external: Vec<ExternalInstance>,
}

impl Scenario {
    pub fn new(target: impl Into<String>, operate_budget: usize, seed: u64) -> Self {
        Self {
            target: ResourceTypeId::new(target),
            operate_budget,
            seed,
            external: Vec::new(),
        }
    }

    pub fn with_external(mut self, external: ExternalInstance) -> Self {
        self.external.push(external);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    /// Invocations one attempt may append before it counts as stuck.
    #[serde(default = "default_step_budget")]
    pub step_budget: usize,
    #[serde(default = "default_backtrack_depth")]
    pub backtrack_depth: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_max_live_instances")]
    pub max_live_instances: usize,
    /// Weight factor for cleanup moves during the operate phase. Doubled on
    /// every retry.
    #[serde(default = "default_cleanup_bias")]
    pub cleanup_bias: f64,
}

pub fn default_step_budget() -> usize {
    64
}
pub fn default_backtrack_depth() -> usize {
    4
}
pub fn default_max_retries() -> usize {
    8
}
pub fn default_max_live_instances() -> usize {
    6
}
pub fn default_cleanup_bias() -> f64 {
    0.25
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            step_budget: default_step_budget(),
            backtrack_depth: default_backtrack_depth(),
            max_retries: default_max_retries(),
            max_live_instances: default_max_live_instances(),
            cleanup_bias: default_cleanup_bias(),
        }
    }
}

struct Candidate {
    invocation: CallInvocation,
    effect: Effect,
    weight: f64,
}

/// Grows leak-free sequences call by call with a seeded, weighted walk.
///
/// Transition coverage persists across [`generate`](Self::generate) calls on
/// the same generator, so later sequences lean toward unexplored edges.
#[derive(Debug, Clone)]
pub struct SequenceGenerator<'m> {
    model: &'m Model,
    settings: GeneratorSettings,
    coverage: TransitionCoverage,
}

impl<'m> SequenceGenerator<'m> {
    pub fn new(model: &'m Model, settings: GeneratorSettings) -> Self {
        Self {
            model,
            settings,
            coverage: TransitionCoverage::new(),
        }
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    pub fn coverage(&self) -> &TransitionCoverage {
        &self.coverage
    }

    pub fn generate(&mut self, scenario: &Scenario) -> Result<Sequence, GenerationError> {
        let target = &scenario.target;
        if self.model.registry().lookup(target).is_err() {
            return Err(GenerationError::UnknownTarget(target.clone()));
        }
        if self.model.catalog().producers_for(target).next().is_none() {
            return Err(GenerationError::NoProducer(target.clone()));
        }

        let mut walk = Walk {
            model: self.model,
            settings: &self.settings,
            scenario,
            lineage: lineage(self.model, target),
            base_coverage: self.coverage.clone(),
            coverage: TransitionCoverage::new(),
            calls: Vec::new(),
            cleanup_bias: self.settings.cleanup_bias,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(scenario.seed);
        tracing::debug!(resource_type = %target, seed = scenario.seed, "generating sequence");

        let attempts = self.settings.max_retries + 1;
        for attempt in 0..attempts {
            let mut tracker = walk.replay()?;
            if walk.run(&mut tracker, &mut rng) {
                let mut sequence = Sequence {
                    target: Some(target.clone()),
                    seed: Some(scenario.seed),
                    external: scenario.external.clone(),
                    calls: walk.calls,
                };
                sequence.annotate(self.model);
                SequenceValidator::new(self.model).validate(&sequence)?;
                self.coverage.record_sequence(self.model, &sequence);
                tracing::debug!(
                    resource_type = %target,
                    attempt,
                    calls = sequence.len(),
                    transitions_covered = self.coverage.transition_count(),
                    "generated sequence"
                );
                return Ok(sequence);
            }

            let keep = walk.calls.len().saturating_sub(self.settings.backtrack_depth);
            walk.calls.truncate(keep);
            walk.cleanup_bias *= 2.0;
            tracing::debug!(
                resource_type = %target,
                attempt,
                kept = keep,
                cleanup_bias = walk.cleanup_bias,
                "backtracking"
            );
        }

        tracing::warn!(resource_type = %target, seed = scenario.seed, attempts, "generation exhausted");
        Err(GenerationError::GenerationExhausted {
            target: target.clone(),
            attempts,
        })
    }
}

/// Target type plus every type whose instances feed one of its producers,
/// transitively.
fn lineage(model: &Model, target: &ResourceTypeId) -> BTreeSet<ResourceTypeId> {
    let mut lineage = BTreeSet::from([target.clone()]);
    let mut pending = vec![target.clone()];
    while let Some(resource_type) = pending.pop() {
        for producer in model.catalog().producers_for(&resource_type) {
            for (_, input, _, _) in producer.resource_params() {
                if lineage.insert(input.clone()) {
                    pending.push(input.clone());
                }
            }
        }
    }
    lineage
}

/// Literal used for a scalar parameter without samples.
fn default_scalar(host_type: &str) -> ScalarValue {
    let host_type = host_type.trim();
    if host_type.contains('*') {
        if host_type.contains("char") {
            ScalarValue::Str("seedwright".to_string())
        } else {
            ScalarValue::null()
        }
    } else if host_type == "bool" || host_type == "_Bool" {
        ScalarValue::Bool(false)
    } else if host_type == "float" || host_type == "double" {
        ScalarValue::Float(0.0)
    } else {
        ScalarValue::Int(0)
    }
}

/// Scratch state of one `generate` call.
struct Walk<'w, 'm> {
    model: &'m Model,
    settings: &'w GeneratorSettings,
    scenario: &'w Scenario,
    lineage: BTreeSet<ResourceTypeId>,
    /// Coverage before this walk started.
    base_coverage: TransitionCoverage,
    /// `base_coverage` plus what the committed prefix exercises.
    coverage: TransitionCoverage,
    calls: Vec<CallInvocation>,
    cleanup_bias: f64,
}

impl<'w, 'm> Walk<'w, 'm> {
    /// Rebuilds the tracker and coverage from the committed prefix.
    fn replay(&mut self) -> Result<LifecycleTracker<'m>, Violation> {
        let mut tracker = LifecycleTracker::with_external(self.model, &self.scenario.external)?;
        self.coverage = self.base_coverage.clone();
        for (index, invocation) in self.calls.iter().enumerate() {
            let effect = tracker.check(index, invocation)?;
            self.coverage.observe(&tracker, &invocation.call, &effect);
            tracker.commit(effect);
        }
        Ok(tracker)
    }

    fn is_complete(&self, tracker: &LifecycleTracker<'m>) -> bool {
        self.in_cleanup(tracker) && tracker.outstanding_cleanup() == 0
    }

    fn in_cleanup(&self, tracker: &LifecycleTracker<'m>) -> bool {
        tracker.has_produced(&self.scenario.target)
            && self.calls.len() >= self.scenario.operate_budget
    }

    /// Extends `self.calls` until the sequence is complete (true) or the
    /// attempt is stuck (false).
    fn run(&mut self, tracker: &mut LifecycleTracker<'m>, rng: &mut ChaCha8Rng) -> bool {
        for _ in 0..self.settings.step_budget {
            if self.is_complete(tracker) {
                return true;
            }
            let candidates = self.candidates(tracker, rng);
            let Some(chosen) = pick(candidates, rng) else {
                tracing::trace!(step = self.calls.len(), "no candidate call");
                return false;
            };
            tracing::trace!(step = self.calls.len(), call = %chosen.invocation.call, "step");
            self.coverage.observe(tracker, &chosen.invocation.call, &chosen.effect);
            tracker.commit(chosen.effect);
            self.calls.push(chosen.invocation);
        }
        self.is_complete(tracker)
    }

    fn candidates(&self, tracker: &LifecycleTracker<'m>, rng: &mut ChaCha8Rng) -> Vec<Candidate> {
        let cleanup = self.in_cleanup(tracker);
        let has_target = tracker.has_produced(&self.scenario.target);
        let crowded = tracker.live_instances().count() >= self.settings.max_live_instances;
        let index = self.calls.len();

        let mut candidates = Vec::new();
        for spec in self.model.catalog().calls() {
            let produced = spec.produced_type();
            if produced.is_some() && (cleanup || crowded) {
                continue;
            }
            for args in self.bindings(spec, tracker, rng) {
                let invocation = CallInvocation {
                    call: spec.id.clone(),
                    args,
                    produces: produced.map(|_| tracker.next_instance_id()),
                    hints: None,
                };
                let Ok(effect) = tracker.check(index, &invocation) else {
                    continue;
                };
                if releases_external(tracker, &effect) {
                    continue;
                }
                let delta = cleanup_delta(tracker, &effect);
                let weight = if cleanup {
                    if delta >= 0 {
                        continue;
                    }
                    1.0 + (-delta) as f64
                } else {
                    let mut weight =
                        1.0 + NOVELTY_BONUS * self.coverage.novelty(tracker, &spec.id, &effect) as f64;
                    if !has_target {
                        match produced {
                            Some(t) if *t == self.scenario.target => weight *= TARGET_PRODUCER_BOOST,
                            Some(t) if self.lineage.contains(t) => weight *= LINEAGE_PRODUCER_BOOST,
                            _ => {}
                        }
                    }
                    if delta < 0 {
                        weight *= self.cleanup_bias;
                    }
                    weight
                };
                candidates.push(Candidate {
                    invocation,
                    effect,
                    weight,
                });
            }
        }
        candidates
    }

    /// Argument lists for `spec`: resource parameters range over live
    /// instances in an accepted state, scalars take one random sample.
    fn bindings(
        &self,
        spec: &CallSpec,
        tracker: &LifecycleTracker<'m>,
        rng: &mut ChaCha8Rng,
    ) -> Vec<Vec<Argument>> {
        let mut partial: Vec<Vec<Argument>> = vec![Vec::new()];
        for param in &spec.params {
            let options: Vec<Argument> = match param {
                ParamSpec::Resource {
                    resource_type,
                    accepts,
                    ..
                } => tracker
                    .live_in(resource_type, accepts)
                    .map(Argument::Instance)
                    .collect(),
                ParamSpec::Scalar { host_type, samples } => {
                    let value = if samples.is_empty() {
                        default_scalar(host_type)
                    } else {
                        samples[rng.random_range(0..samples.len())].clone()
                    };
                    vec![Argument::Scalar(value)]
                }
            };
            if options.is_empty() {
                return Vec::new();
            }
            partial = partial
                .into_iter()
                .flat_map(|prefix| {
                    options.iter().map(move |option| {
                        let mut args = prefix.clone();
                        args.push(option.clone());
                        args
                    })
                })
                .take(MAX_BINDINGS_PER_CALL)
                .collect();
        }
        partial
    }
}

/// Externally owned instances are used but never released by generated code.
fn releases_external(tracker: &LifecycleTracker<'_>, effect: &Effect) -> bool {
    effect.transitions.iter().any(|(id, to)| {
        tracker.instance(*id).is_some_and(|instance| {
            instance.is_external()
                && tracker.cleanup_distance(&instance.resource_type, *to) == 0
        })
    })
}

/// Change in total cleanup distance caused by `effect`'s transitions.
fn cleanup_delta(tracker: &LifecycleTracker<'_>, effect: &Effect) -> i64 {
    effect
        .transitions
        .iter()
        .filter_map(|(id, to)| {
            let instance = tracker.instance(*id).filter(|i| !i.is_external())?;
            let before = tracker.cleanup_distance(&instance.resource_type, instance.state) as i64;
            let after = tracker.cleanup_distance(&instance.resource_type, *to) as i64;
            Some(after - before)
        })
        .sum()
}

fn pick(mut candidates: Vec<Candidate>, rng: &mut ChaCha8Rng) -> Option<Candidate> {
    let total: f64 = candidates.iter().map(|c| c.weight).sum();
    if candidates.is_empty() || !total.is_finite() || total <= 0.0 {
        return None;
    }
    let mut roll = rng.random_range(0.0..total);
    let mut chosen = candidates.len() - 1;
    for (index, candidate) in candidates.iter().enumerate() {
        if roll < candidate.weight {
            chosen = index;
            break;
        }
        roll -= candidate.weight;
    }
    Some(candidates.swap_remove(chosen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LibraryDescriptor;
    use crate::model::{InstanceId, LifecycleState};
    use crate::validator::SequenceValidator;

    const DESCRIPTOR: &str = r#"
library = "toy"

[[resource]]
id = "stream"
states = ["created", "configured", "activated", "closed"]
terminal = ["closed"]
transitions = [
  { from = "created", call = "configure", to = "configured" },
  { from = "configured", call = "activate", to = "activated" },
  { from = "activated", call = "close", to = "closed" },
  { from = "configured", call = "close", to = "closed" },
]

[[resource]]
id = "connection"
states = ["activated", "closed"]
terminal = ["closed"]
transitions = [{ from = "activated", call = "disconnect", to = "closed" }]

[[resource]]
id = "statement"
states = ["created", "freed"]
terminal = ["freed"]
transitions = [{ from = "created", call = "finalize", to = "freed" }]

[[resource]]
id = "buffer"
states = ["usable", "freed"]
terminal = ["freed"]
transitions = [{ from = "usable", call = "release", to = "freed" }]

[[call]]
id = "construct"
result = { kind = "instance", type = "stream", state = "created" }

[[call]]
id = "configure"
params = [
  { kind = "resource", type = "stream", accepts = ["created"], borrow = "mutates" },
  { kind = "scalar", host-type = "int", samples = [1, 9] },
]

[[call]]
id = "activate"
params = [{ kind = "resource", type = "stream", accepts = ["configured"], borrow = "mutates" }]

[[call]]
id = "pending"
params = [{ kind = "resource", type = "stream", accepts = ["activated"], borrow = "borrows" }]
result = { kind = "scalar", host-type = "int" }

[[call]]
id = "close"
params = [{ kind = "resource", type = "stream", accepts = ["configured", "activated"], borrow = "consumes" }]

[[call]]
id = "open"
params = [{ kind = "scalar", host-type = "const char *" }]
result = { kind = "instance", type = "connection", state = "activated" }

[[call]]
id = "prepare"
params = [{ kind = "resource", type = "connection", accepts = ["activated"], borrow = "borrows" }]
result = { kind = "instance", type = "statement", state = "created", owner = 0 }

[[call]]
id = "finalize"
params = [{ kind = "resource", type = "statement", accepts = ["created"], borrow = "consumes" }]

[[call]]
id = "disconnect"
params = [{ kind = "resource", type = "connection", accepts = ["activated"], borrow = "consumes" }]

[[call]]
id = "release"
params = [{ kind = "resource", type = "buffer", accepts = ["usable"], borrow = "consumes" }]
"#;

    fn model() -> Model {
        LibraryDescriptor::from_toml_str(DESCRIPTOR)
            .unwrap()
            .into_model()
            .expect("test descriptor should assemble")
    }

    #[test]
    fn backtracking_forgets_coverage_from_discarded_steps() {
        let model = model();
        let settings = GeneratorSettings::default();
        let scenario = Scenario::new("stream", 2, 7);
        let mut walk = Walk {
            model: &model,
            settings: &settings,
            scenario: &scenario,
            lineage: lineage(&model, &scenario.target),
            base_coverage: TransitionCoverage::new(),
            coverage: TransitionCoverage::new(),
            calls: Vec::new(),
            cleanup_bias: settings.cleanup_bias,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(scenario.seed);
        let mut tracker = walk.replay().unwrap();
        walk.run(&mut tracker, &mut rng);
        assert!(walk.calls.len() > 1);
        assert!(walk.coverage.transition_count() > 0);

        // Only the constructor survives; it takes no transition.
        walk.calls.truncate(1);
        walk.replay().unwrap();
        let mut expected = TransitionCoverage::new();
        expected.record_sequence(&model, &Sequence::new(walk.calls.clone()));
        assert_eq!(walk.coverage, expected);
        assert_eq!(walk.coverage.transition_count(), 0);
        assert_eq!(walk.coverage.state_count(), 1);
    }

    #[test]
    fn generated_sequences_validate_for_every_producible_type() {
        let model = model();
        let mut generator = SequenceGenerator::new(&model, GeneratorSettings::default());
        for target in ["stream", "connection", "statement"] {
            for seed in 0..8 {
                let sequence = generator
                    .generate(&Scenario::new(target, 6, seed))
                    .unwrap_or_else(|e| panic!("{target} seed {seed}: {e}"));
                assert_eq!(SequenceValidator::new(&model).validate(&sequence), Ok(()));
                assert!(sequence.len() >= 6, "operate budget not honoured");
                assert!(
                    sequence.calls.iter().all(|call| call.hints.is_some()),
                    "every invocation carries render hints"
                );
            }
        }
    }

    #[test]
    fn statement_sequences_open_a_connection_and_finalize_before_disconnecting() {
        let model = model();
        let mut generator = SequenceGenerator::new(&model, GeneratorSettings::default());
        let sequence = generator.generate(&Scenario::new("statement", 0, 3)).unwrap();

        let position = |call: &str| sequence.calls.iter().position(|c| c.call.as_str() == call);
        let prepare = position("prepare").expect("target must be produced");
        assert!(position("open").is_some_and(|open| open < prepare));
        let tracker = SequenceValidator::new(&model).walk(&sequence).unwrap();
        assert_eq!(tracker.live_instances().count(), 0);
    }

    #[test]
    fn same_seed_gives_the_same_sequence() {
        let model = model();
        let scenario = Scenario::new("statement", 10, 1234);
        let first = SequenceGenerator::new(&model, GeneratorSettings::default())
            .generate(&scenario)
            .unwrap();
        let second = SequenceGenerator::new(&model, GeneratorSettings::default())
            .generate(&scenario)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_and_unproducible_targets_are_rejected_up_front() {
        let model = model();
        let mut generator = SequenceGenerator::new(&model, GeneratorSettings::default());
        assert_eq!(
            generator.generate(&Scenario::new("socket", 4, 0)),
            Err(GenerationError::UnknownTarget(ResourceTypeId::new("socket")))
        );
        assert_eq!(
            generator.generate(&Scenario::new("buffer", 4, 0)),
            Err(GenerationError::NoProducer(ResourceTypeId::new("buffer")))
        );
    }

    #[test]
    fn tiny_step_budget_exhausts_instead_of_returning_a_partial_sequence() {
        let model = model();
        let settings = GeneratorSettings {
            step_budget: 1,
            max_retries: 2,
            ..GeneratorSettings::default()
        };
        let mut generator = SequenceGenerator::new(&model, settings);
        assert_eq!(
            generator.generate(&Scenario::new("statement", 0, 9)),
            Err(GenerationError::GenerationExhausted {
                target: ResourceTypeId::new("statement"),
                attempts: 3
            })
        );
    }

    #[test]
    fn external_instances_are_used_but_never_released() {
        let model = model();
        let scenario = Scenario::new("stream", 4, 5).with_external(ExternalInstance {
            id: InstanceId(0),
            resource_type: ResourceTypeId::new("buffer"),
            state: LifecycleState::Usable,
            host_type: Some("char *".to_string()),
        });
        let sequence = SequenceGenerator::new(&model, GeneratorSettings::default())
            .generate(&scenario)
            .unwrap();
        assert_eq!(sequence.external.len(), 1);
        assert!(sequence.calls.iter().all(|c| c.call.as_str() != "release"));
        assert!(sequence.calls.iter().all(|c| c.produces != Some(InstanceId(0))));
        assert_eq!(SequenceValidator::new(&model).validate(&sequence), Ok(()));
    }

    #[test]
    fn coverage_accumulates_across_runs_of_one_generator() {
        let model = model();
        let mut generator = SequenceGenerator::new(&model, GeneratorSettings::default());
        generator.generate(&Scenario::new("stream", 4, 0)).unwrap();
        let after_first = generator.coverage().transition_count();
        assert!(after_first > 0);
        generator.generate(&Scenario::new("statement", 4, 1)).unwrap();
        assert!(generator.coverage().transition_count() >= after_first);
    }

    #[test]
    fn scenarios_parse_from_toml_with_defaults() {
        let scenario: Scenario = toml::from_str(r#"target = "statement""#).unwrap();
        assert_eq!(scenario.operate_budget, default_operate_budget());
        assert_eq!(scenario.seed, 0);
        assert!(scenario.external.is_empty());
    }
}
