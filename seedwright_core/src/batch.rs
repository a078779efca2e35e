use crate::descriptor::Model;
use crate::generator::{GenerationError, GeneratorSettings, Scenario, SequenceGenerator};
use crate::sequence::Sequence;
use std::thread;

pub type GenerationResult = Result<Sequence, GenerationError>;

/// Generates every scenario on up to `threads` scoped workers sharing `model`.
///
/// Each scenario gets a fresh generator so that results are returned in
/// scenario order and do not depend on the thread count.
pub fn generate_batch(
    model: &Model,
    settings: &GeneratorSettings,
    scenarios: &[Scenario],
    threads: usize,
) -> Vec<GenerationResult> {
    let workers = threads.clamp(1, scenarios.len().max(1));
    tracing::info!(
        scenarios = scenarios.len(),
        workers,
        library = model.library(),
        "starting generation batch"
    );

    let mut results: Vec<(usize, GenerationResult)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                scope.spawn(move || {
                    scenarios
                        .iter()
                        .enumerate()
                        .skip(worker)
                        .step_by(workers)
                        .map(|(index, scenario)| {
                            let mut generator = SequenceGenerator::new(model, settings.clone());
                            (index, generator.generate(scenario))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(results) => results,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });
    results.sort_by_key(|(index, _)| *index);

    let failed = results.iter().filter(|(_, result)| result.is_err()).count();
    tracing::info!(
        generated = results.len() - failed,
        failed,
        "generation batch finished"
    );
    results.into_iter().map(|(_, result)| result).collect()
}

/// `count` scenarios for `target`, with consecutive seeds starting at `seed`.
pub fn scenarios_for(target: &str, count: usize, operate_budget: usize, seed: u64) -> Vec<Scenario> {
    (0..count as u64)
        .map(|offset| Scenario::new(target, operate_budget, seed.wrapping_add(offset)))
        .collect()
}
