//! Timing of generation steps.

use std::time::Duration;

/// Step timings for a generation loop.
///
/// The first step processes the whole prompt and is recorded separately as
/// the _prompt_ step. Every later step decodes one token per row and is a
/// _decode_ step. Rates exclude the prompt step.
///
/// This is filled in by [`GeneratorUtils::profile`](crate::GeneratorUtils::profile).
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    prompt: Option<Duration>,
    decode: Vec<Duration>,

    /// Tokens produced by decode steps, summed over rows.
    decode_tokens: usize,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    /// Record a step that took `duration` and produced `tokens` tokens
    /// across all rows.
    pub fn add_step(&mut self, duration: Duration, tokens: usize) {
        if self.prompt.is_none() {
            self.prompt = Some(duration);
        } else {
            self.decode.push(duration);
            self.decode_tokens += tokens;
        }
    }

    /// Duration of the prompt step, if any step has run.
    pub fn prompt_duration(&self) -> Option<Duration> {
        self.prompt
    }

    pub fn step_durations(&self) -> &[Duration] {
        &self.decode
    }

    /// Total time across all steps, including the prompt step.
    pub fn total_duration(&self) -> Duration {
        self.total_decode_duration() + self.prompt.unwrap_or(Duration::ZERO)
    }

    pub fn total_decode_duration(&self) -> Duration {
        self.decode.iter().sum()
    }

    /// Mean decode step time in milliseconds. NaN if no decode step has run.
    pub fn mean_duration(&self) -> f32 {
        let total_ms = self.total_decode_duration().as_secs_f64() * 1000.0;
        (total_ms / self.decode.len() as f64) as f32
    }

    /// Tokens produced per second by decode steps, summed over rows.
    pub fn tokens_per_second(&self) -> f32 {
        self.decode_tokens as f32 / self.total_decode_duration().as_secs_f32()
    }
}
