//! Vote fusion across the models that answered in time.

use serde::{Deserialize, Serialize};

use crate::strategy::{Action, ModelSignal};

const SCORE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FusionPolicy {
    /// Highest `Σ weight × confidence` per action wins; ties go flat.
    #[default]
    ConfidenceWeighted,
    /// Highest `Σ weight` per action wins; confidence from the winners' scores.
    MajorityVote,
    /// Signed weighted mean of confidences; the sign picks the side.
    WeightedAverage,
}

#[derive(Debug, Clone)]
pub struct Vote {
    pub weight: f64,
    pub signal: ModelSignal,
}

#[derive(Default)]
struct Tally {
    long: f64,
    short: f64,
    flat: f64,
}

impl Tally {
    fn add(&mut self, action: Action, amount: f64) {
        match action {
            Action::Long => self.long += amount,
            Action::Short => self.short += amount,
            Action::Flat => self.flat += amount,
        }
    }

    fn get(&self, action: Action) -> f64 {
        match action {
            Action::Long => self.long,
            Action::Short => self.short,
            Action::Flat => self.flat,
        }
    }

    /// Unique top action, or `None` when the top score is shared.
    fn winner(&self) -> Option<Action> {
        let entries = [
            (Action::Long, self.long),
            (Action::Short, self.short),
            (Action::Flat, self.flat),
        ];
        let top = entries.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
        let mut leaders = entries.iter().filter(|(_, s)| (top - s).abs() <= SCORE_EPSILON);
        let first = leaders.next().map(|(a, _)| *a);
        if leaders.next().is_some() {
            None
        } else {
            first
        }
    }
}

/// Fuses the votes into one action and a confidence in `[0, 1]`.
///
/// An empty vote set, or one whose weights sum to zero, is flat with no confidence.
pub fn fuse(policy: FusionPolicy, votes: &[Vote]) -> (Action, f64) {
    let total_weight: f64 = votes.iter().map(|v| v.weight.max(0.0)).sum();
    if votes.is_empty() || total_weight <= 0.0 {
        return (Action::Flat, 0.0);
    }

    let mut scores = Tally::default();
    let mut counts = Tally::default();
    for vote in votes {
        let weight = vote.weight.max(0.0);
        scores.add(vote.signal.action, weight * vote.signal.confidence);
        counts.add(vote.signal.action, weight);
    }

    let (action, confidence) = match policy {
        FusionPolicy::ConfidenceWeighted => {
            let action = scores.winner().unwrap_or(Action::Flat);
            (action, scores.get(action) / total_weight)
        }
        FusionPolicy::MajorityVote => {
            let action = counts.winner().unwrap_or(Action::Flat);
            (action, scores.get(action) / total_weight)
        }
        FusionPolicy::WeightedAverage => {
            let direction = (scores.long - scores.short) / total_weight;
            if direction > SCORE_EPSILON {
                (Action::Long, direction)
            } else if direction < -SCORE_EPSILON {
                (Action::Short, -direction)
            } else {
                (Action::Flat, scores.flat / total_weight)
            }
        }
    };

    (action, confidence.clamp(0.0, 1.0))
}
