//! Requirement matching and candidate ranking.
//!
//! [`Matcher::matches`] answers whether an environment can run a case at
//! all; [`Matcher::score`] ranks the environments that can. Scores are
//! zero for an exact fit and negative for everything else:
//!
//! ```text
//! score = - excess_nodes × excess_node_penalty
//!         - Σ (capability − bound) × excess_resource_penalty
//!               for each `uses` / `min` on the conjunctive spine
//! ```
//!
//! Higher is better. Ties go to the lower environment id, so ranking is
//! deterministic.

use crate::capability::Capabilities;
use crate::config::ScoringConfig;
use crate::environment::{Environment, EnvironmentId};
use crate::requirement::{Predicate, Requirement};

/// Evaluates requirements against environments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Matcher {
    scoring: ScoringConfig,
}

impl Matcher {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }

    /// Whether `env` satisfies `requirement`. Environments that have not
    /// been prepared have no inventory and never match.
    pub fn matches(&self, requirement: &Requirement, env: &Environment) -> bool {
        match env.capabilities() {
            Some(caps) => requirement.is_satisfied(env.node_count(), caps),
            None => false,
        }
    }

    /// Rank of `env` for `requirement`, or `None` if it does not match.
    pub fn score(&self, requirement: &Requirement, env: &Environment) -> Option<f64> {
        let caps = env.capabilities()?;
        self.score_inventory(requirement, env.node_count(), caps)
    }

    /// Rank of a bare inventory, for candidates that are not environments
    /// yet (provisioning templates).
    pub fn score_inventory(
        &self,
        requirement: &Requirement,
        node_count: usize,
        caps: &Capabilities,
    ) -> Option<f64> {
        if !requirement.is_satisfied(node_count, caps) {
            return None;
        }

        let excess_nodes = node_count.saturating_sub(requirement.node_count()) as f64;
        let mut score = -excess_nodes * self.scoring.excess_node_penalty;

        for predicate in requirement.conjunctive_spine() {
            let (name, bound) = match predicate {
                Predicate::Uses { name, amount } => (name, *amount),
                Predicate::Min { name, value } => (name, *value),
                _ => continue,
            };
            if let Some(actual) = caps.query(name).and_then(|v| v.as_f64()) {
                score -= (actual - bound).max(0.0) * self.scoring.excess_resource_penalty;
            }
        }

        Some(score)
    }

    /// Picks the best candidate: highest score, then lowest id.
    pub fn best<'a, I>(&self, requirement: &Requirement, candidates: I) -> Option<&'a Environment>
    where
        I: IntoIterator<Item = &'a Environment>,
    {
        candidates
            .into_iter()
            .filter_map(|env| self.score(requirement, env).map(|s| (s, env.id(), env)))
            .fold(None, |best: Option<(f64, EnvironmentId, &'a Environment)>, cand| match best {
                Some(b) if better(b.0, b.1, cand.0, cand.1) => Some(b),
                _ => Some(cand),
            })
            .map(|(_, _, env)| env)
    }
}

/// Whether candidate `a` ranks strictly ahead of `b`.
pub(crate) fn better(a_score: f64, a_id: EnvironmentId, b_score: f64, b_id: EnvironmentId) -> bool {
    a_score > b_score || (a_score == b_score && a_id < b_id)
}
