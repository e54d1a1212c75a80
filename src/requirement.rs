//! Requirements: what a test case needs from an environment.
//!
//! A [`Requirement`] is an optional node count plus a conjunction of
//! [`Predicate`]s over capability names. Predicates form a small typed
//! tree and are evaluated by pure functions; nothing here performs I/O.
//!
//! # Predicate Kinds
//!
//! | `op` | Fields | Satisfied when |
//! |------|--------|----------------|
//! | `eq` | `name`, `value` | capability equals `value` |
//! | `min` | `name`, `value` | numeric capability ≥ `value` |
//! | `max` | `name`, `value` | numeric capability ≤ `value` |
//! | `uses` | `name`, `amount` | numeric capability ≥ `amount`; the rest is unused |
//! | `one_of` | `name`, `values` | capability is one of `values` |
//! | `contains` | `name`, `value` | list capability contains `value` |
//! | `flag` | `name`, `value` (default `true`) | boolean capability equals `value` |
//! | `all` | `of` | every nested predicate holds |
//! | `any` | `of` | some nested predicate holds |
//! | `not` | `predicate` | nested predicate does not hold |
//!
//! # Unknown Capabilities
//!
//! A predicate over a capability the inventory does not know is neither
//! true nor false. Unknown propagates through `not` and the combinators
//! (three-valued logic) and the requirement as a whole treats it as not
//! satisfied. So `not(eq os windows)` does not match an environment whose
//! OS was never determined.
//!
//! # Example
//!
//! ```toml
//! [[case]]
//! id = "smoke.sriov"
//! command = "./check-sriov.sh"
//!
//! [case.requirement]
//! nodes = 2
//!
//! [[case.requirement.predicate]]
//! op = "eq"
//! name = "os"
//! value = "linux"
//!
//! [[case.requirement.predicate]]
//! op = "uses"
//! name = "cores"
//! amount = 2
//! ```

use serde::{Deserialize, Serialize};

use crate::capability::{Capabilities, CapabilityValue};

/// What a test case needs from its environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    /// Minimum number of nodes. `None` means one node is enough.
    #[serde(default)]
    pub nodes: Option<usize>,

    /// Predicates that must all hold.
    #[serde(default, rename = "predicate")]
    pub predicates: Vec<Predicate>,
}

impl Requirement {
    /// A requirement every environment satisfies.
    pub fn any() -> Self {
        Self::default()
    }

    /// Sets the node count.
    pub fn nodes(mut self, count: usize) -> Self {
        self.nodes = Some(count);
        self
    }

    /// Adds a predicate.
    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Number of nodes the requirement asks for.
    pub fn node_count(&self) -> usize {
        self.nodes.unwrap_or(1)
    }

    /// Evaluates the requirement against an inventory.
    ///
    /// Node count fails first: an environment with fewer nodes never
    /// matches, whatever its capabilities.
    pub fn is_satisfied(&self, node_count: usize, caps: &Capabilities) -> bool {
        if node_count < self.node_count() {
            return false;
        }
        self.predicates
            .iter()
            .all(|p| p.evaluate(caps) == Some(true))
    }

    /// Predicates reachable through conjunctions only (top level and
    /// nested `all`). Only these can be scored for excess.
    pub fn conjunctive_spine(&self) -> Vec<&Predicate> {
        let mut spine = Vec::new();
        let mut stack: Vec<&Predicate> = self.predicates.iter().rev().collect();
        while let Some(p) = stack.pop() {
            match p {
                Predicate::All { of } => stack.extend(of.iter().rev()),
                other => spine.push(other),
            }
        }
        spine
    }
}

/// A single condition on a capability, or a combination of conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq {
        name: String,
        value: CapabilityValue,
    },
    Min {
        name: String,
        value: f64,
    },
    Max {
        name: String,
        value: f64,
    },
    /// Resource demand. Capacity beyond `amount` counts against the score.
    Uses {
        name: String,
        amount: f64,
    },
    OneOf {
        name: String,
        values: Vec<CapabilityValue>,
    },
    Contains {
        name: String,
        value: String,
    },
    Flag {
        name: String,
        #[serde(default = "default_flag")]
        value: bool,
    },
    All {
        of: Vec<Predicate>,
    },
    Any {
        of: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

fn default_flag() -> bool {
    true
}

impl Predicate {
    pub fn eq(name: impl Into<String>, value: impl Into<CapabilityValue>) -> Self {
        Predicate::Eq {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn min(name: impl Into<String>, value: f64) -> Self {
        Predicate::Min {
            name: name.into(),
            value,
        }
    }

    pub fn max(name: impl Into<String>, value: f64) -> Self {
        Predicate::Max {
            name: name.into(),
            value,
        }
    }

    pub fn uses(name: impl Into<String>, amount: f64) -> Self {
        Predicate::Uses {
            name: name.into(),
            amount,
        }
    }

    pub fn one_of<V: Into<CapabilityValue>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Predicate::OneOf {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(name: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Contains {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Predicate::Flag {
            name: name.into(),
            value: true,
        }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Three-valued evaluation: `None` when a capability involved is
    /// unknown or has the wrong type.
    pub fn evaluate(&self, caps: &Capabilities) -> Option<bool> {
        match self {
            Predicate::Eq { name, value } => {
                let actual = caps.query(name)?;
                Some(values_equal(actual, value))
            }
            Predicate::Min { name, value } => Some(caps.query(name)?.as_f64()? >= *value),
            Predicate::Max { name, value } => Some(caps.query(name)?.as_f64()? <= *value),
            Predicate::Uses { name, amount } => Some(caps.query(name)?.as_f64()? >= *amount),
            Predicate::OneOf { name, values } => {
                let actual = caps.query(name)?;
                Some(values.iter().any(|v| values_equal(actual, v)))
            }
            Predicate::Contains { name, value } => {
                Some(caps.query(name)?.as_list()?.iter().any(|item| item == value))
            }
            Predicate::Flag { name, value } => Some(caps.query(name)?.as_bool()? == *value),
            Predicate::All { of } => {
                let mut unknown = false;
                for p in of {
                    match p.evaluate(caps) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown { None } else { Some(true) }
            }
            Predicate::Any { of } => {
                let mut unknown = false;
                for p in of {
                    match p.evaluate(caps) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown { None } else { Some(false) }
            }
            Predicate::Not { predicate } => predicate.evaluate(caps).map(|b| !b),
        }
    }
}

/// Equality that treats `4` and `4.0` as the same number.
fn values_equal(a: &CapabilityValue, b: &CapabilityValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
