//! Comparisons against live values and the ways to combine them.

use serde::{Deserialize, Serialize};

/// Tolerance for `==` and `!=`.
pub const EQUALITY_EPSILON: f32 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Operator {
    pub fn compare(self, lhs: f32, rhs: f32) -> bool {
        match self {
            Operator::Less => lhs < rhs,
            Operator::LessOrEqual => lhs <= rhs,
            Operator::Greater => lhs > rhs,
            Operator::GreaterOrEqual => lhs >= rhs,
            Operator::Equal => (lhs - rhs).abs() < EQUALITY_EPSILON,
            Operator::NotEqual => (lhs - rhs).abs() >= EQUALITY_EPSILON,
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Name looked up through the value resolver; may carry a target prefix.
    pub dataref: String,
    pub operator: Operator,
    pub value: f32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl Condition {
    pub fn new(dataref: &str, operator: Operator, value: f32) -> Self {
        Self {
            dataref: dataref.to_string(),
            operator,
            value,
            enabled: true,
        }
    }

    /// `None` when the referenced value is unknown.
    pub fn evaluate(&self, lookup: impl Fn(&str) -> Option<f32>) -> Option<bool> {
        lookup(&self.dataref).map(|v| self.operator.compare(v, self.value))
    }
}

/// How an input mapping combines its conditions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// Gate of a logic block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicGate {
    #[default]
    And,
    Or,
    Nand,
    Nor,
    Xor,
    Xnor,
}

impl LogicGate {
    pub fn combine(self, results: &[bool]) -> bool {
        let all = results.iter().all(|&r| r);
        let any = results.iter().any(|&r| r);
        let odd = results.iter().filter(|&&r| r).count() % 2 == 1;
        match self {
            LogicGate::And => all,
            LogicGate::Or => any,
            LogicGate::Nand => !all,
            LogicGate::Nor => !any,
            LogicGate::Xor => odd,
            LogicGate::Xnor => !odd,
        }
    }
}

/// Evaluate the enabled conditions of an input mapping. No enabled
/// conditions passes; any unknown value fails the whole set.
pub fn conditions_pass(
    conditions: &[Condition],
    logic: ConditionLogic,
    lookup: impl Fn(&str) -> Option<f32>,
) -> bool {
    let mut results = Vec::with_capacity(conditions.len());
    for cond in conditions.iter().filter(|c| c.enabled) {
        match cond.evaluate(&lookup) {
            Some(r) => results.push(r),
            None => return false,
        }
    }
    if results.is_empty() {
        return true;
    }
    match logic {
        ConditionLogic::And => results.iter().all(|&r| r),
        ConditionLogic::Or => results.iter().any(|&r| r),
    }
}

/// Evaluate every enabled condition, or `None` if one references an unknown value.
pub fn evaluate_each(
    conditions: &[Condition],
    lookup: impl Fn(&str) -> Option<f32>,
) -> Option<Vec<bool>> {
    conditions
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.evaluate(&lookup))
        .collect()
}
