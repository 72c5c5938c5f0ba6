//! Condition Evaluation

use crate::sql::planner::{Condition, ConditionOperator, ConditionToken, ConditionValue, LogicalOperator};
use crate::storage::{Row, ScalarValue};
use std::cmp::Ordering;

/// Fold a flattened WHERE chain over one row.
///
/// Left to right with no precedence; every condition is evaluated. The chain
/// starts with an implicit AND and a logical token only affects the next
/// pairing.
pub fn evaluate_conditions(tokens: &[ConditionToken], row: &Row) -> bool {
    let mut result = true;
    let mut combinator = LogicalOperator::And;
    for token in tokens {
        match token {
            ConditionToken::Logical(op) => combinator = *op,
            ConditionToken::Condition(condition) => {
                let matched = evaluate_condition(condition, row);
                result = match combinator {
                    LogicalOperator::And => result && matched,
                    LogicalOperator::Or => result || matched,
                };
                combinator = LogicalOperator::And;
            }
        }
    }
    result
}

/// A comparison involving a missing value is false, except `IS NULL`.
pub fn evaluate_condition(condition: &Condition, row: &Row) -> bool {
    let actual = row.get(&condition.field);
    match condition.operator {
        ConditionOperator::IsNull => return actual.is_missing(),
        ConditionOperator::IsNotNull => return !actual.is_missing(),
        _ if actual.is_missing() => return false,
        _ => {}
    }

    match &condition.value {
        ConditionValue::None => false,
        ConditionValue::List(list) => {
            let found = list
                .iter()
                .any(|candidate| !candidate.is_missing() && actual.loose_eq(candidate));
            match condition.operator {
                ConditionOperator::In => found,
                ConditionOperator::NotIn => !found,
                _ => false,
            }
        }
        ConditionValue::Scalar(expected) => {
            if expected.is_missing() {
                return false;
            }
            compare(condition.operator, actual, expected)
        }
    }
}

fn compare(operator: ConditionOperator, actual: &ScalarValue, expected: &ScalarValue) -> bool {
    match operator {
        ConditionOperator::Eq => actual.loose_eq(expected),
        ConditionOperator::NotEq => !actual.loose_eq(expected),
        ConditionOperator::Gt => actual.partial_compare(expected) == Some(Ordering::Greater),
        ConditionOperator::GtEq => matches!(
            actual.partial_compare(expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lt => actual.partial_compare(expected) == Some(Ordering::Less),
        ConditionOperator::LtEq => matches!(
            actual.partial_compare(expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOperator::Like => like_match(&actual.as_text(), &expected.as_text()),
        ConditionOperator::NotLike => !like_match(&actual.as_text(), &expected.as_text()),
        ConditionOperator::In
        | ConditionOperator::NotIn
        | ConditionOperator::IsNull
        | ConditionOperator::IsNotNull => false,
    }
}

/// Case-insensitive LIKE with `%` (any run) and `_` (one character).
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();

    let (mut t, mut p) = (0, 0);
    // Last `%` seen and the text position it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || (pattern[p] != '%' && pattern[p] == text[t])) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, absorbed)) = backtrack {
            p = star + 1;
            t = absorbed + 1;
            backtrack = Some((star, t));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(field: &str, operator: ConditionOperator, value: ConditionValue) -> ConditionToken {
        ConditionToken::Condition(Condition {
            field: field.into(),
            operator,
            value,
        })
    }

    fn scalar(v: impl Into<ScalarValue>) -> ConditionValue {
        ConditionValue::Scalar(v.into())
    }

    #[test]
    fn test_like() {
        assert!(like_match("Spring Sale", "spring%"));
        assert!(like_match("Spring Sale", "%SALE"));
        assert!(like_match("abc", "a_c"));
        assert!(like_match("abc", "%"));
        assert!(like_match("", "%"));
        assert!(!like_match("abc", "a_"));
        assert!(like_match("aXbXc", "a%b%c"));
        assert!(!like_match("abd", "a%c"));
    }

    #[test]
    fn test_left_to_right_without_precedence() {
        // a OR b AND c == (a OR b) AND c
        let row = Row::new().with("a", 1).with("b", 0).with("c", 0);
        let tokens = vec![
            cond("a", ConditionOperator::Eq, scalar(1)),
            ConditionToken::Logical(LogicalOperator::Or),
            cond("b", ConditionOperator::Eq, scalar(1)),
            ConditionToken::Logical(LogicalOperator::And),
            cond("c", ConditionOperator::Eq, scalar(1)),
        ];
        assert!(!evaluate_conditions(&tokens, &row));
    }

    #[test]
    fn test_missing_values() {
        let row = Row::new().with("a", "").with("b", 3);
        assert!(!evaluate_conditions(&[cond("a", ConditionOperator::NotEq, scalar(1))], &row));
        assert!(evaluate_conditions(
            &[cond("a", ConditionOperator::IsNull, ConditionValue::None)],
            &row
        ));
        assert!(evaluate_conditions(
            &[cond("missing", ConditionOperator::IsNull, ConditionValue::None)],
            &row
        ));
        assert!(!evaluate_conditions(
            &[cond("b", ConditionOperator::IsNull, ConditionValue::None)],
            &row
        ));
    }

    #[test]
    fn test_loose_comparisons() {
        let row = Row::new().with("total", "150").with("name", "beta");
        assert!(evaluate_conditions(&[cond("total", ConditionOperator::Gt, scalar(100))], &row));
        assert!(evaluate_conditions(&[cond("total", ConditionOperator::Eq, scalar(150.0))], &row));
        assert!(evaluate_conditions(&[cond("name", ConditionOperator::Gt, scalar("alpha"))], &row));
        assert!(evaluate_conditions(
            &[cond(
                "name",
                ConditionOperator::NotIn,
                ConditionValue::List(vec!["alpha".into(), "gamma".into()])
            )],
            &row
        ));
    }

    #[test]
    fn test_empty_chain_matches() {
        assert!(evaluate_conditions(&[], &Row::new()));
    }
}
