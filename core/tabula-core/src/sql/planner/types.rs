//! Query representation
//!
//! `Query` is what the parser produces and the executor consumes. It is
//! built once per distinct query text and shared immutably.

use crate::storage::ScalarValue;
use std::fmt;

/// Parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub fields: Vec<SelectField>,
    pub table: String,
    /// WHERE clause flattened in source order: condition, operator, condition, ...
    pub conditions: Vec<ConditionToken>,
    /// Empty when there is no GROUP BY
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn has_aggregates(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f, SelectField::Aggregate { .. }))
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || self.has_aggregates()
    }

    /// Every source field the query reads, in first-mention order.
    pub fn source_fields(&self) -> Vec<&str> {
        fn push<'a>(name: &'a str, out: &mut Vec<&'a str>) {
            if !out.contains(&name) {
                out.push(name);
            }
        }

        let mut out: Vec<&str> = Vec::new();
        for field in &self.fields {
            match field {
                SelectField::Wildcard => {}
                SelectField::Field { name, .. } => push(name, &mut out),
                SelectField::Aggregate { target, .. } => {
                    if let AggregateTarget::Field(name) = target {
                        push(name, &mut out);
                    }
                }
            }
        }
        for token in &self.conditions {
            if let ConditionToken::Condition(condition) = token {
                push(&condition.field, &mut out);
            }
        }
        for name in &self.group_by {
            push(name, &mut out);
        }
        out
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter().filter_map(|token| match token {
            ConditionToken::Condition(c) => Some(c),
            ConditionToken::Logical(_) => None,
        })
    }
}

/// One entry of the select list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectField {
    /// `*`
    Wildcard,
    Field {
        name: String,
        alias: Option<String>,
    },
    Aggregate {
        function: AggregateFunction,
        target: AggregateTarget,
        alias: Option<String>,
    },
}

impl SelectField {
    /// Column name in the result. `None` for `*`.
    pub fn output_name(&self) -> Option<String> {
        match self {
            SelectField::Wildcard => None,
            SelectField::Field { name, alias } => Some(alias.clone().unwrap_or_else(|| name.clone())),
            SelectField::Aggregate {
                function,
                target,
                alias,
            } => Some(alias.clone().unwrap_or_else(|| match target {
                AggregateTarget::Star => function.name().to_string(),
                AggregateTarget::Field(field) => format!("{}_{}", function.name(), field),
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateTarget {
    /// `*`, only valid for COUNT
    Star,
    Field(String),
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    /// Number of distinct non-missing values
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    /// Lower-case name used for default output columns.
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::CountDistinct => "distinct",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// Match a function name case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunction::Count),
            "DISTINCT" => Some(AggregateFunction::CountDistinct),
            "SUM" => Some(AggregateFunction::Sum),
            "AVG" => Some(AggregateFunction::Avg),
            "MIN" => Some(AggregateFunction::Min),
            "MAX" => Some(AggregateFunction::Max),
            _ => None,
        }
    }
}

/// `<field> <operator> <value>`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    /// IS NULL / IS NOT NULL carry no operand
    None,
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionOperator::Eq => "=",
            ConditionOperator::NotEq => "!=",
            ConditionOperator::Gt => ">",
            ConditionOperator::GtEq => ">=",
            ConditionOperator::Lt => "<",
            ConditionOperator::LtEq => "<=",
            ConditionOperator::Like => "LIKE",
            ConditionOperator::NotLike => "NOT LIKE",
            ConditionOperator::In => "IN",
            ConditionOperator::NotIn => "NOT IN",
            ConditionOperator::IsNull => "IS NULL",
            ConditionOperator::IsNotNull => "IS NOT NULL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionToken {
    Condition(Condition),
    Logical(LogicalOperator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY key over an output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}
