//! Placement policy structures.
//!
//! A [`PlacementRule`] is the parsed form of a policy such as
//! `REP 2 IN X CBF 1 SELECT 2 FROM * AS X`. Parsing lives in `reef-placement`;
//! this module only holds the data and its canonical rendering, so that a
//! [`Container`](crate::Container) can carry its rule.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Filter name that matches every node.
pub const ANY_FILTER: &str = "*";

/// A complete placement policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRule {
    /// Replica descriptors; each one requires `count` copies.
    pub replicas: Vec<Replica>,
    /// Container backup factor (`CBF`), as written in the policy.
    pub backup_factor: Option<u32>,
    /// Node selectors.
    pub selectors: Vec<Selector>,
    /// Named node filters.
    pub filters: Vec<Filter>,
}

impl PlacementRule {
    /// Backup factor used for resolution: the written one, or 1.
    pub fn effective_backup_factor(&self) -> u32 {
        self.backup_factor.unwrap_or(1).max(1)
    }

    /// Total number of copies required across all replica descriptors.
    pub fn required_copies(&self) -> u32 {
        self.replicas.iter().map(|r| r.count).sum()
    }

    /// Look a selector up by name.
    pub fn selector(&self, name: &str) -> Option<&Selector> {
        self.selectors
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// Look a filter up by name.
    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name == name)
    }

    /// Render the rule one clause per line.
    pub fn to_multiline(&self) -> String {
        self.clauses().join("\n")
    }

    fn clauses(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(
            self.replicas.len() + self.selectors.len() + self.filters.len() + 1,
        );
        out.extend(self.replicas.iter().map(ToString::to_string));
        if let Some(cbf) = self.backup_factor {
            out.push(format!("CBF {cbf}"));
        }
        out.extend(self.selectors.iter().map(ToString::to_string));
        out.extend(self.filters.iter().map(ToString::to_string));
        out
    }
}

impl fmt::Display for PlacementRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clauses().join(" "))
    }
}

/// `REP count [IN selector]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Number of copies.
    pub count: u32,
    /// Selector supplying the nodes; all selectors when absent.
    pub selector: Option<String>,
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "REP {}", self.count)?;
        if let Some(sel) = &self.selector {
            write!(f, " IN {sel}")?;
        }
        Ok(())
    }
}

/// How a selector treats the attribute it groups by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Clause {
    /// No constraint between selected nodes.
    #[default]
    Unspecified,
    /// All selected nodes share the attribute value.
    Same,
    /// Selected nodes have pairwise distinct attribute values.
    Distinct,
}

/// `SELECT count [IN [SAME|DISTINCT] attribute] FROM filter [AS name]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Minimum number of nodes the selector must yield.
    pub count: u32,
    /// Attribute clause.
    pub clause: Clause,
    /// Attribute the clause applies to.
    pub attribute: Option<String>,
    /// Filter name, or [`ANY_FILTER`].
    pub filter: String,
    /// Name referenced by `REP ... IN name`.
    pub name: Option<String>,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", self.count)?;
        if let Some(attr) = &self.attribute {
            match self.clause {
                Clause::Unspecified => write!(f, " IN {attr}")?,
                Clause::Same => write!(f, " IN SAME {attr}")?,
                Clause::Distinct => write!(f, " IN DISTINCT {attr}")?,
            }
        }
        write!(f, " FROM {}", self.filter)?;
        if let Some(name) = &self.name {
            write!(f, " AS {name}")?;
        }
        Ok(())
    }
}

/// `FILTER expr AS name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Name referenced by `SELECT ... FROM name`.
    pub name: String,
    /// Predicate over node attributes.
    pub expr: FilterExpr,
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FILTER {} AS {}", self.expr, self.name)
    }
}

/// Comparison operators usable in filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// String equality.
    Eq,
    /// String inequality.
    Ne,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Ge,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Le,
}

impl Operation {
    /// Policy keyword for this operation.
    pub fn keyword(self) -> &'static str {
        match self {
            Operation::Eq => "EQ",
            Operation::Ne => "NE",
            Operation::Gt => "GT",
            Operation::Ge => "GE",
            Operation::Lt => "LT",
            Operation::Le => "LE",
        }
    }

    /// Parse a keyword, case-insensitively.
    pub fn from_keyword(word: &str) -> Option<Self> {
        [
            Operation::Eq,
            Operation::Ne,
            Operation::Gt,
            Operation::Ge,
            Operation::Lt,
            Operation::Le,
        ]
        .into_iter()
        .find(|op| op.keyword().eq_ignore_ascii_case(word))
    }

    fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            Operation::Eq => actual == expected,
            Operation::Ne => actual != expected,
            _ => {
                // Numeric comparisons never match non-numeric values.
                let (Ok(a), Ok(e)) = (actual.parse::<u64>(), expected.parse::<u64>()) else {
                    return false;
                };
                match self {
                    Operation::Gt => a > e,
                    Operation::Ge => a >= e,
                    Operation::Lt => a < e,
                    _ => a <= e,
                }
            }
        }
    }
}

/// Predicate over node attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterExpr {
    /// `key OP value`.
    Compare {
        /// Attribute name.
        key: String,
        /// Operator.
        op: Operation,
        /// Value compared against.
        value: String,
    },
    /// All sub-expressions hold.
    And(Vec<FilterExpr>),
    /// At least one sub-expression holds.
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Evaluate against a node's attributes. A missing key never matches.
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            FilterExpr::Compare { key, op, value } => attributes
                .get(key)
                .is_some_and(|actual| op.apply(actual, value)),
            FilterExpr::And(exprs) => exprs.iter().all(|e| e.matches(attributes)),
            FilterExpr::Or(exprs) => exprs.iter().any(|e| e.matches(attributes)),
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::Compare { key, op, value } => {
                write!(f, "{key} {} ", op.keyword())?;
                if value.is_empty() || value.contains(char::is_whitespace) {
                    write!(f, "\"{value}\"")
                } else {
                    f.write_str(value)
                }
            }
            FilterExpr::And(exprs) => {
                for (i, expr) in exprs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" AND ")?;
                    }
                    if matches!(expr, FilterExpr::Or(_)) {
                        write!(f, "({expr})")?;
                    } else {
                        write!(f, "{expr}")?;
                    }
                }
                Ok(())
            }
            FilterExpr::Or(exprs) => {
                for (i, expr) in exprs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" OR ")?;
                    }
                    write!(f, "{expr}")?;
                }
                Ok(())
            }
        }
    }
}
