//! Target filter expressions.
//!
//! A small RSQL-like language used by rollouts to select their target
//! population:
//!
//! ```text
//! controllerId==rollout-*;attribute.hw==rev2,name==lab-*
//! ```
//!
//! `;` joins comparisons with AND and binds tighter than `,` (OR).
//! Comparisons are `field==pattern` or `field!=pattern`, where `*` in the
//! pattern matches any run of characters.

use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter expression is empty")]
    Empty,

    #[error("comparison `{0}` has no `==` or `!=` operator")]
    MissingOperator(String),

    #[error("unknown filter field `{0}`")]
    UnknownField(String),

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A target property that can be compared in a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterField {
    Id,
    Name,
    Attribute(String),
    AssignedDistribution,
    InstalledDistribution,
    UpdateStatus,
}

impl FilterField {
    fn parse(raw: &str) -> Result<Self, FilterError> {
        match raw {
            "id" | "controllerId" => Ok(Self::Id),
            "name" => Ok(Self::Name),
            "assignedDs" => Ok(Self::AssignedDistribution),
            "installedDs" => Ok(Self::InstalledDistribution),
            "updateStatus" => Ok(Self::UpdateStatus),
            _ => match raw.strip_prefix("attribute.") {
                Some(key) if !key.is_empty() => Ok(Self::Attribute(key.to_string())),
                _ => Err(FilterError::UnknownField(raw.to_string())),
            },
        }
    }
}

/// Anything a filter can be evaluated against.
pub trait Filterable {
    /// Value of `field`, or `None` when the subject does not carry it.
    fn field_value(&self, field: &FilterField) -> Option<&str>;
}

#[derive(Debug, Clone)]
struct Comparison {
    field: FilterField,
    negated: bool,
    pattern: Regex,
}

impl Comparison {
    fn parse(raw: &str) -> Result<Self, FilterError> {
        let (field, negated, pattern) = if let Some((f, p)) = raw.split_once("!=") {
            (f, true, p)
        } else if let Some((f, p)) = raw.split_once("==") {
            (f, false, p)
        } else {
            return Err(FilterError::MissingOperator(raw.to_string()));
        };

        Ok(Self {
            field: FilterField::parse(field.trim())?,
            negated,
            pattern: glob_regex(pattern.trim())?,
        })
    }

    fn matches<T: Filterable + ?Sized>(&self, subject: &T) -> bool {
        let hit = subject
            .field_value(&self.field)
            .is_some_and(|value| self.pattern.is_match(value));
        hit != self.negated
    }
}

/// A parsed filter: a disjunction of conjunctions.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    source: String,
    any_of: Vec<Vec<Comparison>>,
}

impl TargetFilter {
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(FilterError::Empty);
        }

        let any_of = expression
            .split(',')
            .map(|clause| {
                clause
                    .split(';')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(Comparison::parse)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        if any_of.iter().all(Vec::is_empty) {
            return Err(FilterError::Empty);
        }

        Ok(Self {
            source: expression.to_string(),
            any_of,
        })
    }

    pub fn matches<T: Filterable + ?Sized>(&self, subject: &T) -> bool {
        self.any_of
            .iter()
            .filter(|all_of| !all_of.is_empty())
            .any(|all_of| all_of.iter().all(|c| c.matches(subject)))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TargetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Compile a `*` glob into an anchored regex.
fn glob_regex(pattern: &str) -> Result<Regex, FilterError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|e| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Match a SQL `LIKE`-style pattern (`%` wildcard) against a value.
///
/// Used for name filters on rollout listings.
pub fn like_matches(pattern: &str, value: &str) -> bool {
    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).is_ok_and(|re| re.is_match(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Device {
        id: String,
        name: String,
        attributes: HashMap<String, String>,
    }

    impl Filterable for Device {
        fn field_value(&self, field: &FilterField) -> Option<&str> {
            match field {
                FilterField::Id => Some(&self.id),
                FilterField::Name => Some(&self.name),
                FilterField::Attribute(key) => self.attributes.get(key).map(String::as_str),
                _ => None,
            }
        }
    }

    fn device(id: &str, hw: &str) -> Device {
        Device {
            id: id.to_string(),
            name: format!("name-{id}"),
            attributes: HashMap::from([("hw".to_string(), hw.to_string())]),
        }
    }

    #[test]
    fn wildcard_prefix_match() {
        let filter = TargetFilter::parse("controllerId==rollout-*").unwrap();
        assert!(filter.matches(&device("rollout-00001", "a")));
        assert!(!filter.matches(&device("others-00001", "a")));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let filter = TargetFilter::parse("id==a-*;attribute.hw==rev2,id==b-1").unwrap();
        assert!(filter.matches(&device("a-1", "rev2")));
        assert!(!filter.matches(&device("a-1", "rev1")));
        assert!(filter.matches(&device("b-1", "rev1")));
    }

    #[test]
    fn negation_and_missing_field() {
        let filter = TargetFilter::parse("attribute.site!=lab").unwrap();
        // Missing attribute never equals "lab", so the negation holds.
        assert!(filter.matches(&device("x", "rev1")));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let filter = TargetFilter::parse("id==dev.1").unwrap();
        assert!(filter.matches(&device("dev.1", "a")));
        assert!(!filter.matches(&device("devx1", "a")));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(TargetFilter::parse("  ").unwrap_err(), FilterError::Empty);
        assert!(matches!(
            TargetFilter::parse("id=foo"),
            Err(FilterError::MissingOperator(_))
        ));
        assert!(matches!(
            TargetFilter::parse("color==red"),
            Err(FilterError::UnknownField(_))
        ));
    }

    #[test]
    fn like_pattern() {
        assert!(like_matches("Rollout%", "Rollout12"));
        assert!(!like_matches("Rollout%", "SomethingElse1"));
        assert!(like_matches("%else%", "something-else-1"));
    }
}
