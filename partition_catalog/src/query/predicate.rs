//! Typed predicate terms over partition rows.
//!
//! A [`PartitionPredicate`] is the conjunction of its [`PredicateTerm`]s. It can be evaluated
//! against an in-memory [`Partition`] or compiled into a SQL `WHERE` clause whose caller-supplied
//! values are all bound parameters.

use super::{date_criteria::DateCriteria, SqlBuilder, SqlDialect};
use crate::types::{Partition, TableId};

/// One condition on a partition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateTerm {
    /// The partition belongs to the given table.
    TableIdEq(TableId),
    /// The partition name is one of the given names. An empty list matches nothing.
    NameIn(Vec<String>),
    /// The partition name contains the given substring (case-sensitive).
    NameContains(String),
    /// The creation timestamp satisfies the criteria.
    CreatedDate(DateCriteria),
    /// The uri starts with at least one of the given prefixes. An empty list matches nothing.
    UriStartsWithAny(Vec<String>),
}

impl PredicateTerm {
    /// Evaluate the term against a partition.
    pub fn matches(&self, partition: &Partition) -> bool {
        match self {
            Self::TableIdEq(table_id) => partition.table_id == *table_id,
            Self::NameIn(names) => names.iter().any(|n| *n == partition.name),
            Self::NameContains(part) => partition.name.contains(part.as_str()),
            Self::CreatedDate(criteria) => criteria.matches(partition.created_date),
            Self::UriStartsWithAny(prefixes) => prefixes
                .iter()
                .any(|prefix| partition.uri.starts_with(prefix.as_str())),
        }
    }

    fn push_sql(&self, dialect: SqlDialect, builder: &mut SqlBuilder) {
        match self {
            Self::TableIdEq(table_id) => {
                builder.push("table_id = ").push_bind(table_id.get());
            }
            Self::NameIn(names) if names.is_empty() => {
                builder.push("1 = 0");
            }
            Self::NameIn(names) => {
                dialect.push_in("name", names, builder);
            }
            Self::NameContains(part) => {
                dialect.push_contains("name", part, builder);
            }
            Self::CreatedDate(criteria) => {
                criteria.push_sql("created_date", builder);
            }
            // an empty prefix list never matches everything
            Self::UriStartsWithAny(prefixes) if prefixes.is_empty() => {
                builder.push("1 = 0");
            }
            Self::UriStartsWithAny(prefixes) => {
                dialect.push_starts_with_any("uri", prefixes, builder);
            }
        }
    }
}

/// Conjunction of [`PredicateTerm`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPredicate {
    terms: Vec<PredicateTerm>,
}

impl PartitionPredicate {
    /// An empty predicate, matching every partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a term.
    pub fn and(mut self, term: PredicateTerm) -> Self {
        self.terms.push(term);
        self
    }

    /// The accumulated terms, in insertion order.
    pub fn terms(&self) -> &[PredicateTerm] {
        &self.terms
    }

    /// `true` if every term matches.
    pub fn matches(&self, partition: &Partition) -> bool {
        self.terms.iter().all(|term| term.matches(partition))
    }

    /// Append the predicate (without a leading `WHERE`) to `builder`.
    pub(crate) fn push_sql(&self, dialect: SqlDialect, builder: &mut SqlBuilder) {
        if self.terms.is_empty() {
            builder.push("1 = 1");
            return;
        }
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            term.push_sql(dialect, builder);
        }
    }
}
