//! Query composition for partition lookups.
//!
//! [`PartitionFilter`] gathers the optional filter, sort and pagination inputs of a filtered
//! listing and turns them into a [`PartitionPredicate`]. SQL backends compile the predicate into
//! a [`CompiledQuery`]; the in-memory backend evaluates it directly. [`UriLookup`] selects between
//! the exact and prefix uri lookup strategies.

pub mod date_criteria;
pub mod predicate;

use self::{
    date_criteria::DateCriteria,
    predicate::{PartitionPredicate, PredicateTerm},
};
use crate::types::{Partition, TableId};
use snafu::{ResultExt, Snafu};
use std::{cmp::Ordering, str::FromStr};

/// Columns selected for every partition query, in [`Partition`] field order.
pub const PARTITION_COLUMNS: &str = "id, table_id, name, uri, created_date";

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid date created criteria '{expression}': {source}"))]
    DateCriteria {
        expression: String,
        source: date_criteria::Error,
    },

    #[snafu(display("unknown sort field '{name}'"))]
    UnknownSortField { name: String },

    #[snafu(display("unknown sort order '{name}', expected ASC or DESC"))]
    UnknownSortOrder { name: String },
}

/// A specialized `Error` for query composition
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A value bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SqlParam {
    Int(i64),
    Text(String),
    /// Bound as one array value, so list length never counts against the store's variable limit.
    TextList(Vec<String>),
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<&[String]> for SqlParam {
    fn from(v: &[String]) -> Self {
        Self::TextList(v.to_vec())
    }
}

/// SQL text plus the values for its placeholders, in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    /// statement text using `$1`, `$2`, ... placeholders
    pub sql: String,
    /// bound values
    pub params: Vec<SqlParam>,
}

/// Incrementally assembles a statement. Caller input only ever enters via [`Self::push_bind`].
#[derive(Debug, Default)]
pub struct SqlBuilder {
    sql: String,
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    /// Start a statement with the given text.
    pub fn new(init: &str) -> Self {
        Self {
            sql: init.to_string(),
            params: vec![],
        }
    }

    /// Append trusted SQL text.
    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a placeholder and record its value.
    pub fn push_bind(&mut self, value: impl Into<SqlParam>) -> &mut Self {
        self.params.push(value.into());
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    /// Finish the statement.
    pub fn build(self) -> CompiledQuery {
        CompiledQuery {
            sql: self.sql,
            params: self.params,
        }
    }
}

/// SQL flavour of a backend; only string matching differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    fn push_contains(&self, column: &str, needle: &str, builder: &mut SqlBuilder) {
        let func = match self {
            Self::Sqlite => "instr",
            Self::Postgres => "strpos",
        };
        builder
            .push(func)
            .push("(")
            .push(column)
            .push(", ")
            .push_bind(needle)
            .push(") > 0");
    }

    /// `column` equals one of `values`.
    fn push_in(&self, column: &str, values: &[String], builder: &mut SqlBuilder) {
        builder.push(column);
        match self {
            Self::Sqlite => {
                builder
                    .push(" IN (SELECT value FROM json_each(")
                    .push_bind(values)
                    .push("))");
            }
            Self::Postgres => {
                builder.push(" = ANY(").push_bind(values).push(")");
            }
        }
    }

    /// `column` starts with at least one of `prefixes`.
    fn push_starts_with_any(&self, column: &str, prefixes: &[String], builder: &mut SqlBuilder) {
        match self {
            Self::Sqlite => {
                builder
                    .push("EXISTS (SELECT 1 FROM json_each(")
                    .push_bind(prefixes)
                    .push(") WHERE substr(")
                    .push(column)
                    .push(", 1, length(value)) = value)");
            }
            Self::Postgres => {
                builder
                    .push("EXISTS (SELECT 1 FROM unnest(")
                    .push_bind(prefixes)
                    .push("::text[]) AS prefix WHERE starts_with(")
                    .push(column)
                    .push(", prefix))");
            }
        }
    }

    /// Collation clause for ordering by a text column. Postgres would otherwise order by the
    /// database locale, while SQLite and the in-memory catalog compare bytes.
    fn text_ordering(&self) -> &'static str {
        match self {
            Self::Sqlite => "",
            Self::Postgres => r#" COLLATE "C""#,
        }
    }
}

/// Partition attribute a listing can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SortField {
    Id,
    Name,
    Uri,
    CreatedDate,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::Uri => "uri",
            Self::CreatedDate => "created_date",
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, Self::Name | Self::Uri)
    }

    fn compare(&self, a: &Partition, b: &Partition) -> Ordering {
        match self {
            Self::Id => Ordering::Equal,
            Self::Name => a.name.cmp(&b.name),
            Self::Uri => a.uri.cmp(&b.uri),
            Self::CreatedDate => a.created_date.cmp(&b.created_date),
        }
    }
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "id" => Ok(Self::Id),
            "name" | "partition_name" => Ok(Self::Name),
            "uri" => Ok(Self::Uri),
            "created_date" | "createddate" | "date_created" | "datecreated" => {
                Ok(Self::CreatedDate)
            }
            _ => UnknownSortFieldSnafu { name: s }.fail(),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            _ => UnknownSortOrderSnafu { name: s }.fail(),
        }
    }
}

/// Requested ordering. Without a sort field no ordering is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sort {
    /// field to sort by
    pub sort_by: Option<SortField>,
    /// direction
    pub order: SortOrder,
}

impl Sort {
    /// Sort by `field` in `order`.
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self {
            sort_by: Some(field),
            order,
        }
    }

    /// Parse a caller-supplied field name and direction.
    pub fn parse(field: &str, order: &str) -> Result<Self> {
        Ok(Self::new(field.parse()?, order.parse()?))
    }

    /// `true` if a sort field is set.
    pub fn has_sort(&self) -> bool {
        self.sort_by.is_some()
    }

    /// Compare two partitions; ties on the sort field are broken by id in the same direction.
    pub fn compare(&self, a: &Partition, b: &Partition) -> Ordering {
        let ord = self
            .sort_by
            .map(|field| field.compare(a, b))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id));
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }

    fn push_sql(&self, dialect: SqlDialect, builder: &mut SqlBuilder) {
        let Some(field) = self.sort_by else {
            return;
        };
        let dir = self.order.as_sql();
        builder.push(" ORDER BY ").push(field.column());
        if field.is_text() {
            builder.push(dialect.text_ordering());
        }
        builder.push(" ").push(dir);
        if field != SortField::Id {
            builder.push(", id ").push(dir);
        }
    }
}

/// An offset + limit page request. Without a limit no pagination is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pageable {
    /// rows to skip
    pub offset: u64,
    /// maximum rows to return
    pub limit: Option<u64>,
}

impl Pageable {
    /// A page of at most `limit` rows starting at `offset`.
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// `true` if a page was requested.
    pub fn is_pageable(&self) -> bool {
        self.limit.is_some()
    }

    fn apply(&self, partitions: Vec<Partition>) -> Vec<Partition> {
        let Some(limit) = self.limit else {
            return partitions;
        };
        partitions
            .into_iter()
            .skip(usize::try_from(self.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect()
    }

    fn push_sql(&self, builder: &mut SqlBuilder) {
        let Some(limit) = self.limit else {
            return;
        };
        builder
            .push(" LIMIT ")
            .push_bind(clamp(limit))
            .push(" OFFSET ")
            .push_bind(clamp(self.offset));
    }
}

fn clamp(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Optional filter, sort and pagination inputs for a filtered partition listing.
///
/// Every filter is optional and they are ANDed together; leaving one out never affects how the
/// others are evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFilter {
    partition_names: Vec<String>,
    partition_name_parts: Vec<String>,
    date_created_criteria: Option<String>,
    sort: Option<Sort>,
    pageable: Option<Pageable>,
}

impl PartitionFilter {
    /// A filter that matches every partition of a table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only return partitions with one of these exact names.
    pub fn with_names<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_nullable_names(names.into_iter().map(Some))
    }

    /// Like [`Self::with_names`], skipping `None` entries. A list of only `None` entries is the
    /// same as no list at all.
    pub fn with_nullable_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        self.partition_names
            .extend(names.into_iter().flatten().map(Into::into));
        self
    }

    /// Only return partitions whose name contains every one of these substrings.
    pub fn with_name_parts<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_name_parts
            .extend(parts.into_iter().map(Into::into));
        self
    }

    /// Only return partitions whose creation date satisfies `criteria`, e.g.
    /// `created_date >= 1704067200`. Blank criteria are ignored; the expression is validated when
    /// the filter is used.
    pub fn with_date_created_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.date_created_criteria = Some(criteria.into());
        self
    }

    /// Order the result.
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Return one page of the result.
    pub fn with_pageable(mut self, pageable: Pageable) -> Self {
        self.pageable = Some(pageable);
        self
    }

    /// The active sort, if any.
    pub fn sort(&self) -> Option<Sort> {
        self.sort.filter(Sort::has_sort)
    }

    /// The active page request, if any.
    pub fn pageable(&self) -> Option<Pageable> {
        self.pageable.filter(Pageable::is_pageable)
    }

    /// Build the predicate for partitions of `table_id`.
    pub fn predicate(&self, table_id: TableId) -> Result<PartitionPredicate> {
        let mut predicate = PartitionPredicate::new().and(PredicateTerm::TableIdEq(table_id));

        if !self.partition_names.is_empty() {
            predicate = predicate.and(PredicateTerm::NameIn(self.partition_names.clone()));
        }

        for part in &self.partition_name_parts {
            predicate = predicate.and(PredicateTerm::NameContains(part.clone()));
        }

        if let Some(expression) = self
            .date_created_criteria
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            let criteria = DateCriteria::parse(expression).context(DateCriteriaSnafu {
                expression,
            })?;
            predicate = predicate.and(PredicateTerm::CreatedDate(criteria));
        }

        Ok(predicate)
    }

    /// Compile the full listing query for a SQL backend.
    pub fn compile(&self, table_id: TableId, dialect: SqlDialect) -> Result<CompiledQuery> {
        let predicate = self.predicate(table_id)?;

        let mut builder = SqlBuilder::new(&format!(
            "SELECT {PARTITION_COLUMNS} FROM partition_table WHERE "
        ));
        predicate.push_sql(dialect, &mut builder);
        if let Some(sort) = self.sort() {
            sort.push_sql(dialect, &mut builder);
        }
        if let Some(pageable) = self.pageable() {
            pageable.push_sql(&mut builder);
        }
        builder.push(";");

        Ok(builder.build())
    }

    /// Evaluate the listing over in-memory partitions, in their iteration order.
    pub fn apply<'a>(
        &self,
        table_id: TableId,
        partitions: impl IntoIterator<Item = &'a Partition>,
    ) -> Result<Vec<Partition>> {
        let predicate = self.predicate(table_id)?;

        let mut matched: Vec<_> = partitions
            .into_iter()
            .filter(|p| predicate.matches(p))
            .cloned()
            .collect();
        if let Some(sort) = self.sort() {
            matched.sort_by(|a, b| sort.compare(a, b));
        }
        if let Some(pageable) = self.pageable() {
            matched = pageable.apply(matched);
        }

        Ok(matched)
    }
}

/// How [`get_by_uris`](crate::interface::PartitionRepo::get_by_uris) matches uris.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriLookup {
    /// Partitions whose uri equals one of the values.
    Exact(Vec<String>),
    /// Partitions whose uri starts with any of the values.
    Prefix(Vec<String>),
}

impl UriLookup {
    /// Select the strategy from a `prefix_search` flag.
    pub fn new<I, S>(uris: I, prefix_search: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let uris = uris.into_iter().map(Into::into).collect();
        if prefix_search {
            Self::Prefix(uris)
        } else {
            Self::Exact(uris)
        }
    }

    /// The candidate uris.
    pub fn uris(&self) -> &[String] {
        match self {
            Self::Exact(uris) | Self::Prefix(uris) => uris,
        }
    }

    /// `true` if the lookup matches `partition`.
    pub fn matches(&self, partition: &Partition) -> bool {
        match self {
            Self::Exact(uris) => uris.iter().any(|u| *u == partition.uri),
            Self::Prefix(prefixes) => prefixes
                .iter()
                .any(|prefix| partition.uri.starts_with(prefix.as_str())),
        }
    }

    /// Compile a prefix lookup. Exact lookups use a fixed statement per backend.
    pub fn compile_prefix(prefixes: &[String], dialect: SqlDialect) -> CompiledQuery {
        let predicate =
            PartitionPredicate::new().and(PredicateTerm::UriStartsWithAny(prefixes.to_vec()));
        let mut builder = SqlBuilder::new(&format!(
            "SELECT {PARTITION_COLUMNS} FROM partition_table WHERE "
        ));
        predicate.push_sql(dialect, &mut builder);
        builder.push(";");
        builder.build()
    }
}
