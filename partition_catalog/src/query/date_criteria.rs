//! Caller-supplied boolean expressions over a partition's creation timestamp.
//!
//! Callers pass a SQL-like comparison such as `created_date >= 1704067200` or
//! `p.date_created BETWEEN '2024-01-01' AND '2024-02-01'`. The expression is parsed into a
//! [`DateCriteria`] tree; only comparisons between the creation column and a literal, combined with
//! `AND`, `OR`, `NOT` and parentheses, are accepted. The tree is then either evaluated directly or
//! compiled to SQL with every literal bound as a parameter.

use super::SqlBuilder;
use crate::types::Timestamp;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlparser::{
    ast::{BinaryOperator, Expr, Ident, UnaryOperator, Value},
    dialect::GenericDialect,
    parser::{Parser, ParserError},
    tokenizer::Token,
};
use std::str::FromStr;

/// Column names (case-insensitive) that refer to the partition creation timestamp.
const COLUMN_ALIASES: &[&str] = &["created_date", "date_created", "datecreated", "createddate"];

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("failed to parse expression: {source}"))]
    Parse { source: ParserError },

    #[snafu(display("unexpected input after expression: '{token}'"))]
    TrailingInput { token: String },

    #[snafu(display("unsupported expression '{expr}'"))]
    Unsupported { expr: String },

    #[snafu(display("unknown column '{name}', only the creation date can be filtered on"))]
    UnknownColumn { name: String },

    #[snafu(display("comparison must be between the creation date and a literal: '{expr}'"))]
    InvalidComparison { expr: String },

    #[snafu(display("invalid timestamp literal '{value}'"))]
    InvalidTimestamp { value: String },
}

/// A specialized `Error` for date criteria parsing
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Comparison operator between the creation timestamp and a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn from_operator(op: &BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Eq => Some(Self::Eq),
            BinaryOperator::NotEq => Some(Self::NotEq),
            BinaryOperator::Lt => Some(Self::Lt),
            BinaryOperator::LtEq => Some(Self::LtEq),
            BinaryOperator::Gt => Some(Self::Gt),
            BinaryOperator::GtEq => Some(Self::GtEq),
            _ => None,
        }
    }

    /// The operator to use when the operands are swapped (`5 < x` is `x > 5`).
    fn flip(self) -> Self {
        match self {
            Self::Eq | Self::NotEq => self,
            Self::Lt => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt => Self::Lt,
            Self::GtEq => Self::LtEq,
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }

    fn eval(&self, lhs: Timestamp, rhs: Timestamp) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::NotEq => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::LtEq => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::GtEq => lhs >= rhs,
        }
    }
}

/// A validated boolean expression over the creation timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateCriteria {
    /// `created_date <op> value`
    Compare {
        /// comparison operator
        op: CompareOp,
        /// right hand side
        value: Timestamp,
    },
    /// `created_date [NOT] BETWEEN low AND high`, bounds inclusive
    Between {
        /// lower bound
        low: Timestamp,
        /// upper bound
        high: Timestamp,
        /// `NOT BETWEEN`
        negated: bool,
    },
    /// Negation
    Not(Box<DateCriteria>),
    /// Conjunction
    And(Box<DateCriteria>, Box<DateCriteria>),
    /// Disjunction
    Or(Box<DateCriteria>, Box<DateCriteria>),
}

impl DateCriteria {
    /// Parse a caller-supplied expression.
    pub fn parse(sql: &str) -> Result<Self> {
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(sql)
            .context(ParseSnafu)?;
        let expr = parser.parse_expr().context(ParseSnafu)?;

        let next = parser.next_token();
        ensure!(
            next.token == Token::EOF,
            TrailingInputSnafu {
                token: next.token.to_string()
            }
        );

        Self::try_from_expr(&expr)
    }

    fn try_from_expr(expr: &Expr) -> Result<Self> {
        match expr {
            Expr::Nested(inner) => Self::try_from_expr(inner),
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: inner,
            } => Ok(Self::Not(Box::new(Self::try_from_expr(inner)?))),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => Ok(Self::And(
                Box::new(Self::try_from_expr(left)?),
                Box::new(Self::try_from_expr(right)?),
            )),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => Ok(Self::Or(
                Box::new(Self::try_from_expr(left)?),
                Box::new(Self::try_from_expr(right)?),
            )),
            Expr::BinaryOp { left, op, right } => {
                let op = CompareOp::from_operator(op).context(UnsupportedSnafu {
                    expr: expr.to_string(),
                })?;
                match (is_creation_column(left)?, is_creation_column(right)?) {
                    (true, false) => Ok(Self::Compare {
                        op,
                        value: literal(right)?,
                    }),
                    (false, true) => Ok(Self::Compare {
                        op: op.flip(),
                        value: literal(left)?,
                    }),
                    _ => InvalidComparisonSnafu {
                        expr: expr.to_string(),
                    }
                    .fail(),
                }
            }
            Expr::Between {
                expr: target,
                negated,
                low,
                high,
            } => {
                ensure!(
                    is_creation_column(target)?,
                    InvalidComparisonSnafu {
                        expr: expr.to_string()
                    }
                );
                Ok(Self::Between {
                    low: literal(low)?,
                    high: literal(high)?,
                    negated: *negated,
                })
            }
            _ => UnsupportedSnafu {
                expr: expr.to_string(),
            }
            .fail(),
        }
    }

    /// Evaluate against a creation timestamp.
    pub fn matches(&self, created_date: Timestamp) -> bool {
        match self {
            Self::Compare { op, value } => op.eval(created_date, *value),
            Self::Between { low, high, negated } => {
                (*low <= created_date && created_date <= *high) != *negated
            }
            Self::Not(inner) => !inner.matches(created_date),
            Self::And(l, r) => l.matches(created_date) && r.matches(created_date),
            Self::Or(l, r) => l.matches(created_date) || r.matches(created_date),
        }
    }

    /// Append this expression to `builder`, comparing against `column`.
    pub(crate) fn push_sql(&self, column: &str, builder: &mut SqlBuilder) {
        match self {
            Self::Compare { op, value } => {
                builder
                    .push(column)
                    .push(" ")
                    .push(op.as_sql())
                    .push(" ")
                    .push_bind(value.get());
            }
            Self::Between { low, high, negated } => {
                builder.push(column);
                if *negated {
                    builder.push(" NOT");
                }
                builder
                    .push(" BETWEEN ")
                    .push_bind(low.get())
                    .push(" AND ")
                    .push_bind(high.get());
            }
            Self::Not(inner) => {
                builder.push("NOT (");
                inner.push_sql(column, builder);
                builder.push(")");
            }
            Self::And(l, r) => {
                builder.push("(");
                l.push_sql(column, builder);
                builder.push(" AND ");
                r.push_sql(column, builder);
                builder.push(")");
            }
            Self::Or(l, r) => {
                builder.push("(");
                l.push_sql(column, builder);
                builder.push(" OR ");
                r.push_sql(column, builder);
                builder.push(")");
            }
        }
    }
}

impl FromStr for DateCriteria {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// `true` if `expr` names the creation column, `false` if it is not an identifier at all.
fn is_creation_column(expr: &Expr) -> Result<bool> {
    let ident: &Ident = match expr {
        Expr::Identifier(ident) => ident,
        // allow a table alias, e.g. `p.created_date`
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [_, column] => column,
            _ => {
                return UnknownColumnSnafu {
                    name: expr.to_string(),
                }
                .fail()
            }
        },
        _ => return Ok(false),
    };

    ensure!(
        COLUMN_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(&ident.value)),
        UnknownColumnSnafu {
            name: ident.value.clone()
        }
    );
    Ok(true)
}

fn literal(expr: &Expr) -> Result<Timestamp> {
    match expr {
        Expr::Nested(inner) => literal(inner),
        Expr::Value(Value::Number(n, _)) => epoch_seconds(n),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match inner.as_ref() {
            Expr::Value(Value::Number(n, _)) => epoch_seconds(&format!("-{n}")),
            _ => InvalidTimestampSnafu {
                value: expr.to_string(),
            }
            .fail(),
        },
        Expr::Value(Value::SingleQuotedString(s)) => datetime(s),
        _ => InvalidComparisonSnafu {
            expr: expr.to_string(),
        }
        .fail(),
    }
}

fn epoch_seconds(n: &str) -> Result<Timestamp> {
    n.parse::<i64>()
        .ok()
        .and_then(Timestamp::from_secs)
        .context(InvalidTimestampSnafu { value: n })
}

fn datetime(s: &str) -> Result<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).into());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().into());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().into())
        .context(InvalidTimestampSnafu { value: s })
}
