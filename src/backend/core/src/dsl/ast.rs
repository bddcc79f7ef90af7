//! Abstract syntax for compiled DSL-v2 expressions.

use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Operators & Literals
// ═══════════════════════════════════════════════════════════════════════════════

/// Comparison operators supported in filters and count comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Matches,
    Contains,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::Matches => "matches",
            Self::Contains => "contains",
        }
    }
}

/// Literal values appearing on the right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Literal>),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters & Predicates
// ═══════════════════════════════════════════════════════════════════════════════

/// One `.where(<attr> <cmp> <literal>)` clause.
///
/// For `matches`, the regex is compiled once here so evaluation never pays
/// for (or fails on) pattern compilation.
#[derive(Debug, Clone)]
pub struct Filter {
    pub attr: String,
    pub op: CmpOp,
    pub value: Literal,
    pub pattern: Option<Regex>,
}

/// A boolean condition over a single trace.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    /// Some span with this operation name satisfies every filter.
    OpMatch {
        operation: String,
        filters: Vec<Filter>,
    },
    /// `count(<operation>) <cmp> <integer>`
    Count {
        operation: String,
        op: CmpOp,
        value: i64,
    },
}

/// A complete rule body.
#[derive(Debug, Clone)]
pub enum RuleExpr {
    /// Matches when the condition holds and the requirement does not.
    WhenAlways {
        condition: Predicate,
        requirement: Predicate,
    },
    /// Matches when the condition holds and the forbidden pattern does too.
    WhenNever {
        condition: Predicate,
        forbidden: Predicate,
    },
}

/// The executable form stored in the cache.
///
/// Invariant: a cached compiled form was produced from the exact current
/// (name, expression) tuple; the rule id encodes both, so keying by id is
/// sufficient.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    pub rule_id: String,
    pub expr: RuleExpr,
}

impl RuleExpr {
    pub fn condition(&self) -> &Predicate {
        match self {
            Self::WhenAlways { condition, .. } | Self::WhenNever { condition, .. } => condition,
        }
    }
}
