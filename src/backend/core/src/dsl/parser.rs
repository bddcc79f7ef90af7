//! Recursive-descent parser producing [`RuleExpr`] trees.
//!
//! Grammar (informal):
//!
//! ```text
//! rule      := "when" "{" or "}" ("always" | "never") "{" or "}"
//! or        := and ("or" and)*
//! and       := unary ("and" unary)*
//! unary     := "not" unary | primary
//! primary   := "(" or ")"
//!            | "count" "(" opname ")" cmp integer
//!            | opname (".where" "(" filter ")")*
//! filter    := attrref cmp literal
//! attrref   := quoted-string | dotted-ident
//! literal   := string | number | bool | "[" literal ("," literal)* "]"
//! ```
//!
//! Call syntax other than `count(...)` is rejected at parse time as a
//! sandbox violation carrying the attempted operation name.

use regex::Regex;

use super::ast::{CmpOp, CompiledExpression, Filter, Literal, Predicate, RuleExpr};
use super::lexer::{tokenize, LexError, Token, TokenKind};

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Compilation failures.
///
/// `SandboxRejected` is split out because it routes to the audit subsystem
/// instead of the ordinary inert-rule path.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),

    #[error("expected {expected} at offset {offset}, found {found}")]
    Unexpected {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("forbidden operation in expression: {operation}")]
    SandboxRejected { operation: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parser
// ═══════════════════════════════════════════════════════════════════════════════

/// Compile one rule expression into its executable form.
pub fn parse_rule(rule_id: &str, expression: &str) -> Result<CompiledExpression, CompileError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };

    parser.expect_keyword("when")?;
    parser.expect(TokenKind::LBrace)?;
    let condition = parser.parse_or()?;
    parser.expect(TokenKind::RBrace)?;

    let mode = parser.expect_any_keyword(&["always", "never"])?;
    parser.expect(TokenKind::LBrace)?;
    let body = parser.parse_or()?;
    parser.expect(TokenKind::RBrace)?;
    parser.expect(TokenKind::Eof)?;

    let expr = if mode == "always" {
        RuleExpr::WhenAlways {
            condition,
            requirement: body,
        }
    } else {
        RuleExpr::WhenNever {
            condition,
            forbidden: body,
        }
    };

    Ok(CompiledExpression {
        rule_id: rule_id.to_string(),
        expr,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn unexpected(&self, expected: impl Into<String>) -> CompileError {
        let t = self.peek();
        CompileError::Unexpected {
            expected: expected.into(),
            found: t.kind.to_string(),
            offset: t.offset,
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), CompileError> {
        if self.peek().kind == kind {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected(kind.to_string()))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), CompileError> {
        match &self.peek().kind {
            TokenKind::Ident(s) if s == kw => {
                self.bump();
                Ok(())
            }
            _ => Err(self.unexpected(format!("`{}`", kw))),
        }
    }

    fn expect_any_keyword(&mut self, kws: &[&str]) -> Result<String, CompileError> {
        match &self.peek().kind {
            TokenKind::Ident(s) if kws.contains(&s.as_str()) => {
                let s = s.clone();
                self.bump();
                Ok(s)
            }
            _ => Err(self.unexpected(kws.join(" or "))),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(s) if s == kw)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Boolean structure
    // ─────────────────────────────────────────────────────────────────────────

    fn parse_or(&mut self) -> Result<Predicate, CompileError> {
        let mut left = self.parse_and()?;
        while self.at_keyword("or") {
            self.bump();
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, CompileError> {
        let mut left = self.parse_unary()?;
        while self.at_keyword("and") {
            self.bump();
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate, CompileError> {
        if self.at_keyword("not") {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, CompileError> {
        if self.peek().kind == TokenKind::LParen {
            self.bump();
            let inner = self.parse_or()?;
            self.expect(TokenKind::RParen)?;
            return Ok(inner);
        }

        if self.at_keyword("count") && self.peek_at(1).kind == TokenKind::LParen {
            return self.parse_count();
        }

        let operation = self.parse_dotted_name()?;

        // Call-form on anything but `count` is a host-routine attempt.
        if self.peek().kind == TokenKind::LParen {
            return Err(CompileError::SandboxRejected { operation });
        }

        let mut filters = Vec::new();
        while self.peek().kind == TokenKind::Dot
            && matches!(&self.peek_at(1).kind, TokenKind::Ident(s) if s == "where")
        {
            self.bump(); // dot
            self.bump(); // where
            self.expect(TokenKind::LParen)?;
            filters.push(self.parse_filter()?);
            self.expect(TokenKind::RParen)?;
        }

        Ok(Predicate::OpMatch { operation, filters })
    }

    fn parse_count(&mut self) -> Result<Predicate, CompileError> {
        self.bump(); // count
        self.expect(TokenKind::LParen)?;
        let operation = self.parse_dotted_name()?;
        self.expect(TokenKind::RParen)?;
        let op = self.parse_cmp()?;
        let value = match self.bump().kind {
            TokenKind::Int(i) => i,
            _ => return Err(self.unexpected("integer")),
        };
        Ok(Predicate::Count {
            operation,
            op,
            value,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Names, filters, literals
    // ─────────────────────────────────────────────────────────────────────────

    /// Parse `a.b.c`, stopping before a trailing `.where(`.
    fn parse_dotted_name(&mut self) -> Result<String, CompileError> {
        let mut name = match self.bump().kind {
            TokenKind::Ident(s) => s,
            _ => return Err(self.unexpected("identifier")),
        };
        while self.peek().kind == TokenKind::Dot {
            if let TokenKind::Ident(next) = &self.peek_at(1).kind {
                if next == "where" && self.peek_at(2).kind == TokenKind::LParen {
                    break;
                }
                name.push('.');
                name.push_str(next);
                self.bump();
                self.bump();
            } else {
                break;
            }
        }
        Ok(name)
    }

    fn parse_filter(&mut self) -> Result<Filter, CompileError> {
        let attr = match &self.peek().kind {
            TokenKind::Str(s) => {
                let s = s.clone();
                self.bump();
                s
            }
            TokenKind::Ident(_) => self.parse_dotted_name()?,
            _ => return Err(self.unexpected("attribute reference")),
        };

        let op = self.parse_cmp()?;
        let value = self.parse_literal()?;

        let pattern = if op == CmpOp::Matches {
            let Literal::Str(p) = &value else {
                return Err(self.unexpected("string pattern after `matches`"));
            };
            Some(Regex::new(p).map_err(|source| CompileError::InvalidRegex {
                pattern: p.clone(),
                source,
            })?)
        } else {
            None
        };

        Ok(Filter {
            attr,
            op,
            value,
            pattern,
        })
    }

    fn parse_cmp(&mut self) -> Result<CmpOp, CompileError> {
        let op = match &self.peek().kind {
            TokenKind::EqEq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::Ne,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::Le => CmpOp::Le,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::Ge => CmpOp::Ge,
            TokenKind::Ident(s) if s == "in" => CmpOp::In,
            TokenKind::Ident(s) if s == "matches" => CmpOp::Matches,
            TokenKind::Ident(s) if s == "contains" => CmpOp::Contains,
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.bump();
        Ok(op)
    }

    fn parse_literal(&mut self) -> Result<Literal, CompileError> {
        match self.peek().kind.clone() {
            TokenKind::Str(s) => {
                self.bump();
                Ok(Literal::Str(s))
            }
            TokenKind::Int(i) => {
                self.bump();
                Ok(Literal::Int(i))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(Literal::Float(v))
            }
            TokenKind::Ident(s) if s == "true" => {
                self.bump();
                Ok(Literal::Bool(true))
            }
            TokenKind::Ident(s) if s == "false" => {
                self.bump();
                Ok(Literal::Bool(false))
            }
            TokenKind::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if self.peek().kind != TokenKind::RBracket {
                    items.push(self.parse_literal()?);
                    while self.peek().kind == TokenKind::Comma {
                        self.bump();
                        items.push(self.parse_literal()?);
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Literal::List(items))
            }
            _ => Err(self.unexpected("literal")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
