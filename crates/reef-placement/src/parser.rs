//! Placement policy parser.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! rule     := rep+ cbf? select* filter*
//! rep      := REP <n> [IN <selector>]
//! cbf      := CBF <n>
//! select   := SELECT <n> [IN [SAME|DISTINCT] <attr>] FROM (* | <filter>) [AS <name>]
//! filter   := FILTER or_expr AS <name>
//! or_expr  := and_expr (OR and_expr)*
//! and_expr := primary (AND primary)*
//! primary  := "(" or_expr ")" | <key> <op> <value>
//! op       := EQ | NE | GT | GE | LT | LE
//! ```

use std::collections::HashSet;

use reef_types::policy::ANY_FILTER;
use reef_types::{Clause, Filter, FilterExpr, Operation, PlacementRule, Replica, Selector};

use crate::PlacementError;

type Result<T> = std::result::Result<T, PlacementError>;

const KEYWORDS: &[&str] = &[
    "REP", "IN", "CBF", "SELECT", "SAME", "DISTINCT", "FROM", "AS", "FILTER", "AND", "OR",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Star,
    LParen,
    RParen,
}

/// Parse a placement policy into a validated [`PlacementRule`].
pub fn parse_rule(input: &str) -> Result<PlacementRule> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let rule = parser.rule()?;
    validate(&rule)?;
    Ok(rule)
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => value.push(ch),
                        None => {
                            return Err(PlacementError::Syntax {
                                position: tokens.len(),
                                message: "unterminated quoted value".into(),
                            });
                        }
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '"' | '*') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn rule(&mut self) -> Result<PlacementRule> {
        let mut replicas = Vec::new();
        while self.eat_keyword("REP") {
            replicas.push(self.replica()?);
        }
        if replicas.is_empty() {
            return Err(self.error("expected REP"));
        }

        let backup_factor = if self.eat_keyword("CBF") {
            Some(self.number("CBF")?)
        } else {
            None
        };

        let mut selectors = Vec::new();
        while self.eat_keyword("SELECT") {
            selectors.push(self.selector()?);
        }

        let mut filters = Vec::new();
        while self.eat_keyword("FILTER") {
            filters.push(self.filter()?);
        }

        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected trailing input"));
        }

        Ok(PlacementRule {
            replicas,
            backup_factor,
            selectors,
            filters,
        })
    }

    fn replica(&mut self) -> Result<Replica> {
        let count = self.number("REP")?;
        let selector = if self.eat_keyword("IN") {
            Some(self.ident("selector name")?)
        } else {
            None
        };
        Ok(Replica { count, selector })
    }

    fn selector(&mut self) -> Result<Selector> {
        let count = self.number("SELECT")?;

        let mut clause = Clause::Unspecified;
        let mut attribute = None;
        if self.eat_keyword("IN") {
            if self.eat_keyword("SAME") {
                clause = Clause::Same;
            } else if self.eat_keyword("DISTINCT") {
                clause = Clause::Distinct;
            }
            attribute = Some(self.ident("attribute")?);
        }

        if !self.eat_keyword("FROM") {
            return Err(self.error("expected FROM"));
        }
        let filter = if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            ANY_FILTER.to_string()
        } else {
            self.ident("filter name")?
        };

        let name = if self.eat_keyword("AS") {
            Some(self.ident("selector name")?)
        } else {
            None
        };

        Ok(Selector {
            count,
            clause,
            attribute,
            filter,
            name,
        })
    }

    fn filter(&mut self) -> Result<Filter> {
        let expr = self.or_expr()?;
        if !self.eat_keyword("AS") {
            return Err(self.error("expected AS after filter expression"));
        }
        let name = self.ident("filter name")?;
        Ok(Filter { name, expr })
    }

    fn or_expr(&mut self) -> Result<FilterExpr> {
        let mut terms = vec![self.and_expr()?];
        while self.eat_keyword("OR") {
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            FilterExpr::Or(terms)
        })
    }

    fn and_expr(&mut self) -> Result<FilterExpr> {
        let mut terms = vec![self.primary()?];
        while self.eat_keyword("AND") {
            terms.push(self.primary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            FilterExpr::And(terms)
        })
    }

    fn primary(&mut self) -> Result<FilterExpr> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = self.or_expr()?;
            if self.peek() != Some(&Token::RParen) {
                return Err(self.error("expected `)`"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        let key = self.ident("attribute")?;
        let op = match self.peek() {
            Some(Token::Word(w)) => Operation::from_keyword(w),
            _ => None,
        }
        .ok_or_else(|| self.error("expected EQ, NE, GT, GE, LT or LE"))?;
        self.pos += 1;

        let value = match self.peek() {
            Some(Token::Word(w)) => w.clone(),
            Some(Token::Quoted(q)) => q.clone(),
            _ => return Err(self.error("expected value")),
        };
        self.pos += 1;

        Ok(FilterExpr::Compare { key, op, value })
    }

    // ----- token helpers -----

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn number(&mut self, after: &str) -> Result<u32> {
        let n = match self.peek() {
            Some(Token::Word(w)) => w.parse::<u32>().ok(),
            _ => None,
        }
        .ok_or_else(|| self.error(&format!("expected a number after {after}")))?;
        self.pos += 1;
        Ok(n)
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Token::Word(w)) if !is_keyword(w) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.error(&format!("expected {what}"))),
        }
    }

    fn error(&self, message: &str) -> PlacementError {
        PlacementError::Syntax {
            position: self.pos,
            message: message.to_string(),
        }
    }
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn validate(rule: &PlacementRule) -> Result<()> {
    if rule.replicas.iter().any(|r| r.count == 0) {
        return Err(PlacementError::Invalid("REP count must be positive".into()));
    }
    if rule.backup_factor == Some(0) {
        return Err(PlacementError::Invalid("CBF must be positive".into()));
    }
    if rule.selectors.iter().any(|s| s.count == 0) {
        return Err(PlacementError::Invalid("SELECT count must be positive".into()));
    }

    let mut names = HashSet::new();
    for name in rule.selectors.iter().filter_map(|s| s.name.as_deref()) {
        if !names.insert(name) {
            return Err(PlacementError::Invalid(format!("duplicate selector {name}")));
        }
    }
    let mut filter_names = HashSet::new();
    for filter in &rule.filters {
        if !filter_names.insert(filter.name.as_str()) {
            return Err(PlacementError::Invalid(format!(
                "duplicate filter {}",
                filter.name
            )));
        }
    }

    for replica in &rule.replicas {
        if let Some(sel) = &replica.selector
            && rule.selector(sel).is_none()
        {
            return Err(PlacementError::Invalid(format!("unknown selector {sel}")));
        }
    }
    for selector in &rule.selectors {
        if selector.filter != ANY_FILTER && rule.filter(&selector.filter).is_none() {
            return Err(PlacementError::Invalid(format!(
                "unknown filter {}",
                selector.filter
            )));
        }
    }

    Ok(())
}
