//! Compiler for the untrusted `filter`, `sort` and `fields` query parameters.
//!
//! Only whitelisted field names, comparison operators and literal kinds are
//! accepted; nothing in the input is ever evaluated. Referencing a field the
//! requester cannot read is reported as [`CompileError::UnknownField`] so a
//! query never reveals which hidden fields exist.

use crate::catalog::schema::KindSchema;
use crate::catalog::types::Value;
use crate::query::error::CompileError;
use crate::query::plan::{CmpOp, CompiledQuery, Expr, MAX_EXPR_DEPTH, Order, Pagination, Selection, SortKey};
use crate::query::{QueryLimits, QueryParams};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Op(CmpOp),
    Literal(Value),
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    position: usize,
}

const OPERATOR_CHARS: &str = "=!<>~&|^%*/+-";
const UNSUPPORTED_KEYWORDS: [&str; 5] = ["in", "is", "like", "between", "contains"];

/// Words the parser reads as connectives or literals, never as field names.
pub(crate) const RESERVED_WORDS: [&str; 7] = ["and", "or", "not", "true", "false", "null", "none"];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Lexer<'a> {
    text: &'a str,
    chars: Vec<(usize, char)>,
    idx: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.char_indices().collect(),
            idx: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.idx + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.idx)
            .map(|(pos, _)| *pos)
            .unwrap_or(self.text.len())
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, CompileError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            let position = self.offset();
            let token = match c {
                _ if c.is_whitespace() => {
                    self.idx += 1;
                    continue;
                }
                '(' => {
                    self.idx += 1;
                    Token::LParen
                }
                ')' => {
                    self.idx += 1;
                    Token::RParen
                }
                '\'' | '"' => Token::Literal(self.string(c, position)?),
                '-' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => {
                    Token::Literal(self.number(position)?)
                }
                _ if c.is_ascii_digit() => Token::Literal(self.number(position)?),
                _ if is_ident_start(c) => Token::Ident(self.take_while(is_ident_char)),
                _ if OPERATOR_CHARS.contains(c) => {
                    let symbol = self.operator();
                    match CmpOp::from_symbol(&symbol) {
                        Some(op) => Token::Op(op),
                        None => {
                            return Err(CompileError::UnsupportedOperator {
                                operator: symbol,
                                position,
                            });
                        }
                    }
                }
                other => {
                    return Err(CompileError::syntax(
                        position,
                        format!("unexpected character '{other}'"),
                    ));
                }
            };
            tokens.push(Spanned { token, position });
        }
        Ok(tokens)
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| pred(*c)) {
            out.push(c);
            self.idx += 1;
        }
        out
    }

    /// Maximal run of operator characters; a sign directly before a digit
    /// starts the following number instead (`a<-5`).
    fn operator(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| OPERATOR_CHARS.contains(*c)) {
            let signs_number = matches!(c, '-' | '+')
                && !out.is_empty()
                && self.peek_at(1).is_some_and(|n| n.is_ascii_digit());
            if signs_number {
                break;
            }
            out.push(c);
            self.idx += 1;
        }
        out
    }

    fn string(&mut self, quote: char, position: usize) -> Result<Value, CompileError> {
        self.idx += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(CompileError::literal(position, "unterminated string"));
            };
            self.idx += 1;
            match c {
                '\\' => {
                    let escaped = match self.peek() {
                        Some('\\') => '\\',
                        Some('\'') => '\'',
                        Some('"') => '"',
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(other) => {
                            return Err(CompileError::literal(
                                position,
                                format!("invalid escape '\\{other}'"),
                            ));
                        }
                        None => return Err(CompileError::literal(position, "unterminated string")),
                    };
                    self.idx += 1;
                    out.push(escaped);
                }
                _ if c == quote => return Ok(Value::Text(out.into())),
                _ => out.push(c),
            }
        }
    }

    fn number(&mut self, position: usize) -> Result<Value, CompileError> {
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.idx += 1;
        }
        text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.idx += 1;
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = self.peek_at(1).filter(|c| *c == '+' || *c == '-');
            let digit_at = if sign.is_some() { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('e');
                self.idx += 1;
                if let Some(sign) = sign {
                    text.push(sign);
                    self.idx += 1;
                }
                text.push_str(&self.take_while(|c| c.is_ascii_digit()));
            }
        }
        if self.peek().is_some_and(|c| is_ident_char(c) || c == '.') {
            let rest = self.take_while(|c| is_ident_char(c) || c == '.');
            return Err(CompileError::literal(
                position,
                format!("invalid number '{text}{rest}'"),
            ));
        }
        if is_float {
            match text.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Value::Float(v)),
                _ => Err(CompileError::literal(position, format!("invalid number '{text}'"))),
            }
        } else {
            text.parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| CompileError::literal(position, format!("integer '{text}' out of range")))
        }
    }
}

fn keyword_literal(word: &str) -> Option<Value> {
    match word.to_ascii_lowercase().as_str() {
        "true" => Some(Value::Boolean(true)),
        "false" => Some(Value::Boolean(false)),
        "null" | "none" => Some(Value::Null),
        _ => None,
    }
}

fn is_keyword(word: &str, keyword: &str) -> bool {
    word.eq_ignore_ascii_case(keyword)
}

struct Parser {
    tokens: Vec<Spanned>,
    idx: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.idx)
    }

    fn position(&self) -> usize {
        self.peek().map(|t| t.position).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.idx).cloned();
        self.idx += 1;
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Spanned { token: Token::Ident(w), .. }) if is_keyword(w, keyword))
    }

    fn parse(mut self) -> Result<Expr, CompileError> {
        let expr = self.or_expr()?;
        if let Some(extra) = self.peek() {
            return Err(CompileError::syntax(
                extra.position,
                "expected 'and', 'or' or end of filter",
            ));
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, CompileError> {
        let mut children = vec![self.and_expr()?];
        while self.at_keyword("or") {
            self.idx += 1;
            children.push(self.and_expr()?);
        }
        Ok(Expr::any(children))
    }

    fn and_expr(&mut self) -> Result<Expr, CompileError> {
        let mut children = vec![self.unary()?];
        while self.at_keyword("and") {
            self.idx += 1;
            children.push(self.unary()?);
        }
        Ok(Expr::all(children))
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(CompileError::syntax(
                self.position(),
                format!("filter nesting exceeds {MAX_EXPR_DEPTH} levels"),
            ));
        }
        let expr = if self.at_keyword("not") {
            self.idx += 1;
            self.unary()?.not()
        } else if matches!(self.peek(), Some(Spanned { token: Token::LParen, .. })) {
            self.idx += 1;
            let inner = self.or_expr()?;
            match self.next() {
                Some(Spanned { token: Token::RParen, .. }) => inner,
                Some(other) => return Err(CompileError::syntax(other.position, "expected ')'")),
                None => return Err(CompileError::syntax(self.end, "unbalanced '('")),
            }
        } else {
            self.comparison()?
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        let Some(Spanned { token, position }) = self.next() else {
            return Err(CompileError::syntax(self.end, "expected a comparison"));
        };
        let field = match token {
            Token::Ident(word)
                if !RESERVED_WORDS.iter().any(|k| is_keyword(&word, k)) =>
            {
                word
            }
            Token::Literal(_) => {
                return Err(CompileError::syntax(
                    position,
                    "a comparison must start with a field name",
                ));
            }
            Token::RParen => return Err(CompileError::syntax(position, "unbalanced ')'")),
            _ => return Err(CompileError::syntax(position, "expected a field name")),
        };

        let op = match self.next() {
            Some(Spanned { token: Token::Op(op), .. }) => op,
            Some(Spanned { token: Token::Ident(word), position })
                if UNSUPPORTED_KEYWORDS.iter().any(|k| is_keyword(&word, k)) =>
            {
                return Err(CompileError::UnsupportedOperator {
                    operator: word,
                    position,
                });
            }
            Some(other) => {
                return Err(CompileError::syntax(
                    other.position,
                    format!("expected a comparison operator after '{field}'"),
                ));
            }
            None => {
                return Err(CompileError::syntax(
                    self.end,
                    format!("expected a comparison operator after '{field}'"),
                ));
            }
        };

        let value = match self.next() {
            Some(Spanned { token: Token::Literal(value), .. }) => value,
            Some(Spanned { token: Token::Ident(word), position }) => match keyword_literal(&word) {
                Some(value) => value,
                None => {
                    return Err(CompileError::literal(
                        position,
                        format!("'{word}' is not a literal; quote strings"),
                    ));
                }
            },
            Some(other) => {
                return Err(CompileError::syntax(other.position, "expected a literal"));
            }
            None => return Err(CompileError::syntax(self.end, "expected a literal")),
        };

        Ok(Expr::Cmp { field, op, value })
    }
}

/// Compiles filter text into a predicate tree, or `None` for blank text.
///
/// `readable` reports whether the requester may read a field; every leaf must
/// name a stored field of `schema` that passes it.
pub fn compile_filter(
    schema: &KindSchema,
    text: &str,
    readable: impl Fn(&str) -> bool,
    limits: &QueryLimits,
) -> Result<Option<Expr>, CompileError> {
    if text.len() > limits.max_filter_len {
        return Err(CompileError::syntax(
            limits.max_filter_len,
            format!("filter longer than {} bytes", limits.max_filter_len),
        ));
    }
    if text.trim().is_empty() {
        return Ok(None);
    }
    let tokens = Lexer::new(text).tokenize()?;
    let expr = Parser {
        tokens,
        idx: 0,
        end: text.len(),
        depth: 0,
    }
    .parse()?;
    for field in expr.fields() {
        check_field(schema, field, &readable)?;
    }
    Ok(Some(expr))
}

fn check_field(
    schema: &KindSchema,
    field: &str,
    readable: &impl Fn(&str) -> bool,
) -> Result<(), CompileError> {
    if schema.stored_field(field).is_some() && readable(field) {
        Ok(())
    } else {
        Err(CompileError::unknown_field(field))
    }
}

fn is_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(is_ident_start) && chars.all(is_ident_char)
}

/// Compiles `field,-other,+third` into sort keys.
pub fn compile_sort(
    schema: &KindSchema,
    text: &str,
    readable: impl Fn(&str) -> bool,
) -> Result<Vec<SortKey>, CompileError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut keys: Vec<SortKey> = Vec::new();
    let mut position = 0;
    for segment in text.split(',') {
        let item = segment.trim();
        let (order, name) = match item.strip_prefix('-') {
            Some(rest) => (Order::Desc, rest.trim_start()),
            None => (Order::Asc, item.strip_prefix('+').unwrap_or(item).trim_start()),
        };
        if !is_field_name(name) {
            return Err(CompileError::syntax(
                position,
                format!("invalid sort item '{item}'"),
            ));
        }
        check_field(schema, name, &readable)?;
        if keys.iter().any(|k| k.field == name) {
            return Err(CompileError::syntax(
                position,
                format!("field '{name}' sorted twice"),
            ));
        }
        keys.push(SortKey {
            field: name.to_string(),
            order,
        });
        position += segment.len() + 1;
    }
    Ok(keys)
}

/// Compiles a comma-separated field selection. Readability is not checked
/// here: unreadable fields are hidden at projection time.
pub fn compile_fields(schema: &KindSchema, text: &str) -> Result<Vec<String>, CompileError> {
    let mut fields: Vec<String> = Vec::new();
    for name in text.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if schema.stored_field(name).is_none() {
            return Err(CompileError::unknown_field(name));
        }
        if !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    }
    Ok(fields)
}

fn parse_count(name: &str, text: &str) -> Result<usize, CompileError> {
    text.trim()
        .parse::<usize>()
        .map_err(|_| CompileError::InvalidPagination {
            reason: format!("{name} must be a non-negative integer, got '{text}'"),
        })
}

pub fn compile_pagination(
    params: &QueryParams,
    limits: &QueryLimits,
) -> Result<Pagination, CompileError> {
    let invalid = |reason: String| CompileError::InvalidPagination { reason };
    let paged = params.page.is_some() || params.size.is_some();
    let windowed = params.offset.is_some() || params.limit.is_some();
    if paged && windowed {
        return Err(invalid("use either page/size or offset/limit".into()));
    }

    let size_name = if windowed { "limit" } else { "size" };
    let size = match params.size.as_deref().or(params.limit.as_deref()) {
        Some(text) => parse_count(size_name, text)?,
        None => limits.default_page_size,
    };
    if size == 0 || size > limits.max_page_size {
        return Err(invalid(format!(
            "{size_name} must be between 1 and {}",
            limits.max_page_size
        )));
    }

    if windowed {
        let offset = match params.offset.as_deref() {
            Some(text) => parse_count("offset", text)?,
            None => 0,
        };
        return Ok(Pagination {
            offset,
            limit: size,
        });
    }
    let page = match params.page.as_deref() {
        Some(text) => parse_count("page", text)?,
        None => 1,
    };
    if page == 0 || page > limits.max_page {
        return Err(invalid(format!("page must be between 1 and {}", limits.max_page)));
    }
    Ok(Pagination::from_page(page, size))
}

/// Compiles every query parameter of a list request.
pub fn compile_query(
    schema: &KindSchema,
    params: &QueryParams,
    readable: impl Fn(&str) -> bool,
    limits: &QueryLimits,
) -> Result<CompiledQuery, CompileError> {
    let predicate = match params.filter.as_deref() {
        Some(text) => compile_filter(schema, text, &readable, limits)?,
        None => None,
    };
    let sort = match params.sort.as_deref() {
        Some(text) => compile_sort(schema, text, &readable)?,
        None => Vec::new(),
    };
    let fields = match params.fields.as_deref() {
        Some(text) => compile_fields(schema, text)?,
        None => Vec::new(),
    };
    let page = compile_pagination(params, limits)?;
    Ok(CompiledQuery {
        selection: Selection {
            predicate,
            sort,
            page,
        },
        fields,
    })
}
