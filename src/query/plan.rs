use crate::catalog::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum nesting depth for filter expressions.
pub const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    pub fn from_symbol(symbol: &str) -> Option<CmpOp> {
        match symbol {
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Lte),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Gte),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        }
    }
}

/// Compiled predicate tree. `And`/`Or` are n-ary and never directly contain
/// a connective of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Expr {
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn cmp(field: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Expr {
        Expr::Cmp {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Conjunction of `children`, flattening nested conjunctions.
    pub fn all(children: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Expr::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Expr::And(Vec::new()))
        } else {
            Expr::And(flat)
        }
    }

    /// Disjunction of `children`, flattening nested disjunctions.
    pub fn any(children: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Expr::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Expr::Or(Vec::new()))
        } else {
            Expr::Or(flat)
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Cmp { .. } => 1,
            Expr::Not(inner) => 1 + inner.depth(),
            Expr::And(children) | Expr::Or(children) => {
                1 + children.iter().map(Expr::depth).max().unwrap_or(0)
            }
        }
    }

    /// Leaf field names, in tree order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Cmp { field, .. } => out.push(field),
            Expr::Not(inner) => inner.collect_fields(out),
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
        }
    }

    /// Order-independent form: connective children are sorted and
    /// duplicates removed, so `a and b` and `b and a` canonicalize equally.
    pub fn canonical(&self) -> Expr {
        match self {
            Expr::Cmp { .. } => self.clone(),
            Expr::Not(inner) => Expr::Not(Box::new(inner.canonical())),
            Expr::And(children) => Self::canonical_children(children, Expr::all),
            Expr::Or(children) => Self::canonical_children(children, Expr::any),
        }
    }

    fn canonical_children(children: &[Expr], join: fn(Vec<Expr>) -> Expr) -> Expr {
        // Joining first flattens connectives exposed by canonicalizing children.
        let joined = join(children.iter().map(Expr::canonical).collect());
        match joined {
            Expr::And(mut flat) => {
                flat.sort();
                flat.dedup();
                join(flat)
            }
            Expr::Or(mut flat) => {
                flat.sort();
                flat.dedup();
                join(flat)
            }
            other => other,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, parent_is_and: bool) -> fmt::Result {
        match self {
            Expr::Or(_) if parent_is_and => write!(f, "({self})"),
            _ => write!(f, "{self}"),
        }
    }
}

/// Filter-text rendering; compiling the output yields the same tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Cmp { field, op, value } => write!(f, "{field} {} {value}", op.symbol()),
            Expr::Not(inner) => write!(f, "not ({inner})"),
            Expr::And(children) | Expr::Or(children) => {
                let is_and = matches!(self, Expr::And(_));
                let joiner = if is_and { " and " } else { " or " };
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(joiner)?;
                    }
                    child.fmt_child(f, is_and)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub order: Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    /// One-based page number of `size` rows.
    pub fn from_page(page: usize, size: usize) -> Self {
        Self {
            offset: page.saturating_sub(1).saturating_mul(size),
            limit: size,
        }
    }

    pub fn page_number(&self) -> usize {
        if self.limit == 0 {
            1
        } else {
            self.offset / self.limit + 1
        }
    }
}

/// What the storage executor needs to run a list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub predicate: Option<Expr>,
    pub sort: Vec<SortKey>,
    pub page: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub selection: Selection,
    /// Requested fields, deduplicated; empty means every field.
    pub fields: Vec<String>,
}

impl CompiledQuery {
    /// Narrows the selection to rows whose `field` equals `value`.
    pub fn restrict_to(mut self, field: &str, value: Value) -> Self {
        let link = Expr::cmp(field, CmpOp::Eq, value);
        self.selection.predicate = Some(match self.selection.predicate.take() {
            Some(user) => Expr::all(vec![link, user]),
            None => link,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{CmpOp, Expr, Pagination};

    fn leaf(field: &str, v: i64) -> Expr {
        Expr::cmp(field, CmpOp::Eq, v)
    }

    #[test]
    fn connectives_flatten_on_construction() {
        let nested = Expr::all(vec![Expr::all(vec![leaf("a", 1), leaf("b", 2)]), leaf("c", 3)]);
        assert_eq!(nested, Expr::And(vec![leaf("a", 1), leaf("b", 2), leaf("c", 3)]));
        assert_eq!(Expr::any(vec![leaf("a", 1)]), leaf("a", 1));
    }

    #[test]
    fn canonical_ignores_clause_order_and_duplicates() {
        let left = Expr::all(vec![leaf("b", 2), leaf("a", 1), leaf("b", 2)]);
        let right = Expr::all(vec![leaf("a", 1), leaf("b", 2)]);
        assert_eq!(left.canonical(), right.canonical());
        let or_left = Expr::any(vec![right.clone(), leaf("z", 0)]);
        let or_right = Expr::any(vec![leaf("z", 0), left]);
        assert_eq!(or_left.canonical(), or_right.canonical());
    }

    #[test]
    fn display_parenthesizes_or_under_and() {
        let expr = Expr::all(vec![
            Expr::any(vec![leaf("a", 1), leaf("b", 2)]),
            leaf("c", 3).not(),
        ]);
        assert_eq!(expr.to_string(), "(a == 1 or b == 2) and not (c == 3)");
        assert_eq!(expr.depth(), 3);
        assert_eq!(expr.fields(), vec!["a", "b", "c"]);
    }

    #[test]
    fn pagination_maps_pages_to_offsets() {
        let page = Pagination::from_page(3, 5);
        assert_eq!((page.offset, page.limit), (10, 5));
        assert_eq!(page.page_number(), 3);
        assert_eq!(Pagination::from_page(0, 5).offset, 0);
    }
}
