//! Abstract syntax tree for the query language.
//!
//! A query is a pipeline of statements (`FOR`, `FILTER`, `LET`, `SORT`,
//! `LIMIT`) closed by one terminal (`RETURN` or `INSERT`). Expressions and
//! plan nodes share these types, so everything here serializes to and from
//! JSON.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::arena::ArenaStr;
use super::value::Value;

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Minus,
    /// Arithmetic identity (numeric conversion check).
    Plus,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    /// `&&` / `AND`
    And,
    /// `||` / `OR`
    Or,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IN`
    In,
    /// `NOT IN`
    NotIn,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl BinaryOp {
    /// Operator as written in query text.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "IN",
            BinaryOp::NotIn => "NOT IN",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// One attribute of an object literal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMember {
    /// Attribute name.
    pub name: ArenaStr,
    /// Attribute value.
    pub value: Expr,
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Expr {
    /// Constant value.
    Literal {
        /// The value.
        value: Value,
    },
    /// Variable reference.
    Reference {
        /// Variable name.
        name: ArenaStr,
    },
    /// `@name`; replaced by a literal during bind parameter injection.
    BindParameter {
        /// Parameter name without the `@`.
        name: ArenaStr,
    },
    /// `object.name`
    Attribute {
        /// Accessed value.
        object: Box<Expr>,
        /// Attribute name.
        name: ArenaStr,
    },
    /// `object[index]`
    Index {
        /// Accessed value.
        object: Box<Expr>,
        /// Position or attribute name.
        index: Box<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `condition ? then : otherwise`
    Ternary {
        /// Condition.
        condition: Box<Expr>,
        /// Value when the condition is truthy.
        then: Box<Expr>,
        /// Value otherwise.
        otherwise: Box<Expr>,
    },
    /// Array literal.
    Array {
        /// Members in order.
        members: Vec<Expr>,
    },
    /// Object literal.
    Object {
        /// Members in source order; later duplicates win.
        members: Vec<ObjectMember>,
    },
    /// Function call; the name is stored upper-case.
    Call {
        /// Function name.
        name: ArenaStr,
        /// Arguments.
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Wraps a value.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    /// The value if this is a literal.
    pub fn constant(&self) -> Option<&Value> {
        match self {
            Expr::Literal { value } => Some(value),
            _ => None,
        }
    }

    /// Collects the names of variables the expression reads.
    pub fn collect_variables(&self, out: &mut BTreeSet<ArenaStr>) {
        self.walk(&mut |expr| {
            if let Expr::Reference { name } = expr {
                out.insert(name.clone());
            }
        });
    }

    /// Variables the expression reads.
    pub fn variables(&self) -> BTreeSet<ArenaStr> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    /// Whether evaluating the expression may raise an error: arithmetic,
    /// function calls and uninjected bind parameters.
    pub fn can_fail(&self) -> bool {
        let mut fails = false;
        self.walk(&mut |expr| {
            fails |= match expr {
                Expr::Unary { op, .. } => *op != UnaryOp::Not,
                Expr::Binary { op, .. } => matches!(
                    op,
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
                ),
                Expr::Call { .. } | Expr::BindParameter { .. } => true,
                _ => false,
            };
        });
        fails
    }

    /// Visits this expression and all sub-expressions, parents first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Literal { .. } | Expr::Reference { .. } | Expr::BindParameter { .. } => {}
            Expr::Attribute { object, .. } => object.walk(visit),
            Expr::Index { object, index } => {
                object.walk(visit);
                index.walk(visit);
            }
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                condition.walk(visit);
                then.walk(visit);
                otherwise.walk(visit);
            }
            Expr::Array { members } => {
                for member in members {
                    member.walk(visit);
                }
            }
            Expr::Object { members } => {
                for member in members {
                    member.value.walk(visit);
                }
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
        }
    }

    /// Mutable counterpart of [`Expr::walk`], children first.
    pub fn walk_mut<E>(&mut self, visit: &mut dyn FnMut(&mut Expr) -> Result<(), E>) -> Result<(), E> {
        match self {
            Expr::Literal { .. } | Expr::Reference { .. } | Expr::BindParameter { .. } => {}
            Expr::Attribute { object, .. } => object.walk_mut(visit)?,
            Expr::Index { object, index } => {
                object.walk_mut(visit)?;
                index.walk_mut(visit)?;
            }
            Expr::Unary { operand, .. } => operand.walk_mut(visit)?,
            Expr::Binary { left, right, .. } => {
                left.walk_mut(visit)?;
                right.walk_mut(visit)?;
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                condition.walk_mut(visit)?;
                then.walk_mut(visit)?;
                otherwise.walk_mut(visit)?;
            }
            Expr::Array { members } => {
                for member in members {
                    member.walk_mut(visit)?;
                }
            }
            Expr::Object { members } => {
                for member in members {
                    member.value.walk_mut(visit)?;
                }
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.walk_mut(visit)?;
                }
            }
        }
        visit(self)
    }
}

/// Collection named directly or through an `@@name` bind parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionRef {
    /// Literal collection name.
    Name(ArenaStr),
    /// Unresolved `@@name` parameter (name stored without `@@`).
    Parameter(ArenaStr),
}

impl CollectionRef {
    /// Resolved collection name, if bind injection already ran.
    pub fn name(&self) -> Option<&str> {
        match self {
            CollectionRef::Name(name) => Some(name),
            CollectionRef::Parameter(_) => None,
        }
    }
}

/// Source of a `FOR` loop.
#[derive(Clone, Debug, PartialEq)]
pub enum ForSource {
    /// Iterate a collection.
    Collection(CollectionRef),
    /// Iterate an array-valued expression.
    Expr(Expr),
}

/// One `SORT` criterion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortElement {
    /// Sort key.
    pub expr: Expr,
    /// Ascending unless `DESC` was given.
    pub ascending: bool,
}

/// Pipeline statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// `FOR variable IN source`
    For {
        /// Loop variable.
        variable: ArenaStr,
        /// What to iterate.
        source: ForSource,
    },
    /// `FILTER condition`
    Filter {
        /// Condition; rows for which it is falsy are dropped.
        condition: Expr,
    },
    /// `LET variable = expr`
    Let {
        /// Assigned variable.
        variable: ArenaStr,
        /// Assigned value.
        expr: Expr,
    },
    /// `SORT a [ASC|DESC], ...`
    Sort {
        /// Criteria, most significant first.
        elements: Vec<SortElement>,
    },
    /// `LIMIT [offset,] count`
    Limit {
        /// Rows to skip.
        offset: Expr,
        /// Rows to keep.
        count: Expr,
    },
}

/// The statement that ends a query.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    /// `RETURN [DISTINCT] expr`
    Return {
        /// Produced value.
        expr: Expr,
        /// Drop duplicate values.
        distinct: bool,
    },
    /// `INSERT expr INTO collection [OPTIONS {...}]`
    Insert {
        /// Document to insert.
        expr: Expr,
        /// Target collection.
        collection: CollectionRef,
        /// Count failed writes instead of failing the query.
        ignore_errors: bool,
    },
}

/// Parsed query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ast {
    /// Pipeline statements in source order.
    pub statements: Vec<Statement>,
    /// Closing statement; absent for the empty context used with
    /// serialized plans.
    pub terminal: Option<Terminal>,
    /// Value bind parameters referenced by the query text.
    pub bind_parameters: BTreeSet<String>,
    /// Collection bind parameters (`@@name`) referenced by the query text.
    pub collection_parameters: BTreeSet<String>,
}

impl Ast {
    /// AST without statements, used as context for serialized plans.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the AST has no terminal statement.
    pub fn is_empty(&self) -> bool {
        self.terminal.is_none()
    }

    /// Names of collections the query reads or writes. Unresolved
    /// collection parameters are skipped.
    pub fn collections(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for statement in &self.statements {
            if let Statement::For {
                source: ForSource::Collection(collection),
                ..
            } = statement
            {
                if let Some(name) = collection.name() {
                    out.insert(name.to_owned());
                }
            }
        }
        if let Some(Terminal::Insert { collection, .. }) = &self.terminal {
            if let Some(name) = collection.name() {
                out.insert(name.to_owned());
            }
        }
        out
    }

    /// Applies `visit` to every expression in the query, children first.
    pub fn visit_expressions_mut<E>(
        &mut self,
        visit: &mut dyn FnMut(&mut Expr) -> Result<(), E>,
    ) -> Result<(), E> {
        for statement in &mut self.statements {
            match statement {
                Statement::For {
                    source: ForSource::Expr(expr),
                    ..
                } => expr.walk_mut(visit)?,
                Statement::For { .. } => {}
                Statement::Filter { condition } => condition.walk_mut(visit)?,
                Statement::Let { expr, .. } => expr.walk_mut(visit)?,
                Statement::Sort { elements } => {
                    for element in elements {
                        element.expr.walk_mut(visit)?;
                    }
                }
                Statement::Limit { offset, count } => {
                    offset.walk_mut(visit)?;
                    count.walk_mut(visit)?;
                }
            }
        }
        match &mut self.terminal {
            Some(Terminal::Return { expr, .. }) | Some(Terminal::Insert { expr, .. }) => {
                expr.walk_mut(visit)
            }
            None => Ok(()),
        }
    }

    /// Applies `visit` to every collection reference.
    pub fn visit_collections_mut<E>(
        &mut self,
        visit: &mut dyn FnMut(&mut CollectionRef) -> Result<(), E>,
    ) -> Result<(), E> {
        for statement in &mut self.statements {
            if let Statement::For {
                source: ForSource::Collection(collection),
                ..
            } = statement
            {
                visit(collection)?;
            }
        }
        if let Some(Terminal::Insert { collection, .. }) = &mut self.terminal {
            visit(collection)?;
        }
        Ok(())
    }

    /// Compact JSON description, as returned by `Query::parse`.
    pub fn to_json(&self) -> serde_json::Value {
        let statements: Vec<serde_json::Value> = self
            .statements
            .iter()
            .map(|statement| match statement {
                Statement::For { variable, source } => match source {
                    ForSource::Collection(collection) => serde_json::json!({
                        "type": "for", "variable": variable, "collection": collection
                    }),
                    ForSource::Expr(expr) => serde_json::json!({
                        "type": "for", "variable": variable, "expression": expr
                    }),
                },
                Statement::Filter { condition } => {
                    serde_json::json!({"type": "filter", "expression": condition})
                }
                Statement::Let { variable, expr } => {
                    serde_json::json!({"type": "let", "variable": variable, "expression": expr})
                }
                Statement::Sort { elements } => {
                    serde_json::json!({"type": "sort", "elements": elements})
                }
                Statement::Limit { offset, count } => {
                    serde_json::json!({"type": "limit", "offset": offset, "count": count})
                }
            })
            .collect();
        let terminal = match &self.terminal {
            Some(Terminal::Return { expr, distinct }) => {
                serde_json::json!({"type": "return", "expression": expr, "distinct": distinct})
            }
            Some(Terminal::Insert {
                expr,
                collection,
                ignore_errors,
            }) => serde_json::json!({
                "type": "insert", "expression": expr, "collection": collection,
                "ignoreErrors": ignore_errors
            }),
            None => serde_json::Value::Null,
        };
        serde_json::json!({
            "statements": statements,
            "terminal": terminal,
            "bindParameters": self.bind_parameters,
            "collectionParameters": self.collection_parameters,
            "collections": self.collections(),
        })
    }
}
