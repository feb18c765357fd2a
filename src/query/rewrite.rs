//! AST-level rewriting: constant folding.

use std::mem;

use tracing::{debug, trace};

use super::ast::{Ast, Expr};
use super::errors::QueryError;
use super::eval::{evaluate, Row};
use super::functions::Executor;

fn is_constant(expr: &Expr) -> bool {
    matches!(expr, Expr::Literal { .. })
}

fn foldable(expr: &Expr, executor: &Executor) -> bool {
    match expr {
        Expr::Literal { .. } | Expr::Reference { .. } | Expr::BindParameter { .. } => false,
        Expr::Attribute { object, .. } => is_constant(object),
        Expr::Index { object, index } => is_constant(object) && is_constant(index),
        Expr::Unary { operand, .. } => is_constant(operand),
        Expr::Binary { left, right, .. } => is_constant(left) && is_constant(right),
        Expr::Ternary { .. } => false,
        Expr::Array { members } => members.iter().all(is_constant),
        Expr::Object { members } => members.iter().all(|member| is_constant(&member.value)),
        Expr::Call { name, args } => {
            executor.is_deterministic(name) && args.iter().all(is_constant)
        }
    }
}

impl Ast {
    /// Folds constant sub-expressions, children first.
    ///
    /// Expressions whose evaluation fails are left in place so the error
    /// surfaces only if execution reaches them. Allocation failure aborts.
    pub fn optimize(&mut self, executor: &Executor) -> Result<(), QueryError> {
        let empty = Row::default();
        let mut folded = 0usize;
        self.visit_expressions_mut(&mut |expr| {
            if let Expr::Ternary {
                condition,
                then,
                otherwise,
            } = expr
            {
                if let Some(value) = condition.constant() {
                    let branch = if value.is_truthy() { then } else { otherwise };
                    let chosen = mem::replace(branch.as_mut(), Expr::literal(false));
                    *expr = chosen;
                    folded += 1;
                }
                return Ok(());
            }
            if !foldable(expr, executor) {
                return Ok(());
            }
            match evaluate(expr, &empty, executor) {
                Ok(value) => {
                    *expr = Expr::Literal { value };
                    folded += 1;
                    Ok(())
                }
                Err(QueryError::OutOfMemory) => Err(QueryError::OutOfMemory),
                Err(err) => {
                    trace!(error = %err, "constant expression left unfolded");
                    Ok(())
                }
            }
        })?;
        debug!(folded, "ast optimized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::arena::StringArena;
    use crate::query::ast::{Statement, Terminal};
    use crate::query::parser::Parser;
    use crate::query::value::Value;
    use serde_json::json;

    fn optimized(text: &str) -> Ast {
        let mut arena = StringArena::new();
        let mut ast = Parser::parse(text, &mut arena).unwrap();
        ast.optimize(&Executor::new()).unwrap();
        ast
    }

    fn returned(ast: &Ast) -> &Expr {
        match &ast.terminal {
            Some(Terminal::Return { expr, .. }) => expr,
            _ => panic!("expected RETURN"),
        }
    }

    #[test]
    fn folds_nested_constants() {
        let ast = optimized("RETURN { a: 1 + 2, b: UPPER('x'), c: [1, 2][1] }");
        assert_eq!(
            returned(&ast).constant().map(Value::to_json),
            Some(json!({"a": 3, "b": "X", "c": 2}))
        );
    }

    #[test]
    fn keeps_variables_and_non_deterministic_calls() {
        let ast = optimized("FOR x IN [1] LET r = RAND() RETURN x + 1");
        assert!(returned(&ast).constant().is_none());
        assert!(matches!(
            &ast.statements[1],
            Statement::Let { expr: Expr::Call { .. }, .. }
        ));
        assert!(matches!(
            &ast.statements[0],
            Statement::For { source: crate::query::ast::ForSource::Expr(Expr::Literal { .. }), .. }
        ));
    }

    #[test]
    fn failing_constants_stay_unfolded() {
        let ast = optimized("RETURN 1 / 0");
        assert!(matches!(returned(&ast), Expr::Binary { .. }));
    }

    #[test]
    fn constant_ternary_picks_branch() {
        let ast = optimized("FOR x IN [1] RETURN 1 > 2 ? 'no' : x");
        assert!(matches!(returned(&ast), Expr::Reference { .. }));
    }
}
