//! Expression evaluation against a row of variable bindings.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::types::ErrorCode;

use super::arena::ArenaStr;
use super::ast::{BinaryOp, Expr, UnaryOp};
use super::errors::QueryError;
use super::functions::Executor;
use super::value::Value;

/// Variable bindings visible to an expression.
pub type Row = FxHashMap<ArenaStr, Value>;

/// Evaluates `expr` with the variables in `row`.
pub fn evaluate(expr: &Expr, row: &Row, executor: &Executor) -> Result<Value, QueryError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Reference { name } => row
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::internal(format!("variable '{name}' is not set"))),
        Expr::BindParameter { name } => Err(QueryError::internal(format!(
            "bind parameter '@{name}' was not injected"
        ))),
        Expr::Attribute { object, name } => Ok(evaluate(object, row, executor)?.attribute(name)),
        Expr::Index { object, index } => {
            let object = evaluate(object, row, executor)?;
            let index = evaluate(index, row, executor)?;
            Ok(object.index(&index))
        }
        Expr::Unary { op, operand } => unary(*op, evaluate(operand, row, executor)?),
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, row, executor)?;
            match op {
                BinaryOp::And if !left.is_truthy() => Ok(left),
                BinaryOp::Or if left.is_truthy() => Ok(left),
                BinaryOp::And | BinaryOp::Or => evaluate(right, row, executor),
                _ => binary(*op, left, evaluate(right, row, executor)?),
            }
        }
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            if evaluate(condition, row, executor)?.is_truthy() {
                evaluate(then, row, executor)
            } else {
                evaluate(otherwise, row, executor)
            }
        }
        Expr::Array { members } => {
            let mut out = Vec::new();
            out.try_reserve(members.len())?;
            for member in members {
                out.push(evaluate(member, row, executor)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object { members } => {
            let mut out = BTreeMap::new();
            for member in members {
                out.insert(
                    member.name.to_string(),
                    evaluate(&member.value, row, executor)?,
                );
            }
            Ok(Value::Object(out))
        }
        Expr::Call { name, args } => {
            let mut values = Vec::new();
            values.try_reserve(args.len())?;
            for arg in args {
                values.push(evaluate(arg, row, executor)?);
            }
            executor.call(name, &values)
        }
    }
}

fn arithmetic_error(op: &str, left: &Value, right: Option<&Value>) -> QueryError {
    let detail = match right {
        Some(right) => format!(
            "operator '{op}' applied to {} and {}",
            left.type_name(),
            right.type_name()
        ),
        None => format!("operator '{op}' applied to {}", left.type_name()),
    };
    QueryError::application(ErrorCode::InvalidArithmeticValue, detail)
}

fn unary(op: UnaryOp, operand: Value) -> Result<Value, QueryError> {
    match (op, &operand) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!operand.is_truthy())),
        (UnaryOp::Minus, Value::Number(n)) => Ok(Value::Number(-n)),
        (UnaryOp::Plus, Value::Number(n)) => Ok(Value::Number(*n)),
        (UnaryOp::Minus, _) => Err(arithmetic_error("-", &operand, None)),
        (UnaryOp::Plus, _) => Err(arithmetic_error("+", &operand, None)),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, QueryError> {
    let ordering = || left.compare(&right);
    let result = match op {
        BinaryOp::Eq => Value::Bool(ordering() == Ordering::Equal),
        BinaryOp::Ne => Value::Bool(ordering() != Ordering::Equal),
        BinaryOp::Lt => Value::Bool(ordering() == Ordering::Less),
        BinaryOp::Le => Value::Bool(ordering() != Ordering::Greater),
        BinaryOp::Gt => Value::Bool(ordering() == Ordering::Greater),
        BinaryOp::Ge => Value::Bool(ordering() != Ordering::Less),
        BinaryOp::In | BinaryOp::NotIn => {
            let found = match &right {
                Value::Array(items) => items.iter().any(|item| item.compare(&left).is_eq()),
                _ => false,
            };
            Value::Bool(found == (op == BinaryOp::In))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (Value::Number(a), Value::Number(b)) = (&left, &right) else {
                return Err(arithmetic_error(op.symbol(), &left, Some(&right)));
            };
            let (a, b) = (*a, *b);
            if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == 0.0 {
                return Err(QueryError::application(ErrorCode::DivisionByZero, ""));
            }
            Value::Number(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            })
        }
        BinaryOp::And | BinaryOp::Or => {
            return Err(QueryError::internal("logical operator reached strict evaluation"))
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::arena::StringArena;
    use crate::query::ast::Terminal;
    use crate::query::parser::Parser;

    fn eval_with(text: &str, row: &Row) -> Result<Value, QueryError> {
        let mut arena = StringArena::new();
        let ast = Parser::parse(text, &mut arena).map_err(QueryError::from)?;
        let Some(Terminal::Return { expr, .. }) = ast.terminal else {
            panic!("expected RETURN");
        };
        evaluate(&expr, row, &Executor::new())
    }

    fn eval(text: &str) -> Result<Value, QueryError> {
        eval_with(text, &Row::default())
    }

    #[test]
    fn arithmetic_and_comparison() -> Result<(), QueryError> {
        assert_eq!(eval("RETURN 1 + 2 * 3")?, Value::Number(7.0));
        assert_eq!(eval("RETURN 7 % 4")?, Value::Number(3.0));
        assert_eq!(eval("RETURN 'a' < 'b'")?, Value::Bool(true));
        assert_eq!(eval("RETURN null < false")?, Value::Bool(true));
        assert_eq!(eval("RETURN 2 IN [1, 2]")?, Value::Bool(true));
        assert_eq!(eval("RETURN 3 NOT IN [1, 2]")?, Value::Bool(true));
        Ok(())
    }

    #[test]
    fn logical_operators_short_circuit() -> Result<(), QueryError> {
        assert_eq!(eval("RETURN 0 && 1 / 0")?, Value::Number(0.0));
        assert_eq!(eval("RETURN 'x' || 1 / 0")?, Value::from("x"));
        assert_eq!(eval("RETURN true ? 'y' : 1 / 0")?, Value::from("y"));
        Ok(())
    }

    #[test]
    fn arithmetic_faults_carry_codes() {
        let err = eval("RETURN 1 / 0").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DivisionByZero);
        let err = eval("RETURN 'a' * 2").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArithmeticValue);
        assert_eq!(
            err.to_string(),
            "invalid arithmetic value: operator '*' applied to string and number"
        );
        let err = eval("RETURN -[1]").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArithmeticValue);
    }

    #[test]
    fn variables_and_access() -> Result<(), QueryError> {
        let mut arena = StringArena::new();
        let ast = Parser::parse("FOR d IN [{a: [10, 20]}] RETURN d.a[-1]", &mut arena)
            .map_err(QueryError::from)?;
        let Some(Terminal::Return { expr, .. }) = ast.terminal else {
            panic!("expected RETURN");
        };
        let mut row = Row::default();
        row.insert(
            ArenaStr::new("d"),
            Value::from_json(&serde_json::json!({"a": [10, 20]})),
        );
        assert_eq!(evaluate(&expr, &row, &Executor::new())?, Value::Number(20.0));
        Ok(())
    }
}
