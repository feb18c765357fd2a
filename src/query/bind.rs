//! Bind parameter injection.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use tracing::trace;

use crate::types::ErrorCode;

use super::arena::ArenaStr;
use super::ast::{Ast, CollectionRef, Expr};
use super::errors::QueryError;
use super::value::Value;

fn bind_error(code: ErrorCode, message: String) -> QueryError {
    QueryError::BindParameter { code, message }
}

impl Ast {
    /// Replaces `@name` expressions with literal values and `@@name`
    /// collection references with names.
    ///
    /// `params` must be a JSON object (keys `name` and `@name`) or `null`.
    /// Every referenced parameter needs a value and every supplied value must
    /// be referenced.
    pub fn inject_bind_parameters(&mut self, params: &JsonValue) -> Result<(), QueryError> {
        let supplied: BTreeMap<&str, &JsonValue> = match params {
            JsonValue::Null => BTreeMap::new(),
            JsonValue::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            _ => {
                return Err(QueryError::application(
                    ErrorCode::BadParameter,
                    "bind parameters must be an object",
                ))
            }
        };

        for name in &self.bind_parameters {
            if !supplied.contains_key(name.as_str()) {
                return Err(bind_error(
                    ErrorCode::BindParameterMissing,
                    format!("no value specified for declared bind parameter '{name}'"),
                ));
            }
        }
        for name in &self.collection_parameters {
            match supplied.get(format!("@{name}").as_str()) {
                None => {
                    return Err(bind_error(
                        ErrorCode::BindParameterMissing,
                        format!("no value specified for declared bind parameter '@{name}'"),
                    ))
                }
                Some(JsonValue::String(value)) if !value.is_empty() => {}
                Some(_) => {
                    return Err(bind_error(
                        ErrorCode::BindParameterType,
                        format!("bind parameter '@{name}' has an invalid value or type"),
                    ))
                }
            }
        }
        for key in supplied.keys() {
            let declared = match key.strip_prefix('@') {
                Some(collection) => self.collection_parameters.contains(collection),
                None => self.bind_parameters.contains(*key),
            };
            if !declared {
                return Err(bind_error(
                    ErrorCode::BindParameterUndeclared,
                    format!("bind parameter '{key}' was not declared in the query"),
                ));
            }
        }

        self.visit_expressions_mut(&mut |expr| {
            if let Expr::BindParameter { name } = expr {
                let value = supplied
                    .get(name.as_str())
                    .map_or(Value::Null, |json| Value::from_json(json));
                *expr = Expr::Literal { value };
            }
            Ok::<(), QueryError>(())
        })?;
        self.visit_collections_mut(&mut |collection| {
            if let CollectionRef::Parameter(name) = collection {
                if let Some(JsonValue::String(value)) = supplied.get(format!("@{name}").as_str()) {
                    *collection = CollectionRef::Name(ArenaStr::new(value));
                }
            }
            Ok::<(), QueryError>(())
        })?;
        trace!(parameters = supplied.len(), "bind parameters injected");
        Ok(())
    }
}
