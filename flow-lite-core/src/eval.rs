use crate::error::EvalError;
use crate::types::VarBag;
use rhai::{Dynamic, Engine, Scope};

/// Evaluates guard and assignment expressions against a variable bag.
///
/// Implementations must be pure: no side effects, no I/O, deterministic for
/// a given `(expression, bag)`. An empty expression is `true` for guards and
/// the empty set for assignments.
pub trait Evaluator: Send + Sync {
    /// Evaluate a guard expression to a boolean.
    fn eval_bool(&self, expr: &str, vars: &VarBag) -> Result<bool, EvalError>;

    /// Evaluate an assignment expression to a list of principal ids. A bare
    /// string result is treated as a singleton list.
    fn eval_ids(&self, expr: &str, vars: &VarBag) -> Result<Vec<String>, EvalError>;
}

/// Sandboxed [rhai](https://rhai.rs) expression evaluator.
///
/// Expressions come from process definitions, which are untrusted at load
/// time: the engine is capped on operations, expression depth, call levels
/// and value sizes, and registers no file or network access.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(50_000);
        engine.set_max_expr_depths(32, 32);
        engine.set_max_call_levels(8);
        engine.set_max_string_size(4_096);
        engine.set_max_array_size(1_024);
        engine.set_max_map_size(256);
        Self { engine }
    }

    /// Inject every bag variable into a fresh scope.
    fn scope_from(vars: &VarBag) -> Result<Scope<'static>, EvalError> {
        let mut scope = Scope::new();
        for (name, value) in vars {
            let dynamic =
                rhai::serde::to_dynamic(value).map_err(|e| EvalError::Execution(e.to_string()))?;
            scope.push_dynamic(name.clone(), dynamic);
        }
        Ok(scope)
    }

    fn eval_dynamic(&self, expr: &str, vars: &VarBag) -> Result<Dynamic, EvalError> {
        let mut scope = Self::scope_from(vars)?;
        self.engine
            .eval_expression_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|e| {
                if matches!(*e, rhai::EvalAltResult::ErrorParsing(..)) {
                    EvalError::Compile(e.to_string())
                } else {
                    EvalError::Execution(e.to_string())
                }
            })
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for RhaiEvaluator {
    fn eval_bool(&self, expr: &str, vars: &VarBag) -> Result<bool, EvalError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(true);
        }
        let value = self.eval_dynamic(expr, vars)?;
        value.as_bool().map_err(|actual| EvalError::Type {
            expected: "bool",
            got: actual.to_string(),
        })
    }

    fn eval_ids(&self, expr: &str, vars: &VarBag) -> Result<Vec<String>, EvalError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Vec::new());
        }
        let value = self.eval_dynamic(expr, vars)?;

        if value.is_string() {
            let id = value.into_string().map_err(|actual| EvalError::Type {
                expected: "string",
                got: actual.to_string(),
            })?;
            return Ok(vec![id]);
        }

        if value.is_array() {
            let items = value.into_array().map_err(|actual| EvalError::Type {
                expected: "array",
                got: actual.to_string(),
            })?;
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                let id = item.into_string().map_err(|actual| EvalError::Type {
                    expected: "string",
                    got: actual.to_string(),
                })?;
                ids.push(id);
            }
            return Ok(ids);
        }

        Err(EvalError::Type {
            expected: "string or string array",
            got: value.type_name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(pairs: &[(&str, serde_json::Value)]) -> VarBag {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_guard_is_true() {
        let eval = RhaiEvaluator::new();
        assert!(eval.eval_bool("", &VarBag::new()).unwrap());
        assert!(eval.eval_bool("   ", &VarBag::new()).unwrap());
    }

    #[test]
    fn guard_sees_bag_variables() {
        let eval = RhaiEvaluator::new();
        let vars = bag(&[("action", json!("pass")), ("day", json!(3))]);

        assert!(eval
            .eval_bool(r#"action == "pass" && day >= 3"#, &vars)
            .unwrap());
        assert!(!eval
            .eval_bool(r#"action == "pass" && day >= 5"#, &vars)
            .unwrap());
    }

    #[test]
    fn unknown_variable_is_an_execution_error() {
        let eval = RhaiEvaluator::new();
        let err = eval
            .eval_bool(r#"action == "pass""#, &VarBag::new())
            .unwrap_err();
        assert!(matches!(err, EvalError::Execution(_)));
    }

    #[test]
    fn non_bool_guard_is_a_type_error() {
        let eval = RhaiEvaluator::new();
        let err = eval.eval_bool("1 + 1", &VarBag::new()).unwrap_err();
        assert!(matches!(err, EvalError::Type { expected: "bool", .. }));
    }

    #[test]
    fn ids_accept_string_and_array_results() {
        let eval = RhaiEvaluator::new();
        let vars = bag(&[("bzr", json!("T002"))]);

        assert_eq!(eval.eval_ids("bzr", &vars).unwrap(), vec!["T002"]);
        assert_eq!(eval.eval_ids("[bzr]", &vars).unwrap(), vec!["T002"]);
        assert_eq!(
            eval.eval_ids(r#"["S001", "S002"]"#, &VarBag::new()).unwrap(),
            vec!["S001", "S002"]
        );
        assert!(eval.eval_ids("", &VarBag::new()).unwrap().is_empty());
    }

    #[test]
    fn non_string_ids_are_a_type_error() {
        let eval = RhaiEvaluator::new();
        assert!(eval.eval_ids("42", &VarBag::new()).is_err());
        assert!(eval.eval_ids("[1, 2]", &VarBag::new()).is_err());
    }

    #[test]
    fn oversized_values_are_rejected() {
        let eval = RhaiEvaluator::new();
        // 4096 elements against a 1024-element array cap.
        let expr = format!("[{}]", "0,".repeat(4_096));
        assert!(eval.eval_ids(&expr, &VarBag::new()).is_err());
    }

    #[test]
    fn runaway_expression_hits_the_operation_cap() {
        let eval = RhaiEvaluator::new();
        let vars = bag(&[("x", json!(1))]);
        // 60,000 variable additions against the 50,000-operation cap. The
        // operands reference a scope variable so the optimizer cannot fold
        // the chain into a constant at parse time.
        let expr = "x".to_string() + "+x".repeat(60_000).as_str();
        let err = eval.eval_bool(&expr, &vars).unwrap_err();
        assert!(matches!(err, EvalError::Execution(_)));
    }
}
