//! Expresiones de la definición.
//!
//! Árbol cerrado y serializable usado por condiciones de `Choice`, scripts,
//! mapeos de entrada/salida, business keys y reglas de estado. La evaluación
//! es recursiva y los operadores booleanos cortocircuitan.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::errors::EngineError;
use crate::model::context::navigate;
use crate::model::ExecutionContext;
use crate::service::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Expr {
    Literal(Value),
    /// Path dentro del contexto (`a.b.0`).
    Var(String),
    /// Path dentro de la salida del estado actual; vacío = salida completa.
    Output(String),
    /// Path dentro del error del estado actual (`kind`, `message`); vacío = objeto completo.
    Error(String),
    Exists(String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Len(Box<Expr>),
    Object(IndexMap<String, Expr>),
    Array(Vec<Expr>),
}

/// Lo que una expresión puede leer.
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    pub context: &'a ExecutionContext,
    pub output: Option<&'a Value>,
    pub error: Option<&'a ServiceError>,
}

impl<'a> EvalScope<'a> {
    pub fn new(context: &'a ExecutionContext) -> Self {
        Self { context,
               output: None,
               error: None }
    }

    pub fn with_output(mut self, output: Option<&'a Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, error: Option<&'a ServiceError>) -> Self {
        self.error = error;
        self
    }
}

impl Expr {
    pub fn lit(v: impl Into<Value>) -> Self { Expr::Literal(v.into()) }

    pub fn var(path: impl Into<String>) -> Self { Expr::Var(path.into()) }

    pub fn output(path: impl Into<String>) -> Self { Expr::Output(path.into()) }

    pub fn error(path: impl Into<String>) -> Self { Expr::Error(path.into()) }

    pub fn exists(path: impl Into<String>) -> Self { Expr::Exists(path.into()) }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Expr)>) -> Self {
        Expr::Object(fields.into_iter().map(|(k, e)| (k.into(), e)).collect())
    }

    pub fn array(items: Vec<Expr>) -> Self { Expr::Array(items) }

    pub fn negate(self) -> Self { Expr::Not(Box::new(self)) }

    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut items) => {
                items.push(other);
                Expr::And(items)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut items) => {
                items.push(other);
                Expr::Or(items)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    fn cmp(self, op: CmpOp, other: Expr) -> Self { Expr::Compare(op, Box::new(self), Box::new(other)) }

    pub fn equals(self, other: Expr) -> Self { self.cmp(CmpOp::Eq, other) }
    pub fn not_equals(self, other: Expr) -> Self { self.cmp(CmpOp::Ne, other) }
    pub fn lt(self, other: Expr) -> Self { self.cmp(CmpOp::Lt, other) }
    pub fn le(self, other: Expr) -> Self { self.cmp(CmpOp::Le, other) }
    pub fn gt(self, other: Expr) -> Self { self.cmp(CmpOp::Gt, other) }
    pub fn ge(self, other: Expr) -> Self { self.cmp(CmpOp::Ge, other) }

    fn arith(self, op: ArithOp, other: Expr) -> Self { Expr::Arith(op, Box::new(self), Box::new(other)) }

    pub fn plus(self, other: Expr) -> Self { self.arith(ArithOp::Add, other) }
    pub fn minus(self, other: Expr) -> Self { self.arith(ArithOp::Sub, other) }
    pub fn times(self, other: Expr) -> Self { self.arith(ArithOp::Mul, other) }
    pub fn divided_by(self, other: Expr) -> Self { self.arith(ArithOp::Div, other) }

    pub fn len(self) -> Self { Expr::Len(Box::new(self)) }

    /// Evalúa la expresión. Variables ausentes valen `null`.
    pub fn eval(&self, scope: &EvalScope<'_>) -> Result<Value, EngineError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(path) => Ok(scope.context.get_path(path).cloned().unwrap_or(Value::Null)),
            Expr::Output(path) => Ok(scope.output.and_then(|o| lookup(o, path)).cloned().unwrap_or(Value::Null)),
            Expr::Error(path) => {
                let Some(err) = scope.error else { return Ok(Value::Null) };
                let as_json = serde_json::json!({ "kind": err.kind, "message": err.message, "outcome_unknown": err.outcome_unknown });
                Ok(lookup(&as_json, path).cloned().unwrap_or(Value::Null))
            }
            Expr::Exists(path) => Ok(Value::Bool(scope.context.get_path(path).is_some_and(|v| !v.is_null()))),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(scope)?))),
            Expr::And(items) => {
                for item in items {
                    if !is_truthy(&item.eval(scope)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if is_truthy(&item.eval(scope)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Compare(op, l, r) => compare(*op, &l.eval(scope)?, &r.eval(scope)?).map(Value::Bool),
            Expr::Arith(op, l, r) => arith(*op, &l.eval(scope)?, &r.eval(scope)?),
            Expr::Len(inner) => match inner.eval(scope)? {
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::Object(map) => Ok(Value::from(map.len())),
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Null => Ok(Value::from(0)),
                other => Err(EngineError::Expression(format!("len() not defined for {other}"))),
            },
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (k, e) in fields {
                    map.insert(k.clone(), e.eval(scope)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Array(items) => items.iter().map(|e| e.eval(scope)).collect::<Result<Vec<_>, _>>().map(Value::Array),
        }
    }

    /// Evalúa como condición.
    pub fn test(&self, scope: &EvalScope<'_>) -> Result<bool, EngineError> { self.eval(scope).map(|v| is_truthy(&v)) }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    navigate(root, path.split('.'))
}

/// `null`, `false`, `0`, `""` y colecciones vacías son falsos.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EngineError> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }
    match op {
        CmpOp::Eq => Ok(l == r),
        CmpOp::Ne => Ok(l != r),
        _ => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                _ => a >= b,
            }),
            _ => Err(EngineError::Expression(format!("cannot order {l} and {r}"))),
        },
    }
}

fn arith(op: ArithOp, l: &Value, r: &Value) -> Result<Value, EngineError> {
    if let (ArithOp::Add, Value::String(a), Value::String(b)) = (op, l, r) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let exact = match op {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
            ArithOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            ArithOp::Div => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(EngineError::Expression(format!("arithmetic on non-numbers {l} and {r}")));
    };
    let v = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Err(EngineError::Expression("division by zero".into()));
            }
            a / b
        }
    };
    Number::from_f64(v).map(Value::Number)
                       .ok_or_else(|| EngineError::Expression(format!("non-finite result {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext { ExecutionContext::from_json(&json!({"a": 1, "b": 2, "name": "x", "items": [1, 2, 3]})) }

    #[test]
    fn comparisons_and_logic() {
        let c = ctx();
        let s = EvalScope::new(&c);
        assert!(Expr::var("a").equals(Expr::lit(1)).test(&s).unwrap());
        assert!(Expr::var("a").lt(Expr::var("b")).and(Expr::var("name").equals(Expr::lit("x"))).test(&s).unwrap());
        assert!(!Expr::var("a").gt(Expr::lit(5)).or(Expr::var("missing").equals(Expr::lit(1))).test(&s).unwrap());
        assert!(Expr::exists("name").test(&s).unwrap());
        assert!(!Expr::exists("nope").test(&s).unwrap());
        assert!(Expr::var("a").equals(Expr::lit(1.0)).test(&s).unwrap());
    }

    #[test]
    fn and_short_circuits_before_type_error() {
        let c = ctx();
        let s = EvalScope::new(&c);
        let bad = Expr::var("name").lt(Expr::lit(1));
        assert!(bad.eval(&s).is_err());
        let guarded = Expr::lit(false).and(bad);
        assert_eq!(guarded.eval(&s).unwrap(), json!(false));
    }

    #[test]
    fn arithmetic_keeps_integers_when_exact() {
        let c = ctx();
        let s = EvalScope::new(&c);
        assert_eq!(Expr::var("a").plus(Expr::var("b")).eval(&s).unwrap(), json!(3));
        assert_eq!(Expr::var("a").divided_by(Expr::var("b")).eval(&s).unwrap(), json!(0.5));
        assert_eq!(Expr::var("name").plus(Expr::lit("y")).eval(&s).unwrap(), json!("xy"));
        assert!(Expr::var("a").divided_by(Expr::lit(0)).eval(&s).is_err());
    }

    #[test]
    fn overflowing_integer_division_falls_back_to_float() {
        let c = ctx();
        let s = EvalScope::new(&c);
        let v = Expr::lit(i64::MIN).divided_by(Expr::lit(-1)).eval(&s).unwrap();
        assert_eq!(v.as_f64(), Some(-(i64::MIN as f64)));
        assert_eq!(Expr::lit(i64::MIN).divided_by(Expr::lit(2)).eval(&s).unwrap(), json!(i64::MIN / 2));
    }

    #[test]
    fn output_and_error_are_visible() {
        let c = ctx();
        let out = json!({"code": "S", "data": [10]});
        let err = ServiceError::new("Timeout", "slow");
        let s = EvalScope::new(&c).with_output(Some(&out)).with_error(Some(&err));
        assert_eq!(Expr::output("data.0").eval(&s).unwrap(), json!(10));
        assert_eq!(Expr::output("").eval(&s).unwrap(), out);
        assert_eq!(Expr::error("kind").eval(&s).unwrap(), json!("Timeout"));
        assert_eq!(Expr::var("items").len().eval(&s).unwrap(), json!(3));
    }

    #[test]
    fn object_builder_preserves_field_order() {
        let c = ctx();
        let s = EvalScope::new(&c);
        let e = Expr::object([("z", Expr::var("a")), ("y", Expr::lit(true))]);
        let v = e.eval(&s).unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(v["z"], json!(1));
    }
}
