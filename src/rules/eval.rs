//! Evaluates a compiled rule AST against one ranked item's bound fields
//! (spec §4.8). Evaluation never fails: unsupported operand combinations
//! (e.g. `"a" + 1`) fall back to `Value::Null`, which is always falsy.

use super::ast::{BinOp, Expr, Identifier, UnaryOp};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Num(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Null => false,
        }
    }
}

/// The eight fields a rule expression may reference, bound for one evaluation
/// (spec §4.8 identifier set).
#[derive(Debug, Clone, Copy, Default)]
pub struct Bindings {
    pub rank: f64,
    pub score: f64,
    pub liquidity_edge: f64,
    pub momentum_edge: f64,
    pub volatility_edge: f64,
    pub microstructure_edge: f64,
    pub anomaly_residual: f64,
    pub manipulation_score: f64,
}

impl Bindings {
    fn resolve(&self, ident: Identifier) -> f64 {
        match ident {
            Identifier::Rank => self.rank,
            Identifier::Score => self.score,
            Identifier::LiquidityEdge => self.liquidity_edge,
            Identifier::MomentumEdge => self.momentum_edge,
            Identifier::VolatilityEdge => self.volatility_edge,
            Identifier::MicrostructureEdge => self.microstructure_edge,
            Identifier::AnomalyResidual => self.anomaly_residual,
            Identifier::ManipulationScore => self.manipulation_score,
        }
    }
}

pub fn eval(expr: &Expr, bindings: &Bindings) -> Value {
    match expr {
        Expr::Num(n) => Value::Num(*n),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Null => Value::Null,
        Expr::Ident(ident) => Value::Num(bindings.resolve(*ident)),
        Expr::Unary(op, inner) => eval_unary(*op, eval(inner, bindings)),
        Expr::Binary(lhs, op, rhs) => eval_binary(*op, eval(lhs, bindings), eval(rhs, bindings)),
    }
}

fn eval_unary(op: UnaryOp, value: Value) -> Value {
    match op {
        UnaryOp::Not => Value::Bool(!value.is_truthy()),
        UnaryOp::Plus => value.as_f64().map(Value::Num).unwrap_or(Value::Null),
        UnaryOp::Neg => value.as_f64().map(|n| Value::Num(-n)).unwrap_or(Value::Null),
    }
}

fn numeric_cmp(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    lhs.as_f64().zip(rhs.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Str(h), Value::Str(n)) => h.contains(n.as_str()),
        _ => false,
    }
}

fn eval_binary(op: BinOp, lhs: Value, rhs: Value) -> Value {
    use BinOp::*;
    match op {
        Add => match (&lhs, &rhs) {
            (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}")),
            _ => lhs.as_f64().zip(rhs.as_f64()).map(|(a, b)| Value::Num(a + b)).unwrap_or(Value::Null),
        },
        Sub => lhs.as_f64().zip(rhs.as_f64()).map(|(a, b)| Value::Num(a - b)).unwrap_or(Value::Null),
        Mul => lhs.as_f64().zip(rhs.as_f64()).map(|(a, b)| Value::Num(a * b)).unwrap_or(Value::Null),
        Div => lhs.as_f64().zip(rhs.as_f64()).and_then(|(a, b)| (b != 0.0).then(|| Value::Num(a / b))).unwrap_or(Value::Null),
        Mod => lhs.as_f64().zip(rhs.as_f64()).and_then(|(a, b)| (b != 0.0).then(|| Value::Num(a % b))).unwrap_or(Value::Null),
        Pow => lhs.as_f64().zip(rhs.as_f64()).map(|(a, b)| Value::Num(a.powf(b))).unwrap_or(Value::Null),
        Eq => Value::Bool(values_equal(&lhs, &rhs)),
        Ne => Value::Bool(!values_equal(&lhs, &rhs)),
        Lt => Value::Bool(numeric_cmp(&lhs, &rhs).is_some_and(|o| o.is_lt())),
        Le => Value::Bool(numeric_cmp(&lhs, &rhs).is_some_and(|o| o.is_le())),
        Gt => Value::Bool(numeric_cmp(&lhs, &rhs).is_some_and(|o| o.is_gt())),
        Ge => Value::Bool(numeric_cmp(&lhs, &rhs).is_some_and(|o| o.is_ge())),
        In => Value::Bool(contains(&rhs, &lhs)),
        NotIn => Value::Bool(!contains(&rhs, &lhs)),
        And => Value::Bool(lhs.is_truthy() && rhs.is_truthy()),
        Or => Value::Bool(lhs.is_truthy() || rhs.is_truthy()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parser::parse;

    fn bindings() -> Bindings {
        Bindings {
            rank: 3.0,
            score: 42.0,
            liquidity_edge: 1.2,
            momentum_edge: -0.5,
            volatility_edge: 0.0,
            microstructure_edge: 0.8,
            anomaly_residual: 0.1,
            manipulation_score: 60.0,
        }
    }

    #[test]
    fn simple_comparison_matches() {
        let expr = parse("score > 10").unwrap();
        assert!(eval(&expr, &bindings()).is_truthy());
    }

    #[test]
    fn boolean_combination() {
        let expr = parse("score > 10 and manipulation_score < 50").unwrap();
        assert!(!eval(&expr, &bindings()).is_truthy());
    }

    #[test]
    fn arithmetic_and_unary_negation() {
        let expr = parse("-rank + 5 == 2").unwrap();
        assert!(eval(&expr, &bindings()).is_truthy());
    }

    #[test]
    fn division_by_zero_is_falsy_not_a_panic() {
        let expr = parse("(score / 0) == 1").unwrap();
        assert!(!eval(&expr, &bindings()).is_truthy());
    }
}
