//! Expression evaluation against a feature and the current zoom.
//!
//! Evaluation never fails: malformed operands, unsupported operators and
//! type mismatches all degrade to [`Value::Null`], so a stylesheet written
//! for a newer renderer still paints everything this one understands.
//! The evaluator is pure; the same inputs always produce the same value.

use serde_json::Value as Json;
use tessella_mvt::{Feature, MetaValue};

use super::expression::{Expression, Operator};

/// A value produced by expression evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(v) => Value::Bool(*v),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(_) => Value::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value. Only `Int` and `Double` are numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Truthiness following the loose boolean conversion of the style DSL.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Double(v) => *v != 0.0,
            Value::String(v) => !v.is_empty() && v != "false",
            Value::Array(v) => !v.is_empty(),
        }
    }

    /// Value equality with numeric coercion between `Int` and `Double`.
    /// Any other cross-type comparison is unequal.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.loosely_equals(b))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<&MetaValue> for Value {
    fn from(value: &MetaValue) -> Self {
        match value {
            MetaValue::String(v) => Value::String(v.clone()),
            MetaValue::Int(v) => Value::Int(*v),
            MetaValue::Double(v) => Value::Double(*v),
            MetaValue::Bool(v) => Value::Bool(*v),
            MetaValue::Null => Value::Null,
        }
    }
}

/// Inputs available to expression evaluation besides the expression tree.
/// `feature` may be absent for expressions that do not consult metadata,
/// such as a background paint property.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub feature: Option<&'a Feature>,
    pub map_zoom: i32,
    pub viewport_zoom: f32,
}

impl<'a> EvalContext<'a> {
    pub fn new(feature: Option<&'a Feature>, map_zoom: i32, viewport_zoom: f32) -> Self {
        Self {
            feature,
            map_zoom,
            viewport_zoom,
        }
    }

    fn metadata(&self, key: &str) -> Option<&'a MetaValue> {
        self.feature.and_then(|feature| feature.metadata.get(key))
    }
}

/// Evaluates `expression` in `ctx`.
pub fn resolve(expression: &Expression, ctx: &EvalContext) -> Value {
    match expression {
        Expression::Literal(value) => value.clone(),
        Expression::Op(op, args) => resolve_op(op, args, ctx),
        Expression::Case { arms, default } => {
            for (condition, value) in arms {
                if resolve(condition, ctx).is_truthy() {
                    return resolve(value, ctx);
                }
            }
            resolve(default, ctx)
        }
        Expression::Match {
            input,
            arms,
            default,
        } => {
            let input = resolve(input, ctx);
            for (labels, value) in arms {
                if labels.iter().any(|label| label.loosely_equals(&input)) {
                    return resolve(value, ctx);
                }
            }
            resolve(default, ctx)
        }
        Expression::Interpolate { input, stops } => interpolate(input, stops, ctx),
    }
}

fn resolve_op(op: &Operator, args: &[Expression], ctx: &EvalContext) -> Value {
    match op {
        Operator::Get => match resolve_arg(args, 0, ctx) {
            Value::String(key) => ctx.metadata(&key).map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        Operator::Has | Operator::NotHas => {
            let present = match resolve_arg(args, 0, ctx) {
                Value::String(key) => ctx.metadata(&key).is_some(),
                _ => false,
            };
            Value::Bool(present != matches!(op, Operator::NotHas))
        }
        Operator::In | Operator::NotIn => {
            let Some(needle) = args.first().map(|arg| resolve(arg, ctx)) else {
                return Value::Null;
            };
            let found = args[1..]
                .iter()
                .any(|candidate| resolve(candidate, ctx).loosely_equals(&needle));
            Value::Bool(found != matches!(op, Operator::NotIn))
        }
        Operator::Eq | Operator::Ne => {
            if args.len() != 2 {
                return Value::Null;
            }
            let equal =
                equality_operand(&args[0], ctx).loosely_equals(&equality_operand(&args[1], ctx));
            Value::Bool(equal != matches!(op, Operator::Ne))
        }
        Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
            if args.len() != 2 {
                return Value::Null;
            }
            let lhs = resolve(&args[0], ctx).as_f64();
            let rhs = resolve(&args[1], ctx).as_f64();
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => Value::Bool(match op {
                    Operator::Gt => lhs > rhs,
                    Operator::Lt => lhs < rhs,
                    Operator::Ge => lhs >= rhs,
                    _ => lhs <= rhs,
                }),
                _ => Value::Null,
            }
        }
        Operator::All => {
            for arg in args {
                if !resolve(arg, ctx).is_truthy() {
                    return Value::Bool(false);
                }
            }
            Value::Bool(true)
        }
        Operator::Any => {
            for arg in args {
                if resolve(arg, ctx).is_truthy() {
                    return Value::Bool(true);
                }
            }
            Value::Bool(false)
        }
        Operator::Coalesce => {
            for arg in args {
                let value = resolve(arg, ctx);
                if !value.is_null() {
                    return value;
                }
            }
            Value::Null
        }
        Operator::Zoom => Value::Double(f64::from(ctx.map_zoom)),
        Operator::Unknown(tag) => {
            log::trace!("ignoring unsupported expression operator {tag}");
            Value::Null
        }
    }
}

fn resolve_arg(args: &[Expression], index: usize, ctx: &EvalContext) -> Value {
    args.get(index).map(|arg| resolve(arg, ctx)).unwrap_or(Value::Null)
}

/// `$type` is not part of feature metadata; as an equality operand it
/// selects the feature's geometry kind name.
fn equality_operand(expression: &Expression, ctx: &EvalContext) -> Value {
    if let Expression::Literal(Value::String(name)) = expression {
        if name == "$type" {
            return ctx
                .feature
                .map(|feature| Value::String(feature.kind().type_name().to_string()))
                .unwrap_or(Value::Null);
        }
    }
    resolve(expression, ctx)
}

fn interpolate(input: &Expression, stops: &[(f64, Expression)], ctx: &EvalContext) -> Value {
    let input = resolve(input, ctx)
        .as_f64()
        .unwrap_or(f64::from(ctx.map_zoom));
    let stop_value = |expression: &Expression| resolve(expression, ctx).as_f64();

    // Stops are non-empty and strictly increasing by construction.
    let (first_stop, first_value) = &stops[0];
    let (last_stop, last_value) = &stops[stops.len() - 1];

    if input <= *first_stop {
        return stop_value(first_value).map(Value::Double).unwrap_or(Value::Null);
    }
    if input >= *last_stop {
        return stop_value(last_value).map(Value::Double).unwrap_or(Value::Null);
    }

    let upper = stops
        .iter()
        .position(|(stop, _)| input <= *stop)
        .expect("input is below the last stop");
    let (stop_a, value_a) = &stops[upper - 1];
    let (stop_b, value_b) = &stops[upper];

    match (stop_value(value_a), stop_value(value_b)) {
        (Some(a), Some(b)) => {
            Value::Double(a + (input - stop_a) * (b - a) / (stop_b - stop_a))
        }
        _ => Value::Null,
    }
}
