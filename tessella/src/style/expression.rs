//! The JSON-encoded expression language of stylesheets.
//!
//! An expression is a JSON array whose first element is the operator tag
//! and whose remaining elements are the operands; any other JSON value is
//! a literal. Expressions are parsed once into a tree and evaluated many
//! times per frame by the [evaluator](super::evaluator).

use serde_json::Value as Json;

use super::evaluator::Value;
use crate::error::TessellaError;

/// Operator tags handled by generic operator nodes.
///
/// `case`, `match` and `interpolate` have their own [`Expression`]
/// variants because their operand lists are structured, not uniform.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Get,
    Has,
    NotHas,
    In,
    NotIn,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    All,
    Any,
    Coalesce,
    Zoom,
    /// Forward-compatibility escape hatch: evaluates to null.
    Unknown(String),
}

impl Operator {
    fn from_tag(tag: &str) -> Operator {
        match tag {
            "get" => Operator::Get,
            "has" => Operator::Has,
            "!has" => Operator::NotHas,
            "in" => Operator::In,
            "!in" => Operator::NotIn,
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Ge,
            "<=" => Operator::Le,
            "all" => Operator::All,
            "any" => Operator::Any,
            "coalesce" => Operator::Coalesce,
            "zoom" => Operator::Zoom,
            other => Operator::Unknown(other.to_string()),
        }
    }
}

/// A parsed style expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A literal scalar or list of literals.
    Literal(Value),
    /// A generic operator node with recursively parsed operands.
    Op(Operator, Vec<Expression>),
    /// `["case", cond, value, …, default]`
    Case {
        arms: Vec<(Expression, Expression)>,
        default: Box<Expression>,
    },
    /// `["match", input, label(s), value, …, default]`
    Match {
        input: Box<Expression>,
        arms: Vec<(Vec<Value>, Expression)>,
        default: Box<Expression>,
    },
    /// `["interpolate", ["linear"], input, stop, value, …]` with strictly
    /// increasing stops.
    Interpolate {
        input: Box<Expression>,
        stops: Vec<(f64, Expression)>,
    },
}

impl Expression {
    /// Parses an expression from its JSON form.
    ///
    /// Arrays not starting with a string are taken as literal lists; that
    /// is how `in` haystacks and `match` label groups are written.
    pub fn from_json(json: &Json) -> Result<Expression, TessellaError> {
        let Json::Array(items) = json else {
            return Ok(Expression::Literal(Value::from_json(json)));
        };
        let Some(Json::String(tag)) = items.first() else {
            return Ok(Expression::Literal(Value::from_json(json)));
        };

        match tag.as_str() {
            "case" => Self::parse_case(&items[1..]),
            "match" => Self::parse_match(&items[1..]),
            "interpolate" => Self::parse_interpolate(&items[1..]),
            _ => {
                let args = items[1..]
                    .iter()
                    .map(Expression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expression::Op(Operator::from_tag(tag), args))
            }
        }
    }

    fn parse_case(args: &[Json]) -> Result<Expression, TessellaError> {
        if args.len() % 2 != 1 {
            return Err(TessellaError::Style(
                "case expects condition/value pairs followed by a default".into(),
            ));
        }

        let arms = args[..args.len() - 1]
            .chunks_exact(2)
            .map(|pair| Ok((Expression::from_json(&pair[0])?, Expression::from_json(&pair[1])?)))
            .collect::<Result<Vec<_>, TessellaError>>()?;
        let default = Expression::from_json(&args[args.len() - 1])?;

        Ok(Expression::Case {
            arms,
            default: Box::new(default),
        })
    }

    fn parse_match(args: &[Json]) -> Result<Expression, TessellaError> {
        if args.len() < 2 || args.len() % 2 != 0 {
            return Err(TessellaError::Style(
                "match expects an input, label/value pairs and a default".into(),
            ));
        }

        let input = Expression::from_json(&args[0])?;
        let arms = args[1..args.len() - 1]
            .chunks_exact(2)
            .map(|pair| {
                let labels = match &pair[0] {
                    Json::Array(items) => items.iter().map(Value::from_json).collect(),
                    other => vec![Value::from_json(other)],
                };
                Ok((labels, Expression::from_json(&pair[1])?))
            })
            .collect::<Result<Vec<_>, TessellaError>>()?;
        let default = Expression::from_json(&args[args.len() - 1])?;

        Ok(Expression::Match {
            input: Box::new(input),
            arms,
            default: Box::new(default),
        })
    }

    fn parse_interpolate(args: &[Json]) -> Result<Expression, TessellaError> {
        let kind = args
            .first()
            .and_then(|k| k.as_array())
            .and_then(|k| k.first())
            .and_then(Json::as_str);
        if kind != Some("linear") {
            return Err(TessellaError::Style(
                "only linear interpolation is supported".into(),
            ));
        }
        if args.len() < 4 || args.len() % 2 != 0 {
            return Err(TessellaError::Style(
                "interpolate expects an input followed by stop/value pairs".into(),
            ));
        }

        let input = Expression::from_json(&args[1])?;
        let stops = args[2..]
            .chunks_exact(2)
            .map(|pair| {
                let stop = pair[0].as_f64().ok_or_else(|| {
                    TessellaError::Style("interpolation stop is not a number".into())
                })?;
                Ok((stop, Expression::from_json(&pair[1])?))
            })
            .collect::<Result<Vec<_>, TessellaError>>()?;

        if stops.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(TessellaError::Style(
                "interpolation stops must be strictly increasing".into(),
            ));
        }

        Ok(Expression::Interpolate {
            input: Box::new(input),
            stops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_json_parses_as_literal() {
        assert_eq!(
            Expression::from_json(&json!("grass")).unwrap(),
            Expression::Literal(Value::String("grass".into()))
        );
        assert_eq!(
            Expression::from_json(&json!(2.5)).unwrap(),
            Expression::Literal(Value::Double(2.5))
        );
    }

    #[test]
    fn array_without_tag_parses_as_literal_list() {
        let parsed = Expression::from_json(&json!([1, 2, 3])).unwrap();
        assert_eq!(
            parsed,
            Expression::Literal(Value::Array(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3)
            ]))
        );
    }

    #[test]
    fn unknown_tags_are_preserved() {
        let parsed = Expression::from_json(&json!(["within", "region"])).unwrap();
        let Expression::Op(Operator::Unknown(tag), args) = parsed else {
            panic!("expected unknown operator node");
        };
        assert_eq!(tag, "within");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn rejects_unordered_interpolation_stops() {
        let json = json!(["interpolate", ["linear"], ["zoom"], 8, 1, 3, 2]);
        assert!(Expression::from_json(&json).is_err());
    }

    #[test]
    fn rejects_non_linear_interpolation() {
        let json = json!(["interpolate", ["exponential", 2], ["zoom"], 3, 1, 8, 2]);
        assert!(Expression::from_json(&json).is_err());
    }

    #[test]
    fn rejects_case_without_default() {
        let json = json!(["case", ["has", "class"], 1]);
        assert!(Expression::from_json(&json).is_err());
    }
}
