//! Stylesheet data model.
//!
//! A stylesheet is a JSON document with a `layers` array; each layer
//! carries a filter plus paint/layout properties written in the expression
//! language of [`expression`]. Layers keep their declaration order, which
//! is also their paint order.

pub mod evaluator;
pub mod expression;

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::TessellaError;
use evaluator::{resolve, EvalContext, Value};
use expression::Expression;

/// How a layer's features are painted. Anything this renderer does not
/// support is preserved as `Other` and skipped at paint time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    Background,
    Fill,
    Line,
    Symbol,
    Other(String),
}

impl LayerKind {
    fn from_tag(tag: &str) -> LayerKind {
        match tag {
            "background" => LayerKind::Background,
            "fill" => LayerKind::Fill,
            "line" => LayerKind::Line,
            "symbol" => LayerKind::Symbol,
            other => LayerKind::Other(other.to_string()),
        }
    }
}

/// A single style layer.
#[derive(Debug, Clone)]
pub struct StyleLayer {
    pub id: String,
    pub kind: LayerKind,
    /// Name of the tile layer this style layer draws features from.
    /// Absent for background layers.
    pub source_layer: Option<String>,
    pub min_zoom: i32,
    pub max_zoom: i32,
    pub filter: Option<Expression>,
    pub paint: BTreeMap<String, Expression>,
    pub layout: BTreeMap<String, Expression>,
}

impl StyleLayer {
    fn from_json(json: &Json) -> Result<StyleLayer, TessellaError> {
        let object = json
            .as_object()
            .ok_or_else(|| TessellaError::Style("style layer is not an object".into()))?;

        let filter = match object.get("filter") {
            Some(filter) => Some(Expression::from_json(filter)?),
            None => None,
        };

        Ok(StyleLayer {
            id: object
                .get("id")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: LayerKind::from_tag(object.get("type").and_then(Json::as_str).unwrap_or("")),
            source_layer: object
                .get("source-layer")
                .and_then(Json::as_str)
                .map(str::to_string),
            min_zoom: object.get("minzoom").and_then(Json::as_i64).unwrap_or(0) as i32,
            max_zoom: object.get("maxzoom").and_then(Json::as_i64).unwrap_or(24) as i32,
            filter,
            paint: property_map(object.get("paint"))?,
            layout: property_map(object.get("layout"))?,
        })
    }

    /// Whether this layer applies at the given map zoom, honoring the zoom
    /// bounds and the `visibility` layout property.
    pub fn is_visible_at(&self, zoom: i32) -> bool {
        if zoom < self.min_zoom || zoom > self.max_zoom {
            return false;
        }
        match self.layout.get("visibility") {
            Some(Expression::Literal(Value::String(visibility))) => visibility != "none",
            _ => true,
        }
    }

    /// Whether the context's feature passes this layer's filter. A layer
    /// without a filter matches everything.
    pub fn matches(&self, ctx: &EvalContext) -> bool {
        match &self.filter {
            Some(filter) => resolve(filter, ctx).is_truthy(),
            None => true,
        }
    }

    /// Resolves the paint property `name`, or null when the layer does not
    /// define it. A null result means "do not apply this property".
    pub fn paint_value(&self, name: &str, ctx: &EvalContext) -> Value {
        self.paint
            .get(name)
            .map(|expression| resolve(expression, ctx))
            .unwrap_or(Value::Null)
    }

    /// Resolves the layout property `name`, or null when absent.
    pub fn layout_value(&self, name: &str, ctx: &EvalContext) -> Value {
        self.layout
            .get(name)
            .map(|expression| resolve(expression, ctx))
            .unwrap_or(Value::Null)
    }
}

fn property_map(json: Option<&Json>) -> Result<BTreeMap<String, Expression>, TessellaError> {
    let Some(json) = json else {
        return Ok(BTreeMap::new());
    };
    let object = json
        .as_object()
        .ok_or_else(|| TessellaError::Style("property block is not an object".into()))?;

    object
        .iter()
        .map(|(name, value)| Ok((name.clone(), Expression::from_json(value)?)))
        .collect()
}

/// An ordered list of style layers parsed from a GL style JSON document.
#[derive(Debug, Clone, Default)]
pub struct StyleSheet {
    pub name: Option<String>,
    pub version: Option<i64>,
    pub layers: Vec<StyleLayer>,
}

impl StyleSheet {
    /// Parses a stylesheet from raw JSON text.
    pub fn parse(text: &str) -> Result<StyleSheet, TessellaError> {
        let json: Json =
            serde_json::from_str(text).map_err(|err| TessellaError::Style(err.to_string()))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &Json) -> Result<StyleSheet, TessellaError> {
        let layers = json
            .get("layers")
            .and_then(Json::as_array)
            .ok_or_else(|| TessellaError::Style("stylesheet has no layers array".into()))?;

        Ok(StyleSheet {
            name: json.get("name").and_then(Json::as_str).map(str::to_string),
            version: json.get("version").and_then(Json::as_i64),
            layers: layers
                .iter()
                .map(StyleLayer::from_json)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    /// Layers drawing features of the named tile layer, in paint order.
    pub fn layers_for_source<'a>(
        &'a self,
        source_layer: &'a str,
    ) -> impl Iterator<Item = &'a StyleLayer> + 'a {
        self.layers
            .iter()
            .filter(move |layer| layer.source_layer.as_deref() == Some(source_layer))
    }
}
