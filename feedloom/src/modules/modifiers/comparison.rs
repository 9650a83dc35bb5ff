//! Comparison filter modifier.
//!
//! Keeps posts whose field satisfies a configured comparison. Runs before
//! deduplication, so posts it drops are never marked processed.
//!
//! # Configuration
//!
//! ```yaml
//! modifiers:
//!   - type: compare_and_filter
//!     options:
//!       field: score
//!       field_type: integer
//!       operator: ">"
//!       value: "10"
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{ConfigSpec, HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::{Error, Modifier, Post};

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
enum OperatorType {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
}

impl OperatorType {
    fn matches(&self, ordering: Ordering) -> bool {
        match self {
            OperatorType::Equal => ordering == Ordering::Equal,
            OperatorType::NotEqual => ordering != Ordering::Equal,
            OperatorType::GreaterThan => ordering == Ordering::Greater,
            OperatorType::LessThan => ordering == Ordering::Less,
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone, Copy)]
enum ComparisonValueType {
    #[default]
    #[serde(rename = "string")]
    String,
    #[serde(rename = "integer")]
    Integer,
}

#[derive(Deserialize)]
struct ComparisonOptions {
    field: String,
    operator: OperatorType,
    value: String,
    #[serde(default)]
    field_type: ComparisonValueType,
}

/// Filters posts by comparing one field against a configured value.
pub struct CompareAndFilter;

#[async_trait]
impl Modifier for CompareAndFilter {
    async fn apply(&self, posts: Vec<Post>, options: &Value) -> Result<Vec<Post>, Error> {
        let options: ComparisonOptions = serde_yaml::from_value(options.clone())?;

        let mut kept = Vec::with_capacity(posts.len());
        for post in posts {
            if post_matches(&post, &options)? {
                kept.push(post);
            }
        }
        Ok(kept)
    }
}

fn post_matches(post: &Post, options: &ComparisonOptions) -> Result<bool, Error> {
    let field = post.fields.get(&options.field).ok_or_else(|| {
        Error::Modifier(format!(
            "post {} has no field {}",
            post.post_id, options.field
        ))
    })?;

    let ordering = match options.field_type {
        ComparisonValueType::String => field.to_string().cmp(&options.value),
        ComparisonValueType::Integer => {
            let left = field.as_i64().ok_or_else(|| {
                Error::Modifier(format!(
                    "field {} of post {} is not an integer",
                    options.field, post.post_id
                ))
            })?;
            let right: i64 = options.value.parse().map_err(|_| {
                Error::Modifier(format!("comparison value {} is not an integer", options.value))
            })?;
            left.cmp(&right)
        }
    };

    Ok(options.operator.matches(ordering))
}

/// Registers the `compare_and_filter` modifier.
pub(super) fn register_compare_and_filter(registry: &mut HandlerRegistry) -> Result<(), Error> {
    let config = r#"type: object
required:
  - field
  - operator
  - value
properties:
  field:
    type: string
  operator:
    type: string
    enum: ["=", "!=", ">", "<"]
  value:
    type: string
  field_type:
    type: string
    enum: ["string", "integer"]"#;
    let conf_spec = ConfigSpec::from_schema(config)?;

    registry.register(
        HandlerKind::Modifier,
        "compare_and_filter",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Modifier(Arc::new(CompareAndFilter)))),
            init_options: None,
            call_options: Some(conf_spec),
        },
    )
}
