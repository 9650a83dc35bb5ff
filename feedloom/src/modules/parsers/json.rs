//! JSON endpoint parser.
//!
//! Extracts posts from arbitrary JSON documents with jmespath expressions,
//! so one parser covers reddit listings, JSON feeds and ad-hoc APIs.
//!
//! # Configuration
//!
//! ```yaml
//! parser_type: json
//! parser_options:
//!   items: "data.children[*].data"
//!   post_id: "id"
//!   fields:
//!     title: "title"
//!     url: "url"
//!     score: "score"
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConfigSpec, HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::{Error, FieldValue, Parser, Post};

#[derive(Deserialize)]
struct JsonParserOptions {
    items: String,
    post_id: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

/// jmespath-driven JSON parser. Expression evaluation is CPU-bound and runs
/// on the blocking pool.
pub struct JsonParser;

#[async_trait]
impl Parser for JsonParser {
    async fn parse(&self, text: &str, options: &Value) -> Result<Vec<Post>, Error> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let options: JsonParserOptions = serde_yaml::from_value(options.clone())?;
        let text = text.to_string();
        tokio::task::spawn_blocking(move || parse_document(&text, &options))
            .await
            .map_err(|e| Error::Parse(format!("json parsing task failed: {e}")))?
    }
}

fn parse_document(text: &str, options: &JsonParserOptions) -> Result<Vec<Post>, Error> {
    let mut runtime = jmespath::Runtime::new();
    runtime.register_builtin_functions();

    let items_expr = runtime
        .compile(&options.items)
        .map_err(|e| Error::Parse(format!("{e}")))?;
    let post_id_expr = runtime
        .compile(&options.post_id)
        .map_err(|e| Error::Parse(format!("{e}")))?;
    let mut field_exprs = Vec::with_capacity(options.fields.len());
    for (name, expr) in &options.fields {
        let compiled = runtime
            .compile(expr)
            .map_err(|e| Error::Parse(format!("{name}: {e}")))?;
        field_exprs.push((name.clone(), compiled));
    }

    let data = jmespath::Variable::from_json(text).map_err(|e| Error::Parse(format!("{e}")))?;
    let items = items_expr
        .search(data)
        .map_err(|e| Error::Parse(format!("{e}")))?;
    let items = match items.as_array() {
        Some(items) => items.clone(),
        None if items.is_null() => Vec::new(),
        None => {
            return Err(Error::Parse(format!(
                "items expression {} did not select an array",
                options.items
            )))
        }
    };

    let mut posts = Vec::with_capacity(items.len());
    for item in items {
        let post_id = post_id_expr
            .search(item.clone())
            .map_err(|e| Error::Parse(format!("{e}")))?;
        let post_id = match variable_to_field(&post_id) {
            Some(value) => value.to_string(),
            None => {
                return Err(Error::Parse(format!(
                    "post_id expression {} selected nothing",
                    options.post_id
                )))
            }
        };

        let mut fields = BTreeMap::new();
        for (name, expr) in &field_exprs {
            let result = expr
                .search(item.clone())
                .map_err(|e| Error::Parse(format!("{e}")))?;
            if let Some(value) = variable_to_field(&result) {
                let _ = fields.insert(name.clone(), value);
            }
        }

        posts.push(Post {
            post_id,
            source_tags: Vec::new(),
            fields,
        });
    }

    Ok(posts)
}

fn variable_to_field(variable: &jmespath::Variable) -> Option<FieldValue> {
    if let Some(s) = variable.as_string() {
        return Some(FieldValue::Str(s.clone()));
    }
    if let Some(n) = variable.as_number() {
        if n.fract() == 0.0 {
            return Some(FieldValue::Int(n as i64));
        }
        return Some(FieldValue::Float(n));
    }
    if let Some(b) = variable.as_boolean() {
        return Some(FieldValue::Bool(b));
    }
    None
}

/// Registers the `json` parser.
pub(super) fn register_json(registry: &mut HandlerRegistry) -> Result<(), Error> {
    let config = "type: object
required:
  - items
  - post_id
properties:
  items:
    type: string
  post_id:
    type: string
  fields:
    type: object
    additionalProperties:
      type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    registry.register(
        HandlerKind::Parser,
        "json",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Parser(Arc::new(JsonParser)))),
            init_options: None,
            call_options: Some(conf_spec),
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;

    const LISTING: &str = r#"{
      "data": {
        "children": [
          {"data": {"id": "abc", "title": "First", "url": "https://r.com/abc", "score": 42}},
          {"data": {"id": "def", "title": "Second", "url": "https://r.com/def", "score": 3}}
        ]
      }
    }"#;

    fn options() -> Value {
        serde_yaml::from_str(
            r#"
items: "data.children[*].data"
post_id: "id"
fields:
  title: "title"
  url: "url"
  score: "score"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn extracts_posts_with_typed_fields() {
        let posts = JsonParser.parse(LISTING, &options()).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].post_id, "abc");
        assert_eq!(
            posts[0].fields.get("title"),
            Some(&FieldValue::Str("First".into()))
        );
        assert_eq!(posts[0].fields.get("score"), Some(&FieldValue::Int(42)));
    }

    #[tokio::test]
    async fn empty_input_yields_empty_list() {
        let posts = JsonParser.parse("", &options()).await.unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn missing_items_path_yields_empty_list() {
        let posts = JsonParser.parse("{}", &options()).await.unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn non_array_items_selection_is_a_parse_error() {
        let result = JsonParser
            .parse(r#"{"data": {"children": 5}}"#, &options())
            .await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn register_plugin() {
        let mut registry = HandlerRegistry::new();
        register_json(&mut registry).unwrap();
    }
}
