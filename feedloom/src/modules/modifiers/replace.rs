//! Text replacement modifier.
//!
//! # Configuration
//!
//! ```yaml
//! modifiers:
//!   - type: replace_text
//!     options:
//!       field: title
//!       old: "[ad]"
//!       new: ""
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use std::sync::Arc;

use crate::config::{ConfigSpec, HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::{Error, FieldValue, Modifier, Post};

#[derive(Deserialize)]
struct ReplaceTextOptions {
    field: String,
    old: String,
    new: String,
}

/// Rewrites one string field of every post.
pub struct ReplaceText;

#[async_trait]
impl Modifier for ReplaceText {
    async fn apply(&self, posts: Vec<Post>, options: &Value) -> Result<Vec<Post>, Error> {
        let options: ReplaceTextOptions = serde_yaml::from_value(options.clone())?;

        let mut result = Vec::with_capacity(posts.len());
        for mut post in posts {
            let value = post.fields.get(&options.field).ok_or_else(|| {
                Error::Modifier(format!(
                    "post {} has no field {}",
                    post.post_id, options.field
                ))
            })?;
            let text = value.as_str().ok_or_else(|| {
                Error::Modifier(format!(
                    "field {} of post {} is not a string",
                    options.field, post.post_id
                ))
            })?;
            let replaced = text.replace(&options.old, &options.new);
            let _ = post
                .fields
                .insert(options.field.clone(), FieldValue::Str(replaced));
            result.push(post);
        }
        Ok(result)
    }
}

/// Registers the `replace_text` modifier.
pub(super) fn register_replace_text(registry: &mut HandlerRegistry) -> Result<(), Error> {
    let config = "type: object
required:
  - field
  - old
  - new
properties:
  field:
    type: string
  old:
    type: string
  new:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    registry.register(
        HandlerKind::Modifier,
        "replace_text",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Modifier(Arc::new(ReplaceText)))),
            init_options: None,
            call_options: Some(conf_spec),
        },
    )
}
