//! RSS/Atom feed parser.

use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::utils::text::make_hash_tags;
use crate::{Error, FieldValue, Parser, Post};

/// Parses RSS and Atom documents into posts. Parsing is CPU-bound and runs
/// on the blocking pool.
pub struct RssParser;

#[async_trait]
impl Parser for RssParser {
    async fn parse(&self, text: &str, _options: &Value) -> Result<Vec<Post>, Error> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let text = text.to_string();
        tokio::task::spawn_blocking(move || parse_feed(&text))
            .await
            .map_err(|e| Error::Parse(format!("feed parsing task failed: {e}")))?
    }
}

fn parse_feed(text: &str) -> Result<Vec<Post>, Error> {
    let feed = feed_rs::parser::parse(text.as_bytes())
        .map_err(|e| Error::Parse(format!("{e}")))?;

    let mut posts = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let url = entry
            .links
            .first()
            .map(|link| link.href.clone())
            .unwrap_or_default();
        let comments_url = entry
            .links
            .iter()
            .find(|link| matches!(link.rel.as_deref(), Some("replies") | Some("comments")))
            .map(|link| link.href.clone())
            .unwrap_or_default();
        let post_id = if entry.id.is_empty() {
            clean_post_id(&url)
        } else {
            entry.id.clone()
        };
        if post_id.is_empty() {
            continue;
        }
        let post_tags: Vec<String> = entry
            .categories
            .iter()
            .map(|category| category.term.to_lowercase().replace(' ', "_"))
            .collect();

        let mut fields = BTreeMap::new();
        let _ = fields.insert(
            "title".to_string(),
            FieldValue::Str(entry.title.map(|t| t.content).unwrap_or_default()),
        );
        let _ = fields.insert("url".to_string(), FieldValue::Str(url));
        let _ = fields.insert(
            "comments_url".to_string(),
            FieldValue::Str(comments_url),
        );
        let _ = fields.insert(
            "post_tags".to_string(),
            FieldValue::Str(post_tags.join("; ")),
        );
        let _ = fields.insert(
            "post_hash_tags".to_string(),
            FieldValue::Str(make_hash_tags(&post_tags).join(" ")),
        );

        posts.push(Post {
            post_id,
            source_tags: Vec::new(),
            fields,
        });
    }

    Ok(posts)
}

fn clean_post_id(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

/// Registers the `rss` parser.
pub(super) fn register_rss(registry: &mut HandlerRegistry) -> Result<(), Error> {
    registry.register(
        HandlerKind::Parser,
        "rss",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Parser(Arc::new(RssParser)))),
            init_options: None,
            call_options: None,
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <item>
      <guid>tag:example.com,2024:one</guid>
      <title>First post</title>
      <link>https://example.com/one</link>
      <category>Rust Lang</category>
      <category>news</category>
    </item>
    <item>
      <title>Second post</title>
      <link>https://example.com/two/</link>
    </item>
  </channel>
</rss>"#;

    #[tokio::test]
    async fn parses_entries_into_posts() {
        let posts = RssParser
            .parse(FEED, &Value::Null)
            .await
            .unwrap();
        assert_eq!(posts.len(), 2);

        let first = &posts[0];
        assert_eq!(first.post_id, "tag:example.com,2024:one");
        assert_eq!(
            first.fields.get("title"),
            Some(&FieldValue::Str("First post".into()))
        );
        assert_eq!(
            first.fields.get("url"),
            Some(&FieldValue::Str("https://example.com/one".into()))
        );
        assert_eq!(
            first.fields.get("post_tags"),
            Some(&FieldValue::Str("rust_lang; news".into()))
        );
        assert_eq!(
            first.fields.get("post_hash_tags"),
            Some(&FieldValue::Str("#rust_lang #news".into()))
        );
    }

    #[tokio::test]
    async fn empty_input_yields_empty_list() {
        let posts = RssParser.parse("", &Value::Null).await.unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn garbage_input_is_a_parse_error() {
        let result = RssParser.parse("not a feed at all", &Value::Null).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn clean_post_id_strips_scheme_and_trailing_slash() {
        assert_eq!(clean_post_id("https://example.com/two/"), "example.com/two");
    }

    #[test]
    fn register_plugin() {
        let mut registry = HandlerRegistry::new();
        register_rss(&mut registry).unwrap();
    }
}
