//! Single-tick pipeline operations, shared by the worker loops and by tests
//! that drive the stages directly.

use serde_yaml::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HandlerRegistry;
use crate::limiter::DomainRateLimiter;
use crate::storage::{DedupKey, OutboxItem, PostStore};
use crate::{Error, Message, ModifierConfig, Post, Source, Stream};

/// Fetches the raw text of one source, holding a per-host lease around the
/// call when the fetcher options carry a url.
pub(crate) async fn fetch_source_text(
    registry: &HandlerRegistry,
    limiter: &DomainRateLimiter,
    source: &Source,
    min_spacing: Duration,
) -> Result<Option<String>, Error> {
    let fetcher = registry.fetcher(&source.fetcher_type)?;

    match option_url(&source.fetcher_options) {
        Some(url) => {
            let lease = limiter.lease(&url, min_spacing).await?;
            let result = fetcher.fetch(&source.fetcher_options).await;
            lease.release();
            result
        }
        None => fetcher.fetch(&source.fetcher_options).await,
    }
}

fn option_url(options: &Value) -> Option<String> {
    options
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parses fetched text into posts.
pub(crate) async fn parse_posts(
    registry: &HandlerRegistry,
    source: &Source,
    text: &str,
) -> Result<Vec<Post>, Error> {
    let parser = registry.parser(&source.parser_type)?;
    parser.parse(text, &source.parser_options).await
}

/// Fans parsed posts out to every stream of the source: each stream gets its
/// own copy (modifier chains are independent), the source tags, and its
/// modifiers applied in order. A failing modifier drops the tick for its
/// stream only.
pub(crate) async fn fan_out_to_streams(
    registry: &HandlerRegistry,
    source: &Source,
    posts: &[Post],
) -> Vec<(Stream, Vec<Post>)> {
    let mut result = Vec::with_capacity(source.streams.len());
    for stream in &source.streams {
        let mut stream_posts = posts.to_vec();
        for post in &mut stream_posts {
            post.source_tags = source.tags.clone();
        }
        match apply_modifiers(registry, &stream.modifiers, stream_posts).await {
            Ok(modified) => result.push((stream.clone(), modified)),
            Err(e) => {
                warn!(
                    source = source.id,
                    receiver = stream.receiver_type,
                    error = format!("{e}"),
                    "modifier failed, dropping tick for stream"
                );
            }
        }
    }
    result
}

pub(crate) async fn apply_modifiers(
    registry: &HandlerRegistry,
    modifiers: &[ModifierConfig],
    mut posts: Vec<Post>,
) -> Result<Vec<Post>, Error> {
    for modifier in modifiers {
        let handler = registry.modifier(&modifier.modifier_type)?;
        posts = handler.apply(posts, &modifier.options).await?;
    }
    Ok(posts)
}

/// Materializes messages for one `(source, stream)` tick.
///
/// On the first tick for a dedup key every post is marked processed and
/// nothing is emitted, so a freshly configured source does not flood its
/// receiver with the feed's entire history. Afterwards posts are walked in
/// reverse (feeds list newest first, the oldest new post must go out first)
/// and every unseen post becomes a message. With `squash` all new messages
/// fuse into one batch, otherwise each message is its own batch.
pub async fn prepare_message_batches(
    post_store: &dyn PostStore,
    source: &Source,
    stream: &Stream,
    posts: &[Post],
) -> Result<Vec<Vec<Message>>, Error> {
    let key = DedupKey::new(&source.id, &stream.receiver_type);

    if !post_store.has_any(&key).await? {
        let ids: Vec<String> = posts.iter().map(|post| post.post_id.clone()).collect();
        if !ids.is_empty() {
            post_store.mark_processed(&key, &ids).await?;
        }
        debug!(key = %key, posts = ids.len(), "first tick for key, suppressing history");
        return Ok(Vec::new());
    }

    let mut messages = Vec::new();
    let mut new_ids = Vec::new();
    for post in posts.iter().rev() {
        if post_store.is_processed(&key, &post.post_id).await? {
            continue;
        }
        messages.push(Message {
            post_id: post.post_id.clone(),
            template: stream.message_template.clone(),
            template_kwargs: post.template_kwargs(),
        });
        new_ids.push(post.post_id.clone());
    }

    if new_ids.is_empty() {
        return Ok(Vec::new());
    }
    post_store.mark_processed(&key, &new_ids).await?;

    if stream.squash {
        Ok(vec![messages])
    } else {
        Ok(messages.into_iter().map(|message| vec![message]).collect())
    }
}

/// Delivers one outbox item through its stream's receiver.
pub(crate) async fn send_outbox_item(
    registry: &HandlerRegistry,
    item: &OutboxItem,
) -> Result<(), Error> {
    let receiver = registry.receiver(&item.stream.receiver_type)?;
    receiver
        .send(&item.messages, &item.stream.receiver_options)
        .await
}
