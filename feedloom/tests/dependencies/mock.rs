use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use feedloom::config::{HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use feedloom::utils::text::render_template;
use feedloom::{Error, Fetcher, FieldValue, Message, Parser, Post, Receiver};

/// Returns one scripted response per fetch, then `None`.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedFetcher {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(ScriptedFetcher {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        })
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, _options: &Value) -> Result<Option<String>, Error> {
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| Error::UnableToSecureLock)?;
        Ok(responses.pop_front())
    }
}

/// Parses `id` or `id:score` lines into posts, preserving input order
/// (feeds list newest first).
pub struct LineParser;

#[async_trait]
impl Parser for LineParser {
    async fn parse(&self, text: &str, _options: &Value) -> Result<Vec<Post>, Error> {
        let mut posts = Vec::new();
        for line in text.lines().filter(|line| !line.is_empty()) {
            let (id, score) = match line.split_once(':') {
                Some((id, score)) => {
                    let score: i64 = score
                        .parse()
                        .map_err(|_| Error::Parse(format!("bad score in line {line}")))?;
                    (id, Some(score))
                }
                None => (line, None),
            };
            let mut fields = BTreeMap::new();
            let _ = fields.insert("title".to_string(), FieldValue::Str(id.to_string()));
            if let Some(score) = score {
                let _ = fields.insert("score".to_string(), FieldValue::Int(score));
            }
            posts.push(Post {
                post_id: id.to_string(),
                source_tags: Vec::new(),
                fields,
            });
        }
        Ok(posts)
    }
}

/// Records every delivered batch as rendered message texts.
#[derive(Default)]
pub struct CollectingReceiver {
    batches: Mutex<Vec<Vec<String>>>,
}

impl CollectingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().expect("collector lock").clone()
    }
}

#[async_trait]
impl Receiver for CollectingReceiver {
    async fn send(&self, messages: &[Message], _options: &Value) -> Result<(), Error> {
        let rendered: Vec<String> = messages
            .iter()
            .map(|message| render_template(&message.template, &message.template_kwargs))
            .collect();
        self.batches
            .lock()
            .map_err(|_| Error::UnableToSecureLock)?
            .push(rendered);
        Ok(())
    }
}

/// Registers the mock handlers under `scripted` / `lines` / `collect`.
pub fn register_mocks(
    registry: &mut HandlerRegistry,
    fetcher: Arc<ScriptedFetcher>,
    receiver: Arc<CollectingReceiver>,
) -> Result<(), Error> {
    registry.register(
        HandlerKind::Fetcher,
        "scripted",
        HandlerSpec {
            ctor: Box::new(move |_| Ok(HandlerUnit::Fetcher(fetcher.clone()))),
            init_options: None,
            call_options: None,
        },
    )?;
    registry.register(
        HandlerKind::Parser,
        "lines",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Parser(Arc::new(LineParser)))),
            init_options: None,
            call_options: None,
        },
    )?;
    registry.register(
        HandlerKind::Receiver,
        "collect",
        HandlerSpec {
            ctor: Box::new(move |_| Ok(HandlerUnit::Receiver(receiver.clone()))),
            init_options: None,
            call_options: None,
        },
    )?;
    Ok(())
}
