// plugins/toolbox_plugin/src/lib.rs
//! Text utilities exposed to the agent as tools.
//!
//! ### Tool arguments
//! ```jsonc
//! { "text": "hello" }                 // uppercase
//! { "texts": ["foo", "bar"] }         // uppercase, many
//! { "text": "two words" }             // word_count
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reactor_host::context::HostContext;
use reactor_host::manifest::PluginManifest;
use reactor_host::plugin::{Plugin, PluginRegistrar};
use reactor_host::tools::{Capability, ToolHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const DEFAULT_MAX_TEXT_LEN: usize = 100_000;

#[derive(Deserialize)]
#[serde(untagged)]
enum TextArgs {
    One { text: String },
    Many { texts: Vec<String> },
}

fn parse_args(input: Value) -> Result<TextArgs> {
    if let Some(text) = input.as_str() {
        // Fallback for simple string input
        return Ok(TextArgs::One {
            text: text.to_string(),
        });
    }
    serde_json::from_value(input)
        .map_err(|_| anyhow!("Invalid input format. Expected {{\"text\": ..}} or {{\"texts\": [..]}}"))
}

fn check_len(text: &str, max: usize) -> Result<()> {
    if text.len() > max {
        return Err(anyhow!("text exceeds {} bytes", max));
    }
    Ok(())
}

pub fn uppercase(input: Value, max: usize) -> Result<Value> {
    match parse_args(input)? {
        TextArgs::One { text } => {
            check_len(&text, max)?;
            Ok(json!(text.to_uppercase()))
        }
        TextArgs::Many { texts } => {
            for text in &texts {
                check_len(text, max)?;
            }
            Ok(json!(texts.iter().map(|s| s.to_uppercase()).collect::<Vec<_>>()))
        }
    }
}

pub fn word_count(input: Value, max: usize) -> Result<Value> {
    let texts = match parse_args(input)? {
        TextArgs::One { text } => vec![text],
        TextArgs::Many { texts } => texts,
    };
    let mut words = 0;
    for text in &texts {
        check_len(text, max)?;
        words += text.split_whitespace().count();
    }
    Ok(json!({ "words": words }))
}

pub struct ToolboxPlugin {
    manifest: PluginManifest,
    context: Arc<HostContext>,
    max_text_len: usize,
    initialized: bool,
}

impl ToolboxPlugin {
    pub fn new(manifest: PluginManifest, context: Arc<HostContext>) -> Self {
        let max_text_len = manifest
            .config
            .get("max_text_len")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_MAX_TEXT_LEN, |n| n as usize);
        Self {
            manifest,
            context,
            max_text_len,
            initialized: false,
        }
    }
}

#[async_trait]
impl Plugin for ToolboxPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn initialize(&mut self) -> Result<()> {
        self.initialized = true;
        self.context
            .events
            .emit("toolbox.ready", vec![json!(self.manifest.version)])
            .await;
        info!("Toolbox plugin initialized (max {} bytes)", self.max_text_len);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.initialized = false;
        info!("Toolbox plugin shut down");
        Ok(())
    }

    fn capabilities(&self) -> Vec<Capability> {
        let max = self.max_text_len;
        let initialized = self.initialized;
        vec![
            Capability::new(
                "uppercase",
                ToolHandler::from_async(move |args| async move { uppercase(args, max) }),
            )
            .tool()
            .doc("Convert text, or a list of texts, to upper case."),
            Capability::new(
                "word_count",
                ToolHandler::blocking(move |args| word_count(args, max)),
            )
            .tool()
            .described("Count whitespace-separated words."),
            Capability::new(
                "status",
                ToolHandler::from_async(move |_| async move {
                    Ok(json!({ "initialized": initialized }))
                }),
            ),
        ]
    }
}

/// Mandatory C-ABI entry-point so the host can `dlopen` this plugin.
#[no_mangle]
pub extern "C" fn register_plugin(registrar: &mut PluginRegistrar) {
    registrar.register_plugin("ToolboxPlugin", |manifest, context| {
        Box::new(ToolboxPlugin::new(manifest, context))
    });
    info!("Toolbox plugin registered for {}", registrar.module());
}
