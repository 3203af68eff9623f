//! The effect surface (§3.6, §6.5): output is emitted as append-only
//! `Effect` records, never returned as strings from `evaluate`.

use async_trait::async_trait;

use crate::ast::types::SourceLocation;

/// Which stream an effect targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Document output (the normalized final result).
    Doc,
    Stdout,
    Stderr,
    File,
    /// Both `Doc` and a side-channel; streaming-format run results bypass
    /// this to avoid double output (§4.2).
    Both,
}

#[derive(Debug, Clone, Default)]
pub struct EffectMeta {
    pub directive_type: Option<String>,
    pub stage_index: Option<usize>,
}

#[derive(Debug)]
pub struct Effect {
    pub stream: Stream,
    pub content: String,
    pub location: Option<SourceLocation>,
    pub meta: EffectMeta,
}

impl Effect {
    pub fn doc(content: impl Into<String>) -> Self {
        Self { stream: Stream::Doc, content: content.into(), location: None, meta: EffectMeta::default() }
    }
}

/// Pluggable effect sink (§6.5). Implementations must append atomically per
/// call (§5 shared-resources rule); the default in-process implementation is
/// `CollectingEffectHandler` below.
#[async_trait]
pub trait EffectHandler: Send + Sync {
    async fn emit(&self, effect: Effect);
    async fn flush(&self) {}
    async fn finalize(&self) {}
}

/// Accumulates every effect in memory, in emission order. This is the
/// reference sink used by the crate's own tests and by hosts that just want
/// the final concatenated document.
#[derive(Default)]
pub struct CollectingEffectHandler {
    effects: tokio::sync::Mutex<Vec<Effect>>,
}

impl CollectingEffectHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenates `Doc`/`Both` effects with blank-line normalization
    /// (§3.6): runs of more than one blank line collapse to one.
    pub async fn render_document(&self) -> String {
        let effects = self.effects.lock().await;
        let mut out = String::new();
        for effect in effects.iter() {
            if matches!(effect.stream, Stream::Doc | Stream::Both) {
                out.push_str(&effect.content);
            }
        }
        normalize_blank_lines(&out)
    }

    pub async fn all(&self) -> Vec<Effect> {
        self.effects.lock().await.clone()
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream,
            content: self.content.clone(),
            location: self.location,
            meta: self.meta.clone(),
        }
    }
}

#[async_trait]
impl EffectHandler for CollectingEffectHandler {
    async fn emit(&self, effect: Effect) {
        self.effects.lock().await.push(effect);
    }
}

fn normalize_blank_lines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut blank_run = 0;
    for line in input.split('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !input.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn collects_doc_effects_in_order() {
        let handler = CollectingEffectHandler::new();
        handler.emit(Effect::doc("Hello, ")).await;
        handler.emit(Effect::doc("World!")).await;
        assert_eq!(handler.render_document().await, "Hello, World!\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stdout_effects_excluded_from_document() {
        let handler = CollectingEffectHandler::new();
        handler.emit(Effect::doc("doc-line")).await;
        handler
            .emit(Effect { stream: Stream::Stdout, content: "stdout-line".into(), location: None, meta: EffectMeta::default() })
            .await;
        assert_eq!(handler.render_document().await, "doc-line\n");
    }

    #[test]
    fn collapses_repeated_blank_lines() {
        let normalized = normalize_blank_lines("a\n\n\n\nb\n");
        assert_eq!(normalized, "a\n\nb\n");
    }
}
