use std::fmt::Write as _;

use crate::agent_engine::state::StepRecord;
use crate::llm::types::{ChatMessage, ContentPart, MessageContent, Role};

const SEPARATOR_WIDTH: usize = 20;

/// Ordered conversation with the model.
///
/// At most one message carries an image: appending a message with an image
/// prunes every earlier one. Pruning only drops non-text parts; order and roles are
/// untouched, and pruning twice is the same as pruning once.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    messages: Vec<ChatMessage>,
    /// Step records, keyed by the index of the assistant reply they belong to.
    timings: Vec<(usize, StepRecord)>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.append(ChatMessage::system(prompt));
        ctx
    }

    pub fn append(&mut self, msg: ChatMessage) {
        if msg.has_image() {
            self.prune_images(false);
        }
        self.messages.push(msg);
    }

    /// Strip images from every message, or from all but the last.
    pub fn prune_images(&mut self, except_last: bool) {
        let keep = if except_last {
            self.messages.len().saturating_sub(1)
        } else {
            self.messages.len()
        };
        let mut pruned = 0;
        for msg in &mut self.messages[..keep] {
            if msg.strip_images() {
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!(pruned, "images pruned from history");
        }
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// What to send for the next call: history with every image removed,
    /// followed by `next`. The context itself is not modified.
    pub fn outgoing(&self, next: &ChatMessage) -> Vec<ChatMessage> {
        let mut out = self.snapshot();
        for msg in &mut out {
            msg.strip_images();
        }
        out.push(next.clone());
        out
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.messages.iter().map(ChatMessage::image_count).sum()
    }

    /// Attach timing to the latest assistant reply.
    pub fn record_step(&mut self, record: StepRecord) {
        match self.messages.iter().rposition(|m| m.role == Role::Assistant) {
            Some(idx) => self.timings.push((idx, record)),
            None => tracing::debug!(step = record.index, "no assistant reply to attach timing to"),
        }
    }

    pub fn step_records(&self) -> impl Iterator<Item = &StepRecord> {
        self.timings.iter().map(|(_, r)| r)
    }

    /// Human-readable prompt log; images appear as `[IMAGE CONTENT]`.
    pub fn render_log(&self) -> String {
        let mut out = String::new();
        for (idx, msg) in self.messages.iter().enumerate() {
            let role = match msg.role {
                Role::System => "SYSTEM",
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
            };
            let body = match &msg.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Parts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => text.as_str(),
                        ContentPart::ImageUrl { .. } => "[IMAGE CONTENT]",
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            let _ = write!(out, "[{role}]:\n{body}");

            for (_, t) in self.timings.iter().filter(|(i, _)| *i == idx) {
                let _ = write!(out, "\n\n[TIMING & IMAGE INFO - Step {}]:", t.index);
                if let Some(dims) = t.image_dims {
                    let scaled = match t.original_dims {
                        Some(orig) if orig != dims => {
                            format!(" (Scaled from {}x{})", orig.width, orig.height)
                        }
                        _ => String::new(),
                    };
                    let _ = write!(
                        out,
                        "\n- Image: {}x{}{scaled}, size: {:.1}KB",
                        dims.width,
                        dims.height,
                        t.image_bytes as f64 / 1024.0
                    );
                }
                let _ = write!(out, "\n- Screenshot: {}ms", t.screenshot_ms);
                let _ = write!(out, "\n- Network (LLM): {}ms", t.model_ms);
                let _ = write!(out, "\n- Action Execution: {}ms", t.actuation_ms);
                let _ = write!(out, "\n- Step Total: {}ms", t.total_ms);
            }

            if idx + 1 < self.messages.len() {
                let _ = write!(out, "\n\n{}\n\n", "-".repeat(SEPARATOR_WIDTH));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::coords::ImageDims;

    fn shot(n: u32) -> ChatMessage {
        ChatMessage::user_with_image(format!("data:image/jpeg;base64,{n}"), format!("screen {n}"))
    }

    #[test]
    fn appending_prunes_the_previous_image() {
        let mut ctx = ConversationContext::with_system("rules");
        ctx.append(ChatMessage::assistant("<answer>do(action=\"Back\")</answer>"));
        ctx.append(shot(3));
        assert_eq!(ctx.image_count(), 1);

        ctx.append(shot(4));
        let msgs = ctx.messages();
        assert_eq!(msgs.len(), 4);
        assert!(msgs[3].has_image());
        assert!(!msgs[2].has_image());
        assert_eq!(msgs[2].text(), "screen 3");
        assert_eq!(msgs[2].role, Role::User);
        assert_eq!(ctx.image_count(), 1);
    }

    #[test]
    fn pruning_is_idempotent() {
        let mut ctx = ConversationContext::new();
        ctx.append(shot(1));
        ctx.prune_images(false);
        let once = ctx.snapshot();
        ctx.prune_images(false);
        assert_eq!(ctx.snapshot(), once);
        assert_eq!(ctx.image_count(), 0);
    }

    #[test]
    fn prune_except_last_keeps_newest_image() {
        let mut ctx = ConversationContext::new();
        ctx.append(shot(1));
        ctx.prune_images(true);
        assert_eq!(ctx.image_count(), 1);
        ctx.prune_images(true);
        assert_eq!(ctx.image_count(), 1);
    }

    #[test]
    fn outgoing_only_carries_the_new_image() {
        let mut ctx = ConversationContext::with_system("rules");
        ctx.append(shot(1));
        ctx.append(ChatMessage::assistant("ok"));
        let out = ctx.outgoing(&shot(2));
        assert_eq!(out.len(), 4);
        assert_eq!(out.iter().filter(|m| m.has_image()).count(), 1);
        assert!(out[3].has_image());
        // history untouched until the call succeeds
        assert_eq!(ctx.len(), 3);
        assert!(ctx.messages()[1].has_image());
    }

    #[test]
    fn render_log_shows_timing_after_assistant_reply() {
        let mut ctx = ConversationContext::with_system("rules");
        ctx.append(shot(1));
        ctx.append(ChatMessage::assistant("<think>t</think><answer>a</answer>"));
        ctx.record_step(StepRecord {
            index: 0,
            screenshot_ms: 12,
            model_ms: 340,
            actuation_ms: 56,
            total_ms: 420,
            image_dims: Some(ImageDims::new(540, 1200)),
            original_dims: Some(ImageDims::new(1080, 2400)),
            image_bytes: 2048,
        });
        let log = ctx.render_log();
        assert!(log.starts_with("[SYSTEM]:\nrules"));
        assert!(log.contains("[USER]:\n[IMAGE CONTENT]\nscreen 1"));
        assert!(log.contains("[TIMING & IMAGE INFO - Step 0]:"));
        assert!(log.contains("- Image: 540x1200 (Scaled from 1080x2400), size: 2.0KB"));
        assert!(log.contains("- Step Total: 420ms"));
        assert!(log.ends_with("- Step Total: 420ms"));
    }
}
