use std::sync::mpsc;

use crate::form::{FormError, InputForm};
use crate::service::CompletionRequest;

pub const WELCOME_TITLE: &str = "👋 Hi, I’m your Role Awareness Agent";

pub const WELCOME_BODY: &[&str] = &[
    "I answer questions about our organizational roles using our official documents. \
     Right now I give deep, practical coaching for the Chapter Lead role, and basic facts \
     for other Blueprint roles, always with citations.",
    "Ask me anything about your role, boundaries, or how roles work together. \
     Try one of the starters below:",
];

pub const WELCOME_NOTE: &str =
    "🇸🇦 أجب على أسئلتك من وثائقنا الرسمية مع ذكر المصادر. اضغط أحد الأزرار لبدء المحادثة.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickPrompt {
    pub label: &'static str,
    pub text: &'static str,
}

pub const QUICK_PROMPTS: [QuickPrompt; 6] = [
    QuickPrompt {
        label: "CL awareness (60 min)",
        text: "Create a 60-minute Chapter Lead awareness session for all staff.",
    },
    QuickPrompt {
        label: "Top 5 CL responsibilities",
        text: "What are the top 5 responsibilities of a Chapter Lead?",
    },
    QuickPrompt {
        label: "CL vs TDM",
        text: "Compare Chapter Lead vs TDM",
    },
    QuickPrompt {
        label: "CL v1.2 → v1.3 (changes)",
        text: "What changed between Chapter Lead v1.2 and v1.3? Provide a delta summary with sources.",
    },
    QuickPrompt {
        label: "CL ↔ PO / Managers",
        text: "How should a Chapter Lead collaborate with Product Owners and managers?",
    },
    QuickPrompt {
        label: "جلسة CL توعوية (٦٠ دقيقة)",
        text: "ابغى جلسة توعوية لقائد الشابتر لمدة ٦٠ دقيقة لجميع الفريق.",
    },
];

/// Sending half of the quick-prompt bridge, held by the welcome view.
#[derive(Clone)]
pub struct PromptBridge {
    tx: mpsc::Sender<String>,
}

impl PromptBridge {
    /// Returns false when the text was empty or the receiving side is gone.
    pub fn send(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        self.tx.send(text.to_string()).is_ok()
    }

    pub fn send_quick(&self, index: usize) -> bool {
        QUICK_PROMPTS
            .get(index)
            .is_some_and(|p| self.send(p.text))
    }
}

/// Receiving half, drained by whoever owns the input form.
pub struct PromptInbox {
    rx: mpsc::Receiver<String>,
}

impl PromptInbox {
    /// Applies every queued prompt to `form`, one submission per prompt.
    /// Dropped events (no variables loaded) produce nothing.
    pub fn deliver(&self, form: &mut InputForm) -> Vec<Result<CompletionRequest, FormError>> {
        let mut out = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            match form.apply_quick_prompt(&text) {
                Some(res) => out.push(res),
                None => tracing::debug!("quick prompt dropped: no prompt variables loaded"),
            }
        }
        out
    }
}

pub fn prompt_bridge() -> (PromptBridge, PromptInbox) {
    let (tx, rx) = mpsc::channel();
    (PromptBridge { tx }, PromptInbox { rx })
}
