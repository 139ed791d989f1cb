use std::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Error,
    Info,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub kind: ToastKind,
    pub message: String,
}

impl Toast {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            message: message.into(),
        }
    }
}

pub trait Notify: Send + Sync {
    fn notify(&self, toast: Toast);
}

#[derive(Default)]
pub struct StderrNotify;

impl Notify for StderrNotify {
    fn notify(&self, toast: Toast) {
        let tag = match toast.kind {
            ToastKind::Error => "ERROR",
            ToastKind::Info => "INFO",
            ToastKind::Success => "OK",
        };
        eprintln!("{tag}: {}", toast.message);
    }
}

#[derive(Clone)]
pub struct ChannelNotify {
    tx: mpsc::Sender<Toast>,
}

impl ChannelNotify {
    pub fn new(tx: mpsc::Sender<Toast>) -> Self {
        Self { tx }
    }
}

impl Notify for ChannelNotify {
    fn notify(&self, toast: Toast) {
        let _ = self.tx.send(toast);
    }
}

#[derive(Default)]
pub struct RecordingNotify {
    toasts: Mutex<Vec<Toast>>,
}

impl RecordingNotify {
    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Notify for RecordingNotify {
    fn notify(&self, toast: Toast) {
        if let Ok(mut g) = self.toasts.lock() {
            g.push(toast);
        }
    }
}
