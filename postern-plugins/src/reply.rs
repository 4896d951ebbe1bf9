use std::sync::Arc;

use parking_lot::Mutex;
use postern_common::{Code, internal};
use tokio::sync::oneshot;

use crate::hook::Hook;

/// A plugin's answer: a result code plus optional response lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub code: Code,
    pub message: Vec<String>,
}

impl Verdict {
    #[must_use]
    pub const fn cont() -> Self {
        Self {
            code: Code::Cont,
            message: Vec::new(),
        }
    }

    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![message.into()],
        }
    }

    #[must_use]
    pub const fn code(code: Code) -> Self {
        Self {
            code,
            message: Vec::new(),
        }
    }

    /// A multi-line answer.
    #[must_use]
    pub const fn lines(code: Code, message: Vec<String>) -> Self {
        Self { code, message }
    }
}

impl From<Code> for Verdict {
    fn from(code: Code) -> Self {
        Self::code(code)
    }
}

/// The single-shot callback handed to a plugin for one hook invocation.
///
/// Only the first [`send`](Self::send) is delivered; any later call is logged
/// and dropped. A reply arriving after the dispatcher has given up on the
/// plugin (timeout) is dropped as well.
#[derive(Debug)]
pub struct Reply {
    sender: Mutex<Option<oneshot::Sender<Verdict>>>,
    plugin: Arc<str>,
    hook: Hook,
}

impl Reply {
    pub(crate) fn new(sender: oneshot::Sender<Verdict>, plugin: Arc<str>, hook: Hook) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            plugin,
            hook,
        }
    }

    /// A reply whose answer is observed through the returned receiver.
    ///
    /// Intended for exercising a plugin without a dispatcher.
    #[must_use]
    pub fn detached(plugin: &str, hook: Hook) -> (Self, oneshot::Receiver<Verdict>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(tx, Arc::from(plugin), hook), rx)
    }

    /// Answer the hook. Returns `false` if this reply had already been used
    /// or nobody is waiting for it any more.
    pub fn send(&self, verdict: impl Into<Verdict>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            internal!(
                level = ERROR,
                "Plugin {} answered hook {} more than once; ignoring",
                self.plugin,
                self.hook
            );
            return false;
        };

        if sender.send(verdict.into()).is_err() {
            internal!(
                level = DEBUG,
                "Plugin {} answered hook {} after the dispatcher moved on",
                self.plugin,
                self.hook
            );
            return false;
        }

        true
    }

    #[must_use]
    pub const fn hook(&self) -> Hook {
        self.hook
    }
}
