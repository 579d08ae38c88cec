//! Canned summarizer for tests. Built only with the `test-support` feature.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::keyword::prepare_text;
use crate::result::{FailureKind, Keyword, Summarizer};

/// Replays queued outcomes in order. Once the script runs out, every call
/// derives a keyword from the first words of the input.
#[derive(Debug, Default)]
pub struct ScriptedSummarizer {
    script: Mutex<VecDeque<Result<String, FailureKind>>>,
    inputs: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, keyword: impl Into<String>) -> &Self {
        self.lock_script().push_back(Ok(keyword.into()));
        self
    }

    pub fn push_err(&self, failure: FailureKind) -> &Self {
        self.lock_script().push_back(Err(failure));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts received so far, in call order.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, FailureKind>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Summarizer for ScriptedSummarizer {
    fn summarize(&self, text: &str) -> Result<Keyword, FailureKind> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());

        let next = self.lock_script().pop_front();
        let raw = match next {
            Some(outcome) => outcome?,
            None => prepare_text(text)?
                .split_whitespace()
                .take(3)
                .collect::<Vec<_>>()
                .join(", "),
        };

        crate::keyword::clean_keyword(&raw)
            .ok_or_else(|| FailureKind::permanent("scripted output is empty after cleaning"))
    }
}
