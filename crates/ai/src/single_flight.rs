//! Serializes calls so only one external request is outstanding at a time.

use std::sync::Mutex;

use crate::result::{FailureKind, Keyword, Summarizer};

#[derive(Debug)]
pub struct SingleFlight<S> {
    inner: S,
    gate: Mutex<()>,
}

impl<S: Summarizer> SingleFlight<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Summarizer> Summarizer for SingleFlight<S> {
    fn summarize(&self, text: &str) -> Result<Keyword, FailureKind> {
        // A panic in a previous call leaves nothing to repair behind the gate.
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.summarize(text)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::keyword::clean_keyword;

    #[derive(Default)]
    struct OverlapCounter {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Summarizer for OverlapCounter {
        fn summarize(&self, text: &str) -> Result<Keyword, FailureKind> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            clean_keyword(text).ok_or_else(|| FailureKind::permanent("empty"))
        }
    }

    #[test]
    fn at_most_one_call_outstanding() {
        let gate = Arc::new(SingleFlight::new(OverlapCounter::default()));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.summarize(&format!("text {i}")))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }

        assert_eq!(gate.inner().peak.load(Ordering::SeqCst), 1);
    }
}
