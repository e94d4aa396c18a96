use indexmap::IndexSet;
use serde::Serialize;

/// Labels gathered over one acquisition session.
///
/// Labels are unique by exact string equality and keep the order in which they
/// were first seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    /// Ordinal of the frame that produced the first usable response.
    pub frame: u64,
    pub objects: IndexSet<String>,
}

impl DetectionResult {
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            objects: IndexSet::new(),
        }
    }

    /// Adds the labels not seen yet and returns how many were new.
    pub fn merge<I>(&mut self, labels: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.objects.len();
        self.objects.extend(labels);
        self.objects.len() - before
    }
}
