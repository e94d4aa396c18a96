use bytes::Bytes;

/// One encoded image sample submitted for inference.
#[derive(Debug, Clone)]
pub struct Frame {
    ordinal: u64,
    label: String,
    data: Bytes,
}

impl Frame {
    pub fn new(ordinal: u64, data: Bytes) -> Self {
        Self {
            ordinal,
            label: format!("Frame {}", ordinal),
            data,
        }
    }

    /// Same payload under a different label, used for confirmation rounds.
    pub fn relabel(&self, label: impl Into<String>) -> Self {
        Self {
            ordinal: self.ordinal,
            label: label.into(),
            data: self.data.clone(),
        }
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
