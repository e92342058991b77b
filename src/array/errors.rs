//! Per-Child Error Collection
//!
//! Collects failure messages from many children and renders them as one
//! bounded, deterministic summary.

/// Appended when a summary had to be cut short.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Marker used when the limit is too small for [`TRUNCATION_MARKER`].
pub const SHORT_TRUNCATION_MARKER: &str = "...";

/// Accumulates `(child index, message)` records.
#[derive(Debug, Clone, Default)]
pub struct ErrorMessageCollector {
    records: Vec<(usize, String)>,
}

impl ErrorMessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for a child. Duplicates are kept.
    pub fn collect(&mut self, index: usize, message: impl Into<String>) {
        self.records.push((index, message.into()));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct failing child indices, ascending.
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.records.iter().map(|(i, _)| *i).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Renders all records as `index: message` lines sorted by index.
    ///
    /// Records of the same index keep their collection order. The result
    /// never exceeds `max_length` bytes; when records had to be dropped it
    /// ends with [`TRUNCATION_MARKER`], or with [`SHORT_TRUNCATION_MARKER`]
    /// (cut to `max_length` dots below three) when the full marker does
    /// not fit.
    pub fn summary(&self, max_length: usize) -> String {
        let mut sorted: Vec<&(usize, String)> = self.records.iter().collect();
        sorted.sort_by_key(|(index, _)| *index);

        let mut full = String::new();
        for (index, message) in sorted {
            full.push_str(&format!("{}: {}\n", index, message));
        }

        if full.len() <= max_length {
            return full;
        }

        let marker = if max_length >= TRUNCATION_MARKER.len() {
            TRUNCATION_MARKER
        } else {
            &SHORT_TRUNCATION_MARKER[..SHORT_TRUNCATION_MARKER.len().min(max_length)]
        };
        let keep = max_length - marker.len();
        let mut summary = full[..floor_char_boundary(&full, keep)].to_string();
        summary.push_str(marker);
        summary
    }
}

/// Largest index `<= at` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut at = at.min(s.len());
    while !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}
