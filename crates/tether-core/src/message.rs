//! Batches of byte payloads flowing through a pipeline step.

use std::fmt;

/// One unit of a batch: a payload plus an optional failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    data: Vec<u8>,
    error: Option<String>,
}

impl Part {
    /// Create a part holding `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            error: None,
        }
    }

    /// The payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the payload.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Consume the part, returning its payload.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Mark the part as failed. A later failure replaces an earlier one.
    pub fn flag_error(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
    }

    /// The failure attached to this part, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the part has been marked as failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// An ordered batch of parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    parts: Vec<Part>,
}

impl Batch {
    /// Create a batch from parts.
    pub fn new(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    /// Create a batch with one part per payload.
    pub fn from_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self::new(payloads.into_iter().map(Part::new).collect())
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the batch has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Map a possibly negative index onto a part position.
    ///
    /// Negative indices count from the end, so `-1` is the last part.
    pub fn resolve_index(&self, index: isize) -> Option<usize> {
        let len = self.parts.len();
        let resolved = if index < 0 {
            len.checked_sub(index.unsigned_abs())?
        } else {
            index as usize
        };
        (resolved < len).then_some(resolved)
    }

    /// Part at `index`.
    pub fn get(&self, index: usize) -> Option<&Part> {
        self.parts.get(index)
    }

    /// Mutable part at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Part> {
        self.parts.get_mut(index)
    }

    /// Replace the payload of the part at `index`. Returns false when out of range.
    pub fn set(&mut self, index: usize, data: Vec<u8>) -> bool {
        match self.parts.get_mut(index) {
            Some(part) => {
                part.set_data(data);
                true
            }
            None => false,
        }
    }

    /// Flag the part at `index` as failed. Returns false when out of range.
    pub fn flag_error(&mut self, index: usize, error: impl fmt::Display) -> bool {
        match self.parts.get_mut(index) {
            Some(part) => {
                part.flag_error(error);
                true
            }
            None => false,
        }
    }

    /// Failure text of the part at `index`, if it failed.
    pub fn error(&self, index: usize) -> Option<&str> {
        self.parts.get(index).and_then(Part::error)
    }

    /// Iterate over the parts.
    pub fn iter(&self) -> std::slice::Iter<'_, Part> {
        self.parts.iter()
    }

    /// Number of failed parts.
    pub fn failed_count(&self) -> usize {
        self.parts.iter().filter(|p| p.is_failed()).count()
    }

    /// Consume the batch, returning its parts.
    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Part;
    type IntoIter = std::slice::Iter<'a, Part>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}
