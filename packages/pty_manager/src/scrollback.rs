//! Byte-capped ring of output chunks.
//!
//! Chunks are kept whole: when the total exceeds the cap, the oldest chunks are
//! dropped until it fits again. A single chunk larger than the cap is dropped
//! as well, so `total_bytes() <= cap()` holds after every push.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Scrollback<T = Vec<u8>> {
    chunks: VecDeque<T>,
    total_bytes: usize,
    cap: usize,
}

impl<T: AsRef<[u8]>> Scrollback<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            cap,
        }
    }

    /// Append a chunk, evicting from the front until the buffer fits the cap.
    pub fn push(&mut self, chunk: T) {
        self.total_bytes += chunk.as_ref().len();
        self.chunks.push_back(chunk);

        while self.total_bytes > self.cap {
            match self.chunks.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.as_ref().len());
                }
                None => break,
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.chunks.iter()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}

impl Scrollback<String> {
    /// All buffered output joined into one string.
    pub fn concat(&self) -> String {
        let mut out = String::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.push_str(chunk);
        }
        out
    }
}

impl Scrollback<Vec<u8>> {
    /// All buffered output joined into one byte vector.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
