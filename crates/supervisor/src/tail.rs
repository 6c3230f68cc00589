/// Keeps the last `capacity` characters written to it.
///
/// Used to capture the end of a child's stderr for failure diagnostics.
/// Trimming happens on char boundaries, so the content is always valid
/// UTF-8 even when a write lands mid-way through a multi-byte sequence of
/// the original stream.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    buf: String,
    chars: usize,
}

impl TailBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: String::new(),
            chars: 0,
        }
    }

    pub fn push(&mut self, text: &str) {
        if self.capacity == 0 || text.is_empty() {
            return;
        }
        self.buf.push_str(text);
        self.chars += text.chars().count();
        if self.chars > self.capacity {
            let excess = self.chars - self.capacity;
            let cut = self
                .buf
                .char_indices()
                .nth(excess)
                .map_or(self.buf.len(), |(i, _)| i);
            self.buf.drain(..cut);
            self.chars = self.capacity;
        }
    }

    /// Append a line, adding the newline the line reader stripped.
    pub fn push_line(&mut self, line: &str) {
        self.push(line);
        self.push("\n");
    }

    #[must_use]
    pub fn contents(&self) -> &str {
        &self.buf
    }

    #[must_use]
    pub fn len_chars(&self) -> usize {
        self.chars
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.chars = 0;
    }
}
