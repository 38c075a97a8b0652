/// Reassembles worker output chunks into complete lines.
///
/// Works on bytes so a multi-byte character split across two reads is
/// decoded only once the line is complete. Lines that grow past
/// `max_line_bytes` are cut and the surplus is dropped up to the next
/// line break.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
    truncated_lines: usize,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
            truncated_lines: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut index = 0;
        while index < chunk.len() {
            let byte = chunk[index];
            index += 1;
            match byte {
                b'\n' | b'\r' => {
                    if byte == b'\r' && chunk.get(index) == Some(&b'\n') {
                        index += 1;
                    }
                    lines.push(self.take_line());
                }
                _ if self.discarding => {}
                _ => {
                    self.pending.push(byte);
                    if self.pending.len() >= self.max_line_bytes {
                        self.discarding = true;
                        self.truncated_lines = self.truncated_lines.saturating_add(1);
                    }
                }
            }
        }
        lines
    }

    /// Number of lines cut since the last call.
    pub fn consume_truncated_lines(&mut self) -> usize {
        std::mem::take(&mut self.truncated_lines)
    }

    /// Returns the unterminated tail, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            self.discarding = false;
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> String {
        self.discarding = false;
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
