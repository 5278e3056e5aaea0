//! Console device behind descriptors 0 and 1.

use std::collections::VecDeque;
use std::io::{self, Write};

enum ConsoleSink {
    Stdout,
    Buffer(Vec<u8>),
}

/// Byte-stream console: queued input, and output to the host's stdout or,
/// for tests, to an inspectable buffer.
pub struct Console {
    input: VecDeque<u8>,
    sink: ConsoleSink,
}

impl Console {
    pub fn stdout() -> Self {
        Self {
            input: VecDeque::new(),
            sink: ConsoleSink::Stdout,
        }
    }

    pub fn buffered() -> Self {
        Self {
            input: VecDeque::new(),
            sink: ConsoleSink::Buffer(Vec::new()),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        match &mut self.sink {
            ConsoleSink::Stdout => {
                let mut out = io::stdout();
                out.write_all(bytes).and_then(|_| out.flush()).ok();
            }
            ConsoleSink::Buffer(buf) => buf.extend_from_slice(bytes),
        }
    }

    /// Take up to `max` queued input bytes; an empty result is end of input.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.input.len());
        self.input.drain(..n).collect()
    }

    pub fn feed_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    /// Drain captured output; empty unless the console is buffered.
    pub fn take_output(&mut self) -> Vec<u8> {
        match &mut self.sink {
            ConsoleSink::Stdout => Vec::new(),
            ConsoleSink::Buffer(buf) => std::mem::take(buf),
        }
    }
}
