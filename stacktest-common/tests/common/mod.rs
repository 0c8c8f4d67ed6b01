//! Shared helpers for stacktest-common integration tests.

#![allow(dead_code)]

use std::io::Read;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use stacktest_common::StreamTracker;

/// A `Read` fed line by line from the test body. Dropping the feeder ends
/// the stream.
pub struct ScriptedStream {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

pub struct Feeder {
    tx: Sender<Vec<u8>>,
}

impl Feeder {
    pub fn line(&self, line: &str) {
        self.tx
            .send(format!("{line}\n").into_bytes())
            .expect("stream reader gone");
    }
}

pub fn scripted_stream() -> (Feeder, ScriptedStream) {
    let (tx, rx) = channel();
    (
        Feeder { tx },
        ScriptedStream {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

impl Read for ScriptedStream {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos == self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Block until the tracker has seen at least `count` lines.
pub fn wait_for_lines(tracker: &StreamTracker, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while tracker.history().len() < count {
        assert!(
            Instant::now() < deadline,
            "tracker saw {} lines, expected {count}",
            tracker.history().len()
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}
