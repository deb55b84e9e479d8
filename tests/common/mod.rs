//! Scripted stream sources and recording sinks shared by the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ipcam_ingest::{Connection, Frame, FrameSink, Image, ReadOutcome, StreamSource, StreamUri};

/// One scripted read.
#[derive(Clone, Debug)]
pub enum Step {
    Frame,
    Empty,
    Error,
    End,
    Panic,
}

/// Opens `ScriptedConnection`s and records every URI it was asked to open.
pub struct ScriptedSource {
    script: Vec<Step>,
    read_latency: Duration,
    fail_hosts: Vec<String>,
    opened: Mutex<Vec<String>>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedSource {
    /// Endless frames after the script is exhausted.
    pub fn new(script: Vec<Step>, read_latency: Duration) -> Self {
        Self {
            script,
            read_latency,
            fail_hosts: Vec::new(),
            opened: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn frames(read_latency: Duration) -> Self {
        Self::new(Vec::new(), read_latency)
    }

    /// Opening any camera on `host` fails with `ConnectionRefused`.
    pub fn failing_for(mut self, host: &str) -> Self {
        self.fail_hosts.push(host.to_string());
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl StreamSource for ScriptedSource {
    fn open(&self, uri: &StreamUri) -> Result<Box<dyn Connection>> {
        self.opened.lock().unwrap().push(uri.as_str().to_string());
        if self.fail_hosts.iter().any(|host| host == uri.host()) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "camera unreachable").into());
        }
        Ok(Box::new(ScriptedConnection {
            steps: self.script.iter().cloned().collect(),
            read_latency: self.read_latency,
            counter: 0,
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct ScriptedConnection {
    steps: VecDeque<Step>,
    read_latency: Duration,
    counter: u8,
    closed: Arc<AtomicUsize>,
}

impl Connection for ScriptedConnection {
    fn read(&mut self) -> Result<ReadOutcome> {
        std::thread::sleep(self.read_latency);
        match self.steps.pop_front().unwrap_or(Step::Frame) {
            Step::Frame => {
                self.counter = self.counter.wrapping_add(1);
                Ok(ReadOutcome::Frame(Image::new(vec![self.counter; 12], 2, 2)))
            }
            Step::Empty => Ok(ReadOutcome::Empty),
            Step::Error => Err(anyhow!("decode error")),
            Step::End => Ok(ReadOutcome::EndOfStream),
            Step::Panic => panic!("decoder crashed"),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects delivered frames; optionally rejects or panics on some of them.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
    reject_sequences: Vec<u64>,
    panic_on_first: AtomicBool,
    delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(sequences: Vec<u64>) -> Self {
        Self {
            reject_sequences: sequences,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_on_first: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frames_for(&self, camera: &str) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.camera() == camera)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn count_for(&self, camera: &str) -> usize {
        self.frames_for(camera).len()
    }
}

impl FrameSink for RecordingSink {
    fn handle(&self, frame: Frame) -> Result<()> {
        if self.panic_on_first.swap(false, Ordering::SeqCst) {
            panic!("sink exploded");
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let rejected = self.reject_sequences.contains(&frame.sequence);
        self.frames.lock().unwrap().push(frame);
        if rejected {
            return Err(anyhow!("downstream rejected frame"));
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
