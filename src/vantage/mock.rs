//! Scripted transport for driver tests.
//!
//! Each scripted chunk answers at most one `read` call, which lets a test
//! control exactly what the console "sends" between probes. Writes are
//! recorded into a shared log so assertions can run after a guard drop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::WxResult;
use crate::vantage::transport::{PortOpener, Transport};

/// Shared log of every `write_all` call, in order.
pub type WriteLog = Arc<Mutex<Vec<Vec<u8>>>>;

pub struct MockPort {
    script: VecDeque<Vec<u8>>,
    written: WriteLog,
    input_flushes: usize,
}

impl MockPort {
    /// Build a mock whose successive `read` calls return the given chunks.
    pub fn scripted(script: Vec<Vec<u8>>) -> (Self, WriteLog) {
        let written: WriteLog = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script: script.into(),
                written: Arc::clone(&written),
                input_flushes: 0,
            },
            written,
        )
    }

    pub fn input_flushes(&self) -> usize {
        self.input_flushes
    }
}

impl Transport for MockPort {
    fn write_all(&mut self, data: &[u8]) -> WxResult<()> {
        self.written
            .lock()
            .map_err(|_| crate::error::WxError::Store("poisoned mock log".into()))?
            .push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, n: usize) -> WxResult<Vec<u8>> {
        match self.script.pop_front() {
            None => Ok(Vec::new()),
            Some(mut chunk) => {
                if chunk.len() > n {
                    let rest = chunk.split_off(n);
                    self.script.push_front(rest);
                }
                Ok(chunk)
            }
        }
    }

    fn flush_input(&mut self) -> WxResult<()> {
        // Scripted responses survive flushes; the real port discards noise
        // here, the mock just counts the calls.
        self.input_flushes += 1;
        Ok(())
    }

    fn flush_output(&mut self) -> WxResult<()> {
        Ok(())
    }

    fn bytes_waiting(&mut self) -> WxResult<usize> {
        Ok(self.script.front().map_or(0, Vec::len))
    }
}

/// [`PortOpener`] handing out pre-scripted ports, one per acquisition.
pub struct MockOpener {
    sessions: Mutex<VecDeque<Vec<Vec<u8>>>>,
    written: WriteLog,
}

impl MockOpener {
    /// One inner `Vec<Vec<u8>>` script per expected port acquisition.
    pub fn new(sessions: Vec<Vec<Vec<u8>>>) -> (Arc<Self>, WriteLog) {
        let written: WriteLog = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                written: Arc::clone(&written),
            }),
            written,
        )
    }
}

impl PortOpener for MockOpener {
    fn open(&self) -> WxResult<Box<dyn Transport>> {
        let script = self
            .sessions
            .lock()
            .map_err(|_| crate::error::WxError::Store("poisoned mock opener".into()))?
            .pop_front()
            .unwrap_or_default();
        Ok(Box::new(MockPort {
            script: script.into(),
            written: Arc::clone(&self.written),
            input_flushes: 0,
        }))
    }
}
