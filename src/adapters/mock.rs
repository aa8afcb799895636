//! Scripted mock transport for protocol tests.
//!
//! `MockTransport` plays the role of the controller: tests queue the raw
//! response bytes the controller would send, run the code under test, then
//! inspect every frame that was written. Reads drain the queued responses in
//! order; an empty queue behaves like a receive timeout (short read).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::adapters::Transport;
use crate::error::RackResult;

#[derive(Default)]
struct Script {
    written: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
}

/// Shared handle onto a [`MockTransport`]'s script.
///
/// The transport itself is moved into the session under test; the handle
/// stays with the test to queue responses and read back the write log.
#[derive(Clone, Default)]
pub struct MockScript {
    inner: Arc<Mutex<Script>>,
}

impl MockScript {
    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the raw bytes of one controller response.
    pub fn push_response(&self, bytes: impl Into<Vec<u8>>) {
        self.lock().responses.push_back(bytes.into());
    }

    /// All frames written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Number of frames written so far.
    pub fn write_count(&self) -> usize {
        self.lock().written.len()
    }

    /// Drop the write log (keeps queued responses).
    pub fn clear_written(&self) {
        self.lock().written.clear();
    }
}

/// A [`Transport`] that records writes and replays scripted responses.
pub struct MockTransport {
    script: MockScript,
    timeout: Duration,
}

impl MockTransport {
    /// Create a transport plus the script handle used to drive it.
    pub fn new() -> (Self, MockScript) {
        let script = MockScript::default();
        (
            Self {
                script: script.clone(),
                timeout: Duration::from_millis(50),
            },
            script,
        )
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> RackResult<()> {
        self.script.lock().written.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> RackResult<usize> {
        let mut script = self.script.lock();
        match script.responses.pop_front() {
            Some(response) => {
                let n = response.len().min(buf.len());
                buf[..n].copy_from_slice(&response[..n]);
                // Anything past the caller's buffer is surplus scripting and
                // dropped, matching a controller that never over-sends.
                Ok(n)
            }
            // No scripted response: behave like a receive timeout.
            None => Ok(0),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_drain_in_order() {
        let (mut transport, script) = MockTransport::new();
        script.push_response([0x06, 0x01]);
        script.push_response([0x06]);

        let mut buf = [0u8; 2];
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0x06, 0x01]);

        let mut buf = [0u8; 1];
        assert_eq!(transport.read(&mut buf).unwrap(), 1);
        assert_eq!(buf, [0x06]);

        // Queue empty: short read, like a timeout.
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_are_recorded() {
        let (mut transport, script) = MockTransport::new();
        transport.write(&[b'u']).unwrap();
        transport.write(&[b'w', 0x12]).unwrap();
        assert_eq!(script.written(), vec![vec![b'u'], vec![b'w', 0x12]]);
    }
}
