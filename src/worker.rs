//! Inference backends on a dedicated thread, called with a deadline.
//!
//! The orchestrator must never stall on a slow model. Each call is tagged with
//! a sequence number; if the deadline passes the caller gets `CallError::Timeout`
//! and the late answer is discarded when it eventually arrives.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::fmt;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum CallError {
    /// No answer within the deadline.
    Timeout,
    /// The worker thread is gone (backend panicked or shut down).
    Disconnected,
    /// The backend answered with an error.
    Backend(anyhow::Error),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout => write!(f, "timed out"),
            CallError::Disconnected => write!(f, "worker disconnected"),
            CallError::Backend(e) => write!(f, "{:#}", e),
        }
    }
}

impl std::error::Error for CallError {}

type Job<B, Req, Resp> = fn(&mut B, Req) -> anyhow::Result<Resp>;

pub struct InferenceWorker<Req, Resp> {
    name: String,
    requests: Option<Sender<(u64, Req)>>,
    responses: Receiver<(u64, anyhow::Result<Resp>)>,
    next_seq: u64,
    handle: Option<JoinHandle<()>>,
}

impl<Req, Resp> InferenceWorker<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Move `backend` onto its own thread; `job` runs once per request.
    pub fn spawn<B>(name: &str, mut backend: B, job: Job<B, Req, Resp>) -> anyhow::Result<Self>
    where
        B: Send + 'static,
    {
        let (req_tx, req_rx) = bounded::<(u64, Req)>(1);
        let (resp_tx, resp_rx) = bounded::<(u64, anyhow::Result<Resp>)>(4);
        let handle = std::thread::Builder::new()
            .name(format!("{}-worker", name))
            .spawn(move || {
                for (seq, req) in req_rx.iter() {
                    let result = job(&mut backend, req);
                    if resp_tx.send((seq, result)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            requests: Some(req_tx),
            responses: resp_rx,
            next_seq: 0,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit one request and wait at most `timeout` for its answer.
    pub fn call(&mut self, req: Req, timeout: Duration) -> Result<Resp, CallError> {
        let deadline = Instant::now() + timeout;
        let seq = self.next_seq;
        self.next_seq += 1;

        let requests = self.requests.as_ref().ok_or(CallError::Disconnected)?;
        match requests.send_timeout((seq, req), timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(CallError::Timeout),
            Err(SendTimeoutError::Disconnected(_)) => return Err(CallError::Disconnected),
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok((got, result)) if got == seq => {
                    return result.map_err(CallError::Backend);
                }
                Ok((stale, _)) => {
                    log::debug!("{}: dropping late answer for request {}", self.name, stale);
                }
                Err(RecvTimeoutError::Timeout) => return Err(CallError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(CallError::Disconnected),
            }
        }
    }
}

impl<Req, Resp> Drop for InferenceWorker<Req, Resp> {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            // A backend stuck past its deadline is left to finish on its own.
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    fn double(_: &mut Doubler, x: u32) -> anyhow::Result<u32> {
        Ok(x * 2)
    }

    struct Sleepy {
        calls: u32,
    }

    fn sleepy(b: &mut Sleepy, x: u32) -> anyhow::Result<u32> {
        b.calls += 1;
        if b.calls == 1 {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(x)
    }

    fn failing(_: &mut Doubler, _: u32) -> anyhow::Result<u32> {
        Err(anyhow::anyhow!("model exploded"))
    }

    #[test]
    fn answers_within_deadline() {
        let mut w = InferenceWorker::spawn("double", Doubler, double).unwrap();
        assert_eq!(w.call(21, Duration::from_secs(2)).unwrap(), 42);
        assert_eq!(w.call(5, Duration::from_secs(2)).unwrap(), 10);
    }

    #[test]
    fn late_answers_are_discarded() {
        let mut w = InferenceWorker::spawn("sleepy", Sleepy { calls: 0 }, sleepy).unwrap();
        assert!(matches!(
            w.call(1, Duration::from_millis(20)),
            Err(CallError::Timeout)
        ));
        // The next call must not see the stale answer `1`.
        assert_eq!(w.call(2, Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn backend_errors_surface() {
        let mut w = InferenceWorker::spawn("fail", Doubler, failing).unwrap();
        let err = w.call(1, Duration::from_secs(2)).unwrap_err();
        assert!(err.to_string().contains("model exploded"));
    }
}
