//! Blocking request/response bridge between host callers and a guest loop.
//!
//! Two capacity-1 channels form one rendezvous:
//!
//! ```text
//!  host thread                         guest thread (run loop)
//!  submit(req) ──► [requests; 1] ──►   await_request()
//!                                        ... compute ...
//!  ◄── returns ◄── [responses; 1] ◄──  publish_response(res)
//! ```
//!
//! `submit` holds the bridge for the whole round trip, so at most one
//! request is in flight and responses can never be handed to the wrong
//! caller. One bridge serves one callback pair.
//!
//! A caller is never left waiting on a dead guest: dropping the guest end
//! (which happens when the instance is closed) disconnects both channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::supervisor::RunStatus;
use crate::error::{Result, SandboxError};

/// Create a bridge whose host end consults `status` before each call.
pub fn bridge<Req, Res>(
    status: RunStatus,
    timeout: Option<Duration>,
) -> (HostBridge<Req, Res>, GuestBridge<Req, Res>) {
    let (request_tx, request_rx) = bounded(1);
    let (response_tx, response_rx) = bounded(1);
    let (shutdown_tx, shutdown_rx) = bounded(0);

    let host = HostBridge {
        requests: request_tx,
        responses: response_rx,
        shutdown: Mutex::new(Some(shutdown_tx)),
        in_flight: Mutex::new(()),
        poisoned: AtomicBool::new(false),
        status,
        timeout,
    };
    let guest = GuestBridge {
        requests: request_rx,
        responses: response_tx,
        shutdown: shutdown_rx,
    };
    (host, guest)
}

/// Host side: turns a guest round trip into a blocking call.
pub struct HostBridge<Req, Res> {
    requests: Sender<Req>,
    responses: Receiver<Res>,
    shutdown: Mutex<Option<Sender<()>>>,
    in_flight: Mutex<()>,
    poisoned: AtomicBool,
    status: RunStatus,
    timeout: Option<Duration>,
}

impl<Req, Res> HostBridge<Req, Res> {
    /// Send `request` and block until the guest publishes the response.
    ///
    /// Fails with [`SandboxError::RunLoopStopped`] if the guest has already
    /// terminated, [`SandboxError::BridgeClosed`] if it terminates while the
    /// call is pending, and [`SandboxError::Timeout`] if a deadline is
    /// configured and passes. A timeout poisons the bridge.
    pub fn submit(&self, request: Req) -> Result<Res> {
        let _round_trip = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if self.poisoned.load(Ordering::Acquire) {
            return Err(SandboxError::BridgeClosed);
        }
        if let Some(outcome) = self.status.finished() {
            return Err(SandboxError::RunLoopStopped(outcome.to_string()));
        }

        match self.timeout {
            None => {
                self.requests
                    .send(request)
                    .map_err(|_| SandboxError::BridgeClosed)?;
                self.responses.recv().map_err(|_| SandboxError::BridgeClosed)
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                match self.requests.send_deadline(request, deadline) {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => return Err(self.poison(timeout)),
                    Err(SendTimeoutError::Disconnected(_)) => return Err(SandboxError::BridgeClosed),
                }
                match self.responses.recv_deadline(deadline) {
                    Ok(response) => Ok(response),
                    Err(RecvTimeoutError::Timeout) => Err(self.poison(timeout)),
                    Err(RecvTimeoutError::Disconnected) => Err(SandboxError::BridgeClosed),
                }
            }
        }
    }

    // A late response would otherwise be delivered to the next caller.
    fn poison(&self, timeout: Duration) -> SandboxError {
        tracing::warn!(?timeout, "bridged call timed out; bridge disabled");
        self.poisoned.store(true, Ordering::Release);
        SandboxError::Timeout(timeout)
    }

    /// Wake a guest blocked in [`GuestBridge::await_request`] with
    /// [`SandboxError::BridgeClosed`]. Idempotent.
    pub fn close(&self) {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// True once a call has timed out.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Run-loop status this bridge consults.
    pub fn status(&self) -> &RunStatus {
        &self.status
    }
}

/// Guest side, owned by the instance state of the guest it serves.
pub struct GuestBridge<Req, Res> {
    requests: Receiver<Req>,
    responses: Sender<Res>,
    shutdown: Receiver<()>,
}

impl<Req, Res> GuestBridge<Req, Res> {
    /// Block until a host caller submits a request.
    pub fn await_request(&self) -> Result<Req> {
        select! {
            recv(self.requests) -> request => request.map_err(|_| SandboxError::BridgeClosed),
            recv(self.shutdown) -> _ => Err(SandboxError::BridgeClosed),
        }
    }

    /// Hand the response to the waiting caller.
    pub fn publish_response(&self, response: Res) -> Result<()> {
        select! {
            send(self.responses, response) -> sent => sent.map_err(|_| SandboxError::BridgeClosed),
            recv(self.shutdown) -> _ => Err(SandboxError::BridgeClosed),
        }
    }

    /// Requests queued but not yet received.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::supervisor::RunOutcome;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn serve_adds(guest: GuestBridge<(i32, i32), i32>) -> thread::JoinHandle<SandboxError> {
        thread::spawn(move || loop {
            let (a, b) = match guest.await_request() {
                Ok(request) => request,
                Err(e) => return e,
            };
            if let Err(e) = guest.publish_response(a.wrapping_add(b)) {
                return e;
            }
        })
    }

    #[test]
    fn test_submit_round_trip() {
        let (host, guest) = bridge::<(i32, i32), i32>(RunStatus::new(), None);
        let server = serve_adds(guest);

        assert_eq!(host.submit((1, 2)).unwrap(), 3);
        assert_eq!(host.submit((2, 3)).unwrap(), 5);
        assert_eq!(host.submit((i32::MAX, 1)).unwrap(), i32::MIN);

        host.close();
        assert!(matches!(server.join().unwrap(), SandboxError::BridgeClosed));
    }

    #[test]
    fn test_concurrent_submits_never_overlap() {
        let (host, guest) = bridge::<(i32, i32), i32>(RunStatus::new(), None);
        let host = Arc::new(host);
        let overlaps = Arc::new(AtomicUsize::new(0));

        let server = {
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                while let Ok((a, b)) = guest.await_request() {
                    // Give a competing caller time to sneak a request in
                    thread::sleep(Duration::from_millis(2));
                    if guest.pending_requests() > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    if guest.publish_response(a + b).is_err() {
                        break;
                    }
                }
            })
        };

        let callers: Vec<_> = (0..4)
            .map(|t| {
                let host = Arc::clone(&host);
                thread::spawn(move || {
                    for i in 0..10 {
                        assert_eq!(host.submit((t, i)).unwrap(), t + i);
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        host.close();
        server.join().unwrap();
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_guest_releases_blocked_caller() {
        let (host, guest) = bridge::<i32, i32>(RunStatus::new(), None);
        let (done_tx, done_rx) = mpsc::channel();

        let caller = thread::spawn(move || {
            done_tx.send(host.submit(5)).unwrap();
        });

        // Receive the request, then die without answering
        let request = guest.await_request().unwrap();
        assert_eq!(request, 5);
        drop(guest);

        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("caller still blocked after guest was dropped");
        assert!(matches!(result, Err(SandboxError::BridgeClosed)));
        caller.join().unwrap();
    }

    #[test]
    fn test_timeout_poisons_bridge() {
        let (host, guest) = bridge::<i32, i32>(RunStatus::new(), Some(Duration::from_millis(50)));

        let err = host.submit(1).unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert!(host.is_poisoned());

        // The stale request is still queued; the bridge refuses new work
        assert_eq!(guest.pending_requests(), 1);
        assert!(matches!(host.submit(2), Err(SandboxError::BridgeClosed)));
    }

    #[test]
    fn test_stopped_run_loop_fails_fast() {
        let status = RunStatus::new();
        let (host, _guest) = bridge::<i32, i32>(status.clone(), None);

        status.finish(RunOutcome::ExitedWithError("exit code 3".to_string()));

        match host.submit(1) {
            Err(SandboxError::RunLoopStopped(detail)) => assert!(detail.contains("exit code 3")),
            other => panic!("expected RunLoopStopped, got {:?}", other),
        }
    }

    #[test]
    fn test_close_wakes_guest() {
        let (host, guest) = bridge::<i32, i32>(RunStatus::new(), None);
        let waiter = thread::spawn(move || guest.await_request());

        thread::sleep(Duration::from_millis(10));
        host.close();
        host.close();

        assert!(matches!(waiter.join().unwrap(), Err(SandboxError::BridgeClosed)));
    }
}
