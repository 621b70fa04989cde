//! Pairs control point requests with their notifications.
//!
//! The DFU control point carries no request id: the next notification is the
//! answer to the last request. [`ResponseWaiter`] therefore requires exclusive
//! (`&mut`) access per request, so at most one request is outstanding, and it
//! discards notifications that arrived while nothing was waiting.

use crate::error::DfuCause;
use crate::protocol::RESPONSE_MARKER;
use crate::transport::{ControlChannel, TransportError};

use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{trace, warn};

pub struct ResponseWaiter {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    listener: JoinHandle<()>,
    timeout: Duration,
}

impl ResponseWaiter {
    /// Subscribe once to the control channel and queue everything it notifies.
    pub async fn subscribe<C: ControlChannel>(control: &C, timeout: Duration) -> Result<Self, TransportError> {
        let mut notifications = control.notifications().await?;
        let (tx, inbound) = mpsc::unbounded_channel();
        let listener = tokio::spawn(async move {
            while let Some(frame) = notifications.next().await {
                trace!(frame = ?frame, "control point notification");
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            inbound,
            listener,
            timeout,
        })
    }

    /// Drop queued notifications no request is waiting for, returning how many.
    pub fn discard_stale(&mut self) -> usize {
        let mut discarded = 0;
        while let Ok(frame) = self.inbound.try_recv() {
            warn!(frame = ?frame, "discarding unsolicited notification");
            discarded += 1;
        }
        discarded
    }

    /// Wait for the response to the request just written.
    ///
    /// Well-formed responses echoing another opcode than `expected_opcode`
    /// are skipped; the deadline is not extended for them. Anything else is
    /// returned as received and left to the caller to decode.
    pub async fn await_response(&mut self, expected_opcode: Option<u8>) -> Result<Vec<u8>, DfuCause> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let frame = match timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(TransportError::NotificationsClosed.into()),
                Err(_) => return Err(DfuCause::Timeout { timeout: self.timeout }),
            };
            if let Some(opcode) = expected_opcode {
                if frame.len() >= 2 && frame[0] == RESPONSE_MARKER && frame[1] != opcode {
                    warn!(frame = ?frame, expected = opcode, "response to another request, ignoring");
                    continue;
                }
            }
            return Ok(frame);
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Notifications;
    use futures::channel::mpsc as fmpsc;
    use std::sync::Mutex;

    struct ScriptedControl {
        tx: fmpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<Option<fmpsc::UnboundedReceiver<Vec<u8>>>>,
    }

    impl ScriptedControl {
        fn new() -> Self {
            let (tx, rx) = fmpsc::unbounded();
            Self {
                tx,
                rx: Mutex::new(Some(rx)),
            }
        }

        fn notify(&self, frame: &[u8]) {
            self.tx.unbounded_send(frame.to_vec()).unwrap();
        }
    }

    impl ControlChannel for ScriptedControl {
        async fn write(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn notifications(&self) -> Result<Notifications, TransportError> {
            let rx = self.rx.lock().unwrap().take().ok_or(TransportError::NotificationsClosed)?;
            Ok(rx.boxed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_exactly_the_operation_timeout() {
        let control = ScriptedControl::new();
        let timeout = Duration::from_millis(500);
        let mut waiter = ResponseWaiter::subscribe(&control, timeout).await.unwrap();

        let started = Instant::now();
        let result = waiter.await_response(Some(0x03)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(DfuCause::Timeout { timeout: t }) if t == timeout));
        assert!(elapsed >= timeout, "timed out early after {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(10), "timed out late after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_with_raw_frame() {
        let control = ScriptedControl::new();
        let mut waiter = ResponseWaiter::subscribe(&control, Duration::from_millis(500)).await.unwrap();
        control.notify(&[0x60, 0x04, 0x01]);
        assert_eq!(waiter.await_response(Some(0x04)).await.unwrap(), vec![0x60, 0x04, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_response_for_other_opcode() {
        let control = ScriptedControl::new();
        let mut waiter = ResponseWaiter::subscribe(&control, Duration::from_millis(500)).await.unwrap();
        control.notify(&[0x60, 0x03, 0x01, 0, 0, 0, 0, 0, 0, 0, 0]);
        control.notify(&[0x60, 0x04, 0x01]);
        assert_eq!(waiter.await_response(Some(0x04)).await.unwrap(), vec![0x60, 0x04, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_returned() {
        let control = ScriptedControl::new();
        let mut waiter = ResponseWaiter::subscribe(&control, Duration::from_millis(500)).await.unwrap();
        control.notify(&[0x20, 0x04, 0x01]);
        assert_eq!(waiter.await_response(Some(0x04)).await.unwrap(), vec![0x20, 0x04, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_stale_notifications() {
        let control = ScriptedControl::new();
        let mut waiter = ResponseWaiter::subscribe(&control, Duration::from_millis(500)).await.unwrap();
        control.notify(&[0x60, 0x03, 0x01]);
        control.notify(&[0x60, 0x04, 0x01]);
        // let the listener forward both frames
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(waiter.discard_stale(), 2);
        assert!(waiter.await_response(None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_notifications() {
        let control = ScriptedControl::new();
        let mut waiter = ResponseWaiter::subscribe(&control, Duration::from_millis(500)).await.unwrap();
        drop(control);
        let result = waiter.await_response(None).await;
        assert!(matches!(result, Err(DfuCause::Transport(TransportError::NotificationsClosed))));
    }
}
