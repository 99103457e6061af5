//! Pure-software CAN device.
//!
//! A `SoftDevice` has no bus behind it: frames it would transmit are
//! recorded, and frames it should receive are scripted through its
//! [`SoftHandle`]. That makes it the device of choice for exercising the
//! gateway on a host without CAN hardware, and for tests that need to
//! observe exactly what left on which interface.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::device::{CANDevice, Ingress, SendStatus};

/// A frame as seen on the soft device's fake bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFrame {
    pub id: u32,
    pub flags: u8,
    pub data: Vec<u8>,
}

struct SoftState {
    link_up: bool,
    defer_sends: u32,
    fail_sends: bool,
    sent: Vec<SoftFrame>,
    pending: VecDeque<SoftFrame>,
}

/// The driver half, handed to [`Stack::attach`](crate::Stack::attach).
pub struct SoftDevice {
    state: Arc<Mutex<SoftState>>,
}

/// The scripting half, kept by the test or host application.
#[derive(Clone)]
pub struct SoftHandle {
    state: Arc<Mutex<SoftState>>,
}

impl SoftDevice {
    pub fn new() -> (SoftDevice, SoftHandle) {
        let state = Arc::new(Mutex::new(SoftState {
            link_up: true,
            defer_sends: 0,
            fail_sends: false,
            sent: Vec::new(),
            pending: VecDeque::new(),
        }));

        (
            SoftDevice {
                state: state.clone(),
            },
            SoftHandle { state },
        )
    }
}

impl CANDevice for SoftDevice {
    fn link_state(&self) -> bool {
        self.state.lock().unwrap().link_up
    }

    fn send(&mut self, id: u32, flags: u8, data: &[u8]) -> SendStatus {
        let mut state = self.state.lock().unwrap();

        if state.fail_sends {
            return SendStatus::Failed;
        }
        if state.defer_sends > 0 {
            state.defer_sends -= 1;
            return SendStatus::WouldBlock;
        }

        state.sent.push(SoftFrame {
            id,
            flags,
            data: data.to_vec(),
        });
        SendStatus::Sent
    }

    fn poll(&mut self, rx: &Ingress, mut loop_score: i32) -> i32 {
        while loop_score > 0 {
            let frame = match self.state.lock().unwrap().pending.pop_front() {
                Some(frame) => frame,
                None => break,
            };

            if rx.receive(frame.id, frame.flags, &frame.data).is_err() {
                debug!("soft device: ingress rejected frame {:#x}", frame.id);
            }
            loop_score -= 1;
        }

        loop_score
    }
}

impl SoftHandle {
    /// Raise or drop the fake link.
    pub fn set_link(&self, up: bool) {
        self.state.lock().unwrap().link_up = up;
    }

    /// Make the next `count` transmit attempts report `WouldBlock`.
    pub fn defer_sends(&self, count: u32) {
        self.state.lock().unwrap().defer_sends = count;
    }

    /// Make every transmit attempt fail permanently until reset.
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Script a frame for the device to deliver on its next poll.
    pub fn push_rx(&self, id: u32, flags: u8, data: &[u8]) {
        self.state.lock().unwrap().pending.push_back(SoftFrame {
            id,
            flags,
            data: data.to_vec(),
        });
    }

    /// Everything the device has transmitted so far, oldest first.
    pub fn sent(&self) -> Vec<SoftFrame> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_sent_frames_in_order() {
        let (mut dev, handle) = SoftDevice::new();

        assert_eq!(dev.send(1, 0, &[0xa]), SendStatus::Sent);
        assert_eq!(dev.send(2, 0, &[0xb]), SendStatus::Sent);

        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id, 1);
        assert_eq!(sent[1].id, 2);
    }

    #[test]
    fn deferred_sends_then_recover() {
        let (mut dev, handle) = SoftDevice::new();
        handle.defer_sends(2);

        assert_eq!(dev.send(1, 0, &[]), SendStatus::WouldBlock);
        assert_eq!(dev.send(1, 0, &[]), SendStatus::WouldBlock);
        assert_eq!(dev.send(1, 0, &[]), SendStatus::Sent);
        assert_eq!(handle.sent().len(), 1);
    }

    #[test]
    fn failing_sends_record_nothing() {
        let (mut dev, handle) = SoftDevice::new();
        handle.fail_sends(true);

        assert_eq!(dev.send(1, 0, &[]), SendStatus::Failed);
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn link_state_follows_the_handle() {
        let (dev, handle) = SoftDevice::new();
        assert!(dev.link_state());

        handle.set_link(false);
        assert!(!dev.link_state());
    }

    #[test]
    fn poll_delivers_scripted_frames_within_budget() {
        let (mut dev, handle) = SoftDevice::new();
        let ingress = Ingress::new(0, 8);

        for n in 0..3 {
            handle.push_rx(0x10 + n, 0, &[n as u8]);
        }

        let remaining = dev.poll(&ingress, 2);
        assert_eq!(remaining, 0);
        assert_eq!(ingress.pending(), 2);

        let remaining = dev.poll(&ingress, 2);
        assert_eq!(remaining, 1);
        assert_eq!(ingress.pending(), 3);
    }
}
