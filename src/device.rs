//! Device abstraction.
//!
//! A device is one physical or virtual CAN interface presented to the
//! gateway. Drivers implement [`CANDevice`]; the stack owns one
//! registered entry per device id with its ingress and egress queues.
//!
//! Frames enter the gateway through [`Ingress::receive`], the one
//! admission point a driver (or an interrupt/IO context working on its
//! behalf) calls when a frame arrives from the bus. The ingress queue is
//! lock-free, so `receive` is safe to call concurrently with the
//! scheduler draining the same queue on the tick thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use log::debug;
use thiserror::Error;

use crate::frame::{Frame, FrameError};
use crate::queue::FrameQueue;

/// Index of a registered device in the pool.
pub type DeviceId = u8;

/// Upper bound on registered bus interfaces.
pub const MAX_DEVICES: usize = 8;

/// Outcome of a driver transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted for transmission; the gateway may discard the frame.
    Sent,
    /// The device cannot take the frame right now; retry next tick.
    WouldBlock,
    /// Permanent failure for this frame; drop and advance.
    Failed,
}

/// Capability contract every bus driver satisfies.
///
/// All operations are non-blocking from the gateway's point of view.
/// Teardown is `Drop`, symmetric with the driver's constructor.
pub trait CANDevice {
    /// Whether the underlying link is up.
    fn link_state(&self) -> bool;

    /// Hand one frame to the device for transmission. The driver must
    /// not retain `data` beyond this call.
    fn send(&mut self, id: u32, flags: u8, data: &[u8]) -> SendStatus;

    /// Pull up to `loop_score` frames from the underlying source and
    /// feed each through [`Ingress::receive`]. Returns the remaining
    /// budget.
    fn poll(&mut self, rx: &Ingress, loop_score: i32) -> i32;
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Ingress queue is full; frame dropped.")]
    Overrun,
}

/// Admission handle for one device's ingress queue.
///
/// Clones share the same queue, so a driver can keep one clone in its
/// receive context while the stack drains through another.
#[derive(Clone)]
pub struct Ingress {
    dev: DeviceId,
    queue: Arc<ArrayQueue<Frame>>,
    dropped: Arc<AtomicU64>,
}

impl Ingress {
    pub(crate) fn new(dev: DeviceId, capacity: usize) -> Ingress {
        Ingress {
            dev,
            // a zero-capacity ingress queue could never admit anything
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admit one received frame into the gateway.
    ///
    /// Builds the frame, stamps it with the receiving interface and
    /// appends it to the device's ingress queue. A full queue drops the
    /// frame and counts the overrun.
    pub fn receive(&self, id: u32, flags: u8, data: &[u8]) -> Result<(), RecvError> {
        let mut frame = Frame::new(id, flags, data)?;
        frame.set_source(self.dev);

        match self.queue.push(frame) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("dev {}: ingress overrun, frame {:#x} dropped", self.dev, id);
                Err(RecvError::Overrun)
            }
        }
    }

    /// Id of the device this handle admits frames for.
    pub fn device(&self) -> DeviceId {
        self.dev
    }

    /// Frames dropped because the ingress queue was full.
    pub fn overruns(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn pop(&self) -> Option<Frame> {
        self.queue.pop().ok()
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Pool-side record of one registered device.
pub(crate) struct DeviceEntry {
    pub(crate) name: String,
    pub(crate) ingress: Ingress,
    pub(crate) q_out: FrameQueue,
    pub(crate) driver: Box<dyn CANDevice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_stamps_the_source_device() {
        let ingress = Ingress::new(3, 4);
        ingress.receive(0x10, 0, &[1]).unwrap();

        let frame = ingress.pop().unwrap();
        assert_eq!(frame.source(), Some(3));
        assert_eq!(frame.id(), 0x10);
        assert_eq!(frame.data(), &[1]);
    }

    #[test]
    fn receive_preserves_admission_order() {
        let ingress = Ingress::new(0, 8);
        for id in 0..5 {
            ingress.receive(id, 0, &[]).unwrap();
        }

        for id in 0..5 {
            assert_eq!(ingress.pop().unwrap().id(), id);
        }
        assert!(ingress.pop().is_none());
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let ingress = Ingress::new(0, 2);
        ingress.receive(1, 0, &[]).unwrap();
        ingress.receive(2, 0, &[]).unwrap();

        match ingress.receive(3, 0, &[]) {
            Err(RecvError::Overrun) => {}
            other => panic!("expected overrun, got {:?}", other.err()),
        }
        assert_eq!(ingress.overruns(), 1);
        assert_eq!(ingress.pending(), 2);
    }

    #[test]
    fn invalid_frames_are_rejected_before_queueing() {
        let ingress = Ingress::new(0, 2);
        assert!(ingress.receive(0x20000000, 0, &[]).is_err());
        assert_eq!(ingress.pending(), 0);
        assert_eq!(ingress.overruns(), 0);
    }

    #[test]
    fn clones_share_the_queue() {
        let ingress = Ingress::new(0, 4);
        let producer = ingress.clone();

        producer.receive(0x55, 0, &[0xaa]).unwrap();
        assert_eq!(ingress.pending(), 1);
        assert_eq!(ingress.pop().unwrap().id(), 0x55);
    }
}
