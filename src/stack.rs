//! Gateway stack: device pool, datalink layer and the cooperative
//! scheduler.
//!
//! The stack owns every registered device together with its queues and
//! the routing state. All forwarding work happens inside [`Stack::tick`],
//! which the host calls periodically: one tick drains ingress queues
//! through filter and router, then pushes egress queues out to the
//! devices, all bounded by a single loop-score budget so a busy bus can
//! never starve the host.

use log::{debug, info, warn};
use thiserror::Error;

use crate::device::{CANDevice, DeviceEntry, DeviceId, Ingress, SendStatus, MAX_DEVICES};
use crate::filter::FilterTable;
use crate::frame::{Frame, FrameError};
use crate::queue::FrameQueue;
use crate::router::{self, RoutingTable};

#[derive(Debug, Error)]
pub enum StackError {
    #[error("Device id {0} is outside the device pool.")]
    BadDeviceId(DeviceId),
    #[error("Device id {0} is already registered.")]
    DeviceExists(DeviceId),
    #[error("No device registered at id {0}.")]
    NoSuchDevice(DeviceId),
}

/// Tuning knobs for one stack instance.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// Work budget per tick, shared by the ingress and egress passes.
    pub loop_score: i32,
    /// Depth of each per-device ingress queue.
    pub ingress_capacity: usize,
    /// Depth cap of each per-device egress queue; 0 disables the cap.
    pub egress_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> StackConfig {
        StackConfig {
            loop_score: 20,
            ingress_capacity: 64,
            egress_capacity: 0,
        }
    }
}

/// Drop counters. Every loss in the gateway is local and ends up here.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Frames rejected by the ingress filter.
    pub filtered: u64,
    /// Frames with no matching routing entry.
    pub unrouted: u64,
    /// Destination skips: device unregistered or link down.
    pub dest_down: u64,
    /// Frame copies dropped on a full egress queue.
    pub egress_overrun: u64,
    /// Frames dropped after a permanent transmit failure.
    pub tx_failed: u64,
}

enum Direction {
    In,
    Out,
}

/// The gateway core.
pub struct Stack {
    devices: [Option<DeviceEntry>; MAX_DEVICES],
    filter: FilterTable,
    routes: RoutingTable,
    config: StackConfig,
    stats: Stats,
}

impl Stack {
    pub fn new(config: StackConfig, filter: FilterTable, routes: RoutingTable) -> Stack {
        Stack {
            devices: Default::default(),
            filter,
            routes,
            config,
            stats: Stats::default(),
        }
    }

    /// Register a driver at `id` and hand back the ingress handle for
    /// its receive context.
    pub fn attach(
        &mut self,
        id: DeviceId,
        name: &str,
        driver: Box<dyn CANDevice>,
    ) -> Result<Ingress, StackError> {
        let slot = id as usize;
        if slot >= MAX_DEVICES {
            return Err(StackError::BadDeviceId(id));
        }
        if self.devices[slot].is_some() {
            return Err(StackError::DeviceExists(id));
        }

        let ingress = Ingress::new(id, self.config.ingress_capacity);
        self.devices[slot] = Some(DeviceEntry {
            name: name.to_string(),
            ingress: ingress.clone(),
            q_out: FrameQueue::new(self.config.egress_capacity),
            driver,
        });

        info!("dev {} ({}): attached", id, name);
        Ok(ingress)
    }

    /// Unregister the device at `id`, draining its queues and dropping
    /// the driver.
    pub fn detach(&mut self, id: DeviceId) -> Result<(), StackError> {
        let slot = id as usize;
        if slot >= MAX_DEVICES {
            return Err(StackError::BadDeviceId(id));
        }

        match self.devices[slot].take() {
            Some(mut entry) => {
                entry.q_out.drain();
                info!("dev {} ({}): detached", id, entry.name);
                Ok(())
            }
            None => Err(StackError::NoSuchDevice(id)),
        }
    }

    pub fn is_attached(&self, id: DeviceId) -> bool {
        self.entry(id).is_some()
    }

    /// One cooperative scheduler pass. The ingress pass runs first with
    /// the whole budget; the egress pass gets whatever is left.
    pub fn tick(&mut self) {
        let remaining = self.devices_loop(self.config.loop_score, Direction::In);
        self.devices_loop(remaining, Direction::Out);
    }

    /// Route a host-originated frame.
    ///
    /// The frame enters the routing path directly; the ingress filter
    /// only applies to bus traffic.
    pub fn inject(&mut self, id: u32, flags: u8, data: &[u8]) -> Result<(), FrameError> {
        let frame = Frame::new(id, flags, data)?;
        debug!("host frame {:X} entering routing", frame);
        router::dispatch(&self.routes, &mut self.devices, &mut self.stats, frame);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn ingress_depth(&self, id: DeviceId) -> usize {
        self.entry(id).map_or(0, |dev| dev.ingress.pending())
    }

    pub fn ingress_overruns(&self, id: DeviceId) -> u64 {
        self.entry(id).map_or(0, |dev| dev.ingress.overruns())
    }

    pub fn egress_depth(&self, id: DeviceId) -> usize {
        self.entry(id).map_or(0, |dev| dev.q_out.len())
    }

    fn entry(&self, id: DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(id as usize).and_then(|d| d.as_ref())
    }

    /// Filter, then route. Rejected frames die here.
    fn datalink_receive(&mut self, frame: Frame) {
        if !self.filter.accepts(frame.source(), frame.id()) {
            self.stats.filtered += 1;
            debug!("filter rejected frame {:X}", frame);
            return;
        }

        router::dispatch(&self.routes, &mut self.devices, &mut self.stats, frame);
    }

    fn devices_loop(&mut self, mut loop_score: i32, direction: Direction) -> i32 {
        for slot in 0..MAX_DEVICES {
            if loop_score <= 0 {
                break;
            }
            if self.devices[slot].is_none() {
                continue;
            }

            loop_score = match direction {
                Direction::In => self.devloop_in(slot, loop_score),
                Direction::Out => self.devloop_out(slot, loop_score),
            };
        }

        loop_score
    }

    fn devloop_in(&mut self, slot: usize, mut loop_score: i32) -> i32 {
        // let the driver pull fresh frames from its source first
        if let Some(dev) = self.devices[slot].as_mut() {
            loop_score = dev.driver.poll(&dev.ingress, loop_score);
        }

        while loop_score > 0 {
            let frame = match self.devices[slot].as_ref() {
                Some(dev) => dev.ingress.pop(),
                None => None,
            };

            match frame {
                Some(frame) => {
                    self.datalink_receive(frame);
                    loop_score -= 1;
                }
                None => break,
            }
        }

        loop_score
    }

    fn devloop_out(&mut self, slot: usize, mut loop_score: i32) -> i32 {
        let dev = match self.devices[slot].as_mut() {
            Some(dev) => dev,
            None => return loop_score,
        };

        while loop_score > 0 {
            // peek so a frame the device cannot take yet stays at the
            // head for the next tick
            let status = match dev.q_out.peek() {
                Some(frame) => dev.driver.send(frame.id(), frame.flags(), frame.data()),
                None => break,
            };

            match status {
                SendStatus::Sent => {
                    dev.q_out.dequeue();
                    loop_score -= 1;
                }
                SendStatus::WouldBlock => break,
                SendStatus::Failed => {
                    let frame = dev.q_out.dequeue();
                    self.stats.tx_failed += 1;
                    loop_score -= 1;
                    if let Some(frame) = frame {
                        warn!("dev {}: transmit failed, frame {:#x} dropped", slot, frame.id());
                    }
                }
            }
        }

        loop_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutingEntry;
    use crate::soft::{SoftDevice, SoftHandle};

    fn stack_with(
        devices: u8,
        config: StackConfig,
        filter: FilterTable,
        entries: Vec<RoutingEntry>,
    ) -> (Stack, Vec<Ingress>, Vec<SoftHandle>) {
        let routes = RoutingTable::new(entries).unwrap();
        let mut stack = Stack::new(config, filter, routes);

        let mut ingresses = Vec::new();
        let mut handles = Vec::new();
        for id in 0..devices {
            let (dev, handle) = SoftDevice::new();
            let ingress = stack
                .attach(id, &format!("soft{}", id), Box::new(dev))
                .unwrap();
            ingresses.push(ingress);
            handles.push(handle);
        }

        (stack, ingresses, handles)
    }

    #[test]
    fn fan_out_to_routed_destinations() {
        let (mut stack, ingress, handles) = stack_with(
            3,
            StackConfig::default(),
            FilterTable::accepting(&[1, 2]),
            vec![
                RoutingEntry::new(1, &[0, 1]),
                RoutingEntry::new(2, &[0, 2]),
            ],
        );

        ingress[2].receive(1, 0, &[0xaa, 0xbb]).unwrap();
        stack.tick();

        let sent = handles[0].sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 1);
        assert_eq!(sent[0].data, vec![0xaa, 0xbb]);

        let sent = handles[1].sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, vec![0xaa, 0xbb]);

        assert!(handles[2].sent().is_empty());
        assert_eq!(stack.stats().unrouted, 0);
    }

    #[test]
    fn fan_out_queues_when_destinations_block() {
        let (mut stack, ingress, handles) = stack_with(
            3,
            StackConfig::default(),
            FilterTable::accepting(&[1]),
            vec![RoutingEntry::new(1, &[0, 1])],
        );
        handles[0].defer_sends(u32::max_value());
        handles[1].defer_sends(u32::max_value());

        ingress[2].receive(1, 0, &[0x01, 0x02]).unwrap();
        stack.tick();

        assert_eq!(stack.egress_depth(0), 1);
        assert_eq!(stack.egress_depth(1), 1);
        assert_eq!(stack.egress_depth(2), 0);
    }

    #[test]
    fn unrouted_frames_are_dropped_and_counted() {
        let (mut stack, ingress, handles) = stack_with(
            3,
            StackConfig::default(),
            FilterTable::open(),
            vec![
                RoutingEntry::new(1, &[0, 1]),
                RoutingEntry::new(2, &[0, 2]),
            ],
        );

        ingress[0].receive(99, 0, &[0]).unwrap();
        stack.tick();

        assert_eq!(stack.stats().unrouted, 1);
        for id in 0..3 {
            assert_eq!(stack.egress_depth(id), 0);
            assert!(handles[id as usize].sent().is_empty());
        }
    }

    #[test]
    fn down_destination_is_skipped() {
        let (mut stack, ingress, handles) = stack_with(
            2,
            StackConfig::default(),
            FilterTable::open(),
            vec![RoutingEntry::new(1, &[0, 1])],
        );
        handles[1].set_link(false);

        ingress[0].receive(1, 0, &[1, 2, 3]).unwrap();
        stack.tick();

        assert_eq!(handles[0].sent().len(), 1);
        assert!(handles[1].sent().is_empty());
        assert_eq!(stack.stats().dest_down, 1);
    }

    #[test]
    fn would_block_retries_without_loss() {
        let (mut stack, ingress, handles) = stack_with(
            2,
            StackConfig::default(),
            FilterTable::open(),
            vec![RoutingEntry::new(7, &[0])],
        );
        handles[0].defer_sends(1);

        ingress[1].receive(7, 0, &[0x42]).unwrap();

        stack.tick();
        assert_eq!(stack.egress_depth(0), 1);
        assert!(handles[0].sent().is_empty());

        stack.tick();
        assert_eq!(stack.egress_depth(0), 0);
        let sent = handles[0].sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, vec![0x42]);

        // nothing left to send again
        stack.tick();
        assert_eq!(handles[0].sent().len(), 1);
    }

    #[test]
    fn loop_score_bounds_work_per_tick() {
        let config = StackConfig {
            loop_score: 4,
            ..StackConfig::default()
        };
        let (mut stack, ingress, handles) = stack_with(
            2,
            config,
            FilterTable::open(),
            vec![RoutingEntry::new(7, &[1])],
        );

        for n in 0..5 {
            ingress[0].receive(7, 0, &[n]).unwrap();
        }

        stack.tick();
        assert_eq!(stack.ingress_depth(0), 1);
        assert_eq!(stack.egress_depth(1), 4);
        assert!(handles[1].sent().is_empty());

        // the backlog clears over the following ticks, in order
        stack.tick();
        stack.tick();
        let sent = handles[1].sent();
        assert_eq!(sent.len(), 5);
        for (n, record) in sent.iter().enumerate() {
            assert_eq!(record.data, vec![n as u8]);
        }
    }

    #[test]
    fn filtered_frames_never_reach_routing() {
        let (mut stack, ingress, handles) = stack_with(
            1,
            StackConfig::default(),
            FilterTable::accepting(&[1, 2]),
            vec![RoutingEntry::new(3, &[0])],
        );

        ingress[0].receive(3, 0, &[9]).unwrap();
        stack.tick();

        assert_eq!(stack.stats().filtered, 1);
        assert_eq!(stack.stats().unrouted, 0);
        assert!(handles[0].sent().is_empty());
    }

    #[test]
    fn source_interface_loopback_is_delivered() {
        let (mut stack, ingress, handles) = stack_with(
            1,
            StackConfig::default(),
            FilterTable::open(),
            vec![RoutingEntry::new(5, &[0])],
        );

        ingress[0].receive(5, 0, &[0x5a]).unwrap();
        stack.tick();

        let sent = handles[0].sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 5);
    }

    #[test]
    fn egress_cap_drops_are_counted() {
        let config = StackConfig {
            egress_capacity: 1,
            ..StackConfig::default()
        };
        let (mut stack, ingress, handles) = stack_with(
            2,
            config,
            FilterTable::open(),
            vec![RoutingEntry::new(9, &[0])],
        );
        handles[0].defer_sends(u32::max_value());

        ingress[1].receive(9, 0, &[1]).unwrap();
        ingress[1].receive(9, 0, &[2]).unwrap();
        stack.tick();

        assert_eq!(stack.egress_depth(0), 1);
        assert_eq!(stack.stats().egress_overrun, 1);
    }

    #[test]
    fn transmit_failure_drops_and_advances() {
        let (mut stack, ingress, handles) = stack_with(
            2,
            StackConfig::default(),
            FilterTable::open(),
            vec![RoutingEntry::new(3, &[0])],
        );
        handles[0].fail_sends(true);

        ingress[1].receive(3, 0, &[1]).unwrap();
        ingress[1].receive(3, 0, &[2]).unwrap();
        stack.tick();

        assert_eq!(stack.stats().tx_failed, 2);
        assert_eq!(stack.egress_depth(0), 0);
        assert!(handles[0].sent().is_empty());

        // the device recovers and later frames flow again
        handles[0].fail_sends(false);
        ingress[1].receive(3, 0, &[3]).unwrap();
        stack.tick();
        assert_eq!(handles[0].sent().len(), 1);
    }

    #[test]
    fn driver_poll_feeds_ingress() {
        let (mut stack, _ingress, handles) = stack_with(
            2,
            StackConfig::default(),
            FilterTable::open(),
            vec![RoutingEntry::new(6, &[1])],
        );

        handles[0].push_rx(6, 0, &[1, 2]);
        stack.tick();

        let sent = handles[1].sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, vec![1, 2]);
    }

    #[test]
    fn inject_routes_host_frames() {
        let (mut stack, _ingress, handles) = stack_with(
            2,
            StackConfig::default(),
            // host frames bypass the ingress filter
            FilterTable::accepting(&[]),
            vec![RoutingEntry::new(0x30, &[0, 1])],
        );

        stack.inject(0x30, 0, &[9]).unwrap();
        assert_eq!(stack.egress_depth(0), 1);
        assert_eq!(stack.egress_depth(1), 1);

        stack.tick();
        assert_eq!(handles[0].sent().len(), 1);
        assert_eq!(handles[1].sent().len(), 1);

        stack.inject(0x99, 0, &[]).unwrap();
        assert_eq!(stack.stats().unrouted, 1);
    }

    #[test]
    fn ingress_handle_works_across_threads() {
        let (mut stack, ingress, handles) = stack_with(
            2,
            StackConfig::default(),
            FilterTable::open(),
            vec![RoutingEntry::new(1, &[1])],
        );

        let producer = ingress[0].clone();
        let worker = std::thread::spawn(move || {
            for n in 0..50u8 {
                producer.receive(1, 0, &[n]).unwrap();
            }
        });

        for _ in 0..20 {
            stack.tick();
        }
        worker.join().unwrap();
        for _ in 0..20 {
            stack.tick();
        }

        let sent = handles[1].sent();
        assert_eq!(sent.len(), 50);
        assert_eq!(stack.ingress_overruns(0), 0);
    }

    #[test]
    fn attach_validates_id_and_slot() {
        let mut stack = Stack::new(
            StackConfig::default(),
            FilterTable::open(),
            RoutingTable::empty(),
        );

        let (dev, _) = SoftDevice::new();
        assert!(stack.attach(MAX_DEVICES as DeviceId, "far", Box::new(dev)).is_err());

        let (dev, _) = SoftDevice::new();
        stack.attach(0, "first", Box::new(dev)).unwrap();
        let (dev, _) = SoftDevice::new();
        assert!(stack.attach(0, "second", Box::new(dev)).is_err());
    }

    #[test]
    fn detach_unregisters_the_device() {
        let mut stack = Stack::new(
            StackConfig::default(),
            FilterTable::open(),
            RoutingTable::empty(),
        );

        let (dev, _) = SoftDevice::new();
        stack.attach(1, "soft1", Box::new(dev)).unwrap();
        assert!(stack.is_attached(1));

        stack.detach(1).unwrap();
        assert!(!stack.is_attached(1));
        assert!(stack.detach(1).is_err());
    }
}
