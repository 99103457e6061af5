//! CAN/CAN-FD gateway core.
//!
//! A vehicle gateway ECU sits between several CAN buses and decides which
//! frames cross from one bus to another. This crate is the data plane of
//! such a gateway: it receives frames from any number of bus interfaces,
//! filters them, looks each accepted frame up in a static routing table
//! and transmits copies on the destination interfaces.
//!
//! # An introduction to CAN
//!
//! The CAN bus was originally designed to allow microcontrollers inside a
//! vehicle to communicate over a single shared bus. Messages called
//! *frames* are multicast to all devices on the bus, identified not by a
//! destination address but by an arbitration ID that doubles as the
//! frame's priority. Classical frames carry up to 8 data bytes; CAN-FD
//! frames carry up to 64 and may switch to a higher bit rate for the data
//! phase.
//!
//! A modern vehicle has many such buses, and not every node needs to see
//! every frame. The gateway bridges them selectively: a routing table
//! says which frame IDs are forwarded where, and a filter table says
//! which IDs are worth looking at in the first place.
//!
//! # Architecture
//!
//! The core is a single-threaded cooperative pipeline driven by
//! [`Stack::tick`]. Bus drivers implement the [`CANDevice`] trait and are
//! registered in the [`Stack`]'s device pool; each registered device owns
//! an ingress and an egress queue. One tick drains ingress queues through
//! filter and router into the egress queues, then pushes egress queues
//! out to the devices, all bounded by a loop-score budget so that a busy
//! bus cannot starve the host application.
//!
//! ```text
//! poll() -> Ingress::receive -> q_in -> filter -> router -> q_out -> send()
//! ```
//!
//! Drivers may deliver frames from their own I/O or interrupt context:
//! the [`Ingress`] handle returned by [`Stack::attach`] is cloneable and
//! safe to use concurrently with the tick loop.
//!
//! Two adapters ship with the crate: [`SocketCANDevice`] binds a raw
//! Linux SocketCAN socket (CAN-FD capable, non-blocking), and
//! [`SoftDevice`] is a scriptable in-memory device for tests and host
//! simulation.

pub mod device;
pub mod filter;
pub mod frame;
pub mod queue;
pub mod router;
pub mod soft;
pub mod socketcan;
pub mod stack;

pub use device::{CANDevice, DeviceId, Ingress, RecvError, SendStatus, MAX_DEVICES};
pub use filter::FilterTable;
pub use frame::{Frame, FrameError};
pub use queue::{FrameQueue, QueueError};
pub use router::{RouteError, RoutingEntry, RoutingTable};
pub use soft::{SoftDevice, SoftFrame, SoftHandle};
pub use socketcan::{OpenError, SocketCANDevice};
pub use stack::{Stack, StackConfig, StackError, Stats};

use colored::Color;
use fern::colors::ColoredLevelConfig;

/// Install a stderr logger for host binaries.
///
/// Levels are colorized, timestamps are millisecond local time. Calling
/// it more than once is harmless; later calls are ignored.
pub fn init_logging() {
    let colors = ColoredLevelConfig::default()
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::Magenta);

    let _ = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .chain(std::io::stderr())
        .apply();
}
