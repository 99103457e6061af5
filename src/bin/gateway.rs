//! Host gateway runner.
//!
//! Binds the SocketCAN interfaces named on the command line (default
//! `vcan0 vcan1`), wires them into a gateway stack with a compiled-in
//! routing table, and ticks the stack whenever traffic arrives or the
//! retry timeout expires.

use std::env;
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::info;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use can_gateway::{
    init_logging, DeviceId, FilterTable, RoutingEntry, RoutingTable, SocketCANDevice, Stack,
    StackConfig,
};

/// IDs the gateway forwards, and where to.
fn routing_table() -> Result<RoutingTable, can_gateway::RouteError> {
    RoutingTable::new(vec![
        RoutingEntry::new(0, &[1, 2]),
        RoutingEntry::new(1, &[0, 1]),
        RoutingEntry::new(2, &[0, 2]),
    ])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut names: Vec<String> = env::args().skip(1).collect();
    if names.is_empty() {
        names = vec!["vcan0".to_string(), "vcan1".to_string()];
    }

    let filter = FilterTable::accepting(&[0, 1, 2]);
    let mut stack = Stack::new(StackConfig::default(), filter.clone(), routing_table()?);

    let mut poll = Poll::new()?;
    for (i, name) in names.iter().enumerate() {
        let dev = SocketCANDevice::new(name)?;
        // keep uninteresting traffic out of user space entirely
        if let Some(ids) = filter.ids() {
            dev.set_filters(ids)?;
        }

        let fd = dev.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), Token(i), Interest::READABLE)?;
        stack.attach(i as DeviceId, name, Box::new(dev))?;
    }
    info!("gateway running on {}", names.join(", "));

    let mut events = Events::with_capacity(16);
    loop {
        // wake on bus traffic, or on the timeout to flush retries
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(10))) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        stack.tick();
    }
}
