use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug)]
pub struct CommConfig {
    pub bind_addr: SocketAddr,

    /// if > 0, one in this many outgoing packets is dropped before it reaches the
    ///  socket - debug aid for exercising loss handling, off by default
    pub drop_probability: u32,
    /// network-detected MTU; the hard ceiling in the transport applies on top of this
    pub mtu: usize,

    pub unclaimed_fifo_capacity: usize,
    /// unclaimed messages older than this are dropped rather than matched
    pub unclaimed_max_age: Duration,
    pub sweep_interval: Duration,

    /// the receive loop polls with this timeout so the liveness stamp advances even
    ///  with no traffic
    pub receive_poll_timeout: Duration,
    /// upper bound on how long `close()` waits for the receive loop to acknowledge
    pub close_timeout: Duration,

    pub watchdog_poll_interval: Duration,
    pub watchdog_hang_threshold: Duration,
}

impl CommConfig {
    pub fn new(bind_addr: SocketAddr) -> CommConfig {
        CommConfig {
            bind_addr,
            drop_probability: 0,
            mtu: 1280,
            unclaimed_fifo_capacity: 50_000,
            unclaimed_max_age: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(1),
            receive_poll_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_secs(2),
            watchdog_poll_interval: Duration::from_secs(10),
            watchdog_hang_threshold: Duration::from_secs(180),
        }
    }
}
