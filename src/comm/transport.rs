use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::comm::byte_counter::ByteCounter;
use crate::comm::config::CommConfig;
use crate::comm::peer::{PeerAddr, PeerHandle};

#[cfg(test)] use mockall::automock;

/// estimated IP + UDP header bytes per datagram, used for wire-level byte accounting
pub const UDP_OVERHEAD_V4: usize = 28;
pub const UDP_OVERHEAD_V6: usize = 48;

/// Datagrams above this size risk fragmentation on paths we do not control, whatever
///  the local interface claims its MTU is.
const HARD_MTU_CEILING: usize = 1280;

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

pub fn udp_overhead(addr: &PeerAddr) -> usize {
    if addr.socket_addr.is_ipv4() {
        UDP_OVERHEAD_V4
    } else {
        UDP_OVERHEAD_V6
    }
}

/// Turns raw datagram bytes into typed messages and feeds them to the matching engine.
///  This is the seam between the socket and everything above it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Decoder: Send + Sync + 'static {
    async fn process(&self, buf: &[u8], sender: PeerAddr);

    /// lets the transport layer ask whether a peer is still worth delivering for
    fn is_disconnected(&self, peer: &PeerHandle) -> bool;
}

/// The datagram socket handler as the engine sees it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, dest: PeerAddr, payload: &[u8]) -> anyhow::Result<()>;

    /// Run the receive loop until [Transport::close] is called. Meant to be spawned as
    ///  its own task right after binding.
    async fn recv_loop(&self, decoder: Arc<dyn Decoder>);

    /// Signal the receive loop to stop and wait, bounded, for its acknowledgement.
    async fn close(&self);

    fn max_payload_size(&self) -> usize;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum TransportState {
    Created,
    Running,
    Closing,
    Closed,
}

/// Datagram transport over one UDP socket.
///
/// The socket is read exclusively by [UdpTransport::recv_loop]; sends may come from
///  any task concurrently. The receive loop polls with a short timeout so
///  [UdpTransport::last_progress] advances even on an idle network, which is what the
///  [Watchdog] keys off.
pub struct UdpTransport {
    socket: UdpSocket,
    mtu: usize,
    drop_probability: u32,
    receive_poll_timeout: Duration,
    close_timeout: Duration,
    state: AtomicU8,
    last_progress: Mutex<Instant>,
    closed_ack: Notify,
    counter: Arc<dyn ByteCounter>,
}

impl UdpTransport {
    pub async fn bind(
        config: &CommConfig,
        counter: Arc<dyn ByteCounter>,
    ) -> anyhow::Result<Arc<UdpTransport>> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("listening for datagrams on {}", socket.local_addr()?);

        Ok(Arc::new(UdpTransport {
            socket,
            mtu: config.mtu,
            drop_probability: config.drop_probability,
            receive_poll_timeout: config.receive_poll_timeout,
            close_timeout: config.close_timeout,
            state: AtomicU8::new(TransportState::Created.into()),
            last_progress: Mutex::new(Instant::now()),
            closed_ack: Notify::new(),
            counter,
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Last time the receive loop completed an iteration. `None` once the transport is
    ///  closed, which tells the watchdog to stand down.
    pub fn last_progress(&self) -> Option<Instant> {
        if self.state() == TransportState::Closed {
            None
        } else {
            Some(*self.lock_progress())
        }
    }

    fn stamp_progress(&self) {
        *self.lock_progress() = Instant::now();
    }

    fn lock_progress(&self) -> MutexGuard<'_, Instant> {
        self.last_progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> TransportState {
        TransportState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(TransportState::Closed)
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state.into(), Ordering::Release);
    }

    fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, dest: PeerAddr, payload: &[u8]) -> anyhow::Result<()> {
        if !dest.is_routable() {
            bail!("refusing to send {} bytes to unroutable address {:?}", payload.len(), dest);
        }
        if payload.len() > self.max_payload_size() {
            bail!(
                "payload of {} bytes exceeds the limit of {} for {:?}",
                payload.len(),
                self.max_payload_size(),
                dest
            );
        }

        if self.drop_probability > 0
            && rand::thread_rng().gen_range(0..self.drop_probability) == 0
        {
            debug!("simulating packet loss: {} bytes to {:?}", payload.len(), dest);
            return Ok(());
        }

        let sent = self.socket.send_to(payload, dest.socket_addr).await?;
        if sent != payload.len() {
            warn!("short send to {:?}: {} of {} bytes", dest, sent, payload.len());
        }
        trace!("sent {} bytes to {:?}", sent, dest);
        Ok(())
    }

    async fn recv_loop(&self, decoder: Arc<dyn Decoder>) {
        if !self.transition(TransportState::Created, TransportState::Running) {
            warn!("receive loop started on a transport in state {:?}", self.state());
            return;
        }
        debug!("receive loop starting");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while self.state() == TransportState::Running {
            self.stamp_progress();

            match tokio::time::timeout(self.receive_poll_timeout, self.socket.recv_from(&mut buf))
                .await
            {
                // poll timeout: no traffic, loop for the liveness stamp
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("error receiving from the socket: {}", e);
                    tokio::time::sleep(self.receive_poll_timeout).await;
                }
                Ok(Ok((n, from))) => {
                    let sender = PeerAddr::from(from);
                    self.counter.received_bytes(n + udp_overhead(&sender));
                    trace!("received {} bytes from {:?}", n, sender);
                    decoder.process(&buf[..n], sender).await;
                }
            }
        }

        self.set_state(TransportState::Closed);
        self.closed_ack.notify_one();
        debug!("receive loop terminated");
    }

    async fn close(&self) {
        if self.transition(TransportState::Created, TransportState::Closed) {
            // the receive loop never started, nothing to wait for
            return;
        }
        if !self.transition(TransportState::Running, TransportState::Closing) {
            return;
        }

        if tokio::time::timeout(self.close_timeout, self.closed_ack.notified())
            .await
            .is_err()
        {
            warn!(
                "receive loop did not acknowledge shutdown within {:?}",
                self.close_timeout
            );
            self.set_state(TransportState::Closed);
        }
    }

    fn max_payload_size(&self) -> usize {
        self.mtu.min(HARD_MTU_CEILING) - UDP_OVERHEAD_V6
    }
}

/// Defends against the receive loop silently stalling: polls a progress stamp at a
///  fixed interval and fires the supplied recovery action exactly once if the stamp
///  stops moving for longer than the hang threshold.
///
/// The recovery action is expected to be drastic, typically a process restart, which
///  is why firing is a hard error in the log.
pub struct Watchdog;

impl Watchdog {
    pub fn spawn(
        poll_interval: Duration,
        hang_threshold: Duration,
        progress: impl Fn() -> Option<Instant> + Send + 'static,
        recovery: impl FnOnce() + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;

                let Some(stamp) = progress() else {
                    debug!("transport closed, watchdog standing down");
                    return;
                };
                let stall = stamp.elapsed();
                if stall > hang_threshold {
                    error!(
                        "receive loop made no progress for {:?}, triggering recovery",
                        stall
                    );
                    recovery();
                    return;
                }
            }
        })
    }
}
