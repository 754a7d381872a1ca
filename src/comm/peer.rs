use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Transport-level address of a peer. This is what the datagram socket needs to send to,
///  as opposed to [PeerHandle] which identifies one connection lifetime of a peer.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddr {
    pub socket_addr: SocketAddr,
}
impl PeerAddr {
    /// A destination that cannot actually be routed to - the transport refuses to send
    ///  rather than handing such an address to the socket.
    pub fn is_routable(&self) -> bool {
        !self.socket_addr.ip().is_unspecified() && self.socket_addr.port() != 0
    }
}
impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr)
    }
}
impl From<SocketAddr> for PeerAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        PeerAddr { socket_addr }
    }
}

struct PeerShared {
    addr: PeerAddr,
    /// the 'boot id': a nonce issued when the connection to this peer was established. A
    ///  peer that silently restarts comes back with a different boot id, which is how
    ///  waiting message filters learn that their responses will never arrive.
    boot_id: AtomicU64,
    connected: AtomicBool,
}

/// Shared identity of one connection lifetime of a peer.
///
/// Handles are compared *by identity* rather than by network address: two connections
///  from the same address at different times are different peers as far as message
///  correlation is concerned. Cloning is cheap, and all clones observe connection state
///  transitions ([PeerHandle::set_connected], [PeerHandle::restart]) immediately.
#[derive(Clone)]
pub struct PeerHandle(Arc<PeerShared>);

impl PeerHandle {
    pub fn new(addr: PeerAddr, boot_id: u64) -> PeerHandle {
        PeerHandle(Arc::new(PeerShared {
            addr,
            boot_id: AtomicU64::new(boot_id),
            connected: AtomicBool::new(true),
        }))
    }

    pub fn addr(&self) -> PeerAddr {
        self.0.addr
    }

    pub fn boot_id(&self) -> u64 {
        self.0.boot_id.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.connected.store(connected, Ordering::Release);
    }

    /// the peer re-established its connection with a fresh boot id
    pub fn restart(&self, new_boot_id: u64) {
        self.0.boot_id.store(new_boot_id, Ordering::Release);
        self.0.connected.store(true, Ordering::Release);
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PeerHandle {}
impl Hash for PeerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}
impl Debug for PeerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}]", self.0.addr, self.boot_id())
    }
}
