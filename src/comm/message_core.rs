use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::comm::byte_counter::ByteCounter;
use crate::comm::config::CommConfig;
use crate::comm::dispatcher::Dispatcher;
use crate::comm::message::Message;
use crate::comm::message_filter::{FilterError, MatchOutcome, MessageFilter};
use crate::comm::peer::PeerHandle;
use crate::comm::transport::{udp_overhead, Transport};

/// Blocking waiters sleep slightly past their deadline so the periodic sweep, which
///  runs on whole-interval boundaries, gets first shot at an expiring filter. A waiter
///  that wakes up by itself still re-checks for a match under the engine lock, so the
///  bias can only delay the "no message" answer, never lose a message.
const WAIT_DEADLINE_GRACE: Duration = Duration::from_millis(2);

const SWEEP_DURATION_WARN: Duration = Duration::from_millis(50);
const SWEEP_DURATION_ERROR: Duration = Duration::from_secs(3);

struct EngineState {
    /// sorted by ascending deadline, so the earliest-expiring filter wins when several
    ///  could match the same message
    waiting: Vec<Arc<MessageFilter>>,
    /// arrival-ordered FIFO of messages nobody claimed, bounded by count and age
    unclaimed: VecDeque<Message>,
}

/// The matching engine: connects each incoming message to exactly one consumer.
///
/// Consumers are waiting filters (blocking [MessageCore::wait_for] or callback-carrying
///  [MessageCore::add_async_filter]), the fallback [Dispatcher], or the bounded unclaimed FIFO, in
///  that order of preference. All shared state lives under one mutex that is never held
///  across an await point and never held while caller-supplied code runs.
pub struct MessageCore {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    state: Mutex<EngineState>,
    unclaimed_fifo_capacity: usize,
    unclaimed_max_age: Duration,
    sweep_interval: Duration,
}

impl MessageCore {
    pub fn new(
        config: &CommConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Arc<MessageCore> {
        Arc::new(MessageCore {
            transport,
            dispatcher,
            state: Mutex::new(EngineState {
                waiting: Vec::new(),
                unclaimed: VecDeque::new(),
            }),
            unclaimed_fifo_capacity: config.unclaimed_fifo_capacity,
            unclaimed_max_age: config.unclaimed_max_age,
            sweep_interval: config.sweep_interval,
        })
    }

    /// Route one decoded message to its consumer. This is the receive hot path, called
    ///  by the decoder for every message that arrives over the network.
    ///
    /// Exactly one of three things happens: a waiting filter claims the message, the
    ///  dispatcher handles it, or it lands in the unclaimed FIFO. The second waiting-list
    ///  pass after a declined dispatch is load-bearing: the dispatcher runs without the
    ///  engine lock, so a filter registered concurrently with it must still get the
    ///  message instead of watching it disappear into the FIFO.
    pub fn check_filters(&self, m: Message) {
        trace!("routing {:?}", m);
        let now = Instant::now();

        let m = {
            let mut state = self.lock();
            match Self::claim_waiting(&mut state, m, now) {
                Ok(filter) => {
                    drop(state);
                    filter.notify_matched();
                    return;
                }
                Err(m) => m,
            }
        };

        if self.dispatcher.handle_message(&m) {
            return;
        }

        let claimed = {
            let mut state = self.lock();
            match Self::claim_waiting(&mut state, m, Instant::now()) {
                Ok(filter) => Some(filter),
                Err(m) => {
                    self.append_unclaimed(&mut state, m, now);
                    None
                }
            }
        };
        if let Some(filter) = claimed {
            filter.notify_matched();
        }
    }

    /// Scan the waiting list for the first filter claiming the message. On a claim the
    ///  filter is removed from the list and the message is captured into it before the
    ///  engine lock is released, so a concurrently timing-out waiter cannot miss it.
    fn claim_waiting(
        state: &mut EngineState,
        m: Message,
        now: Instant,
    ) -> Result<Arc<MessageFilter>, Message> {
        let mut i = 0;
        let mut claimed = None;
        while i < state.waiting.len() {
            let filter = &state.waiting[i];
            match filter.match_message(&m, now) {
                MatchOutcome::Matched | MatchOutcome::TimedOutAndMatched => {
                    if filter.matched() {
                        // a matched filter must leave the list before its notification
                        //  fires, so finding one here is an internal consistency bug
                        error!("waiting filter {:?} already holds a match, removing it", filter);
                        state.waiting.remove(i);
                        continue;
                    }
                    claimed = Some(state.waiting.remove(i));
                    break;
                }
                MatchOutcome::TimedOut | MatchOutcome::None => i += 1,
            }
        }
        match claimed {
            Some(filter) => {
                filter.set_message(m);
                Ok(filter)
            }
            None => Err(m),
        }
    }

    fn append_unclaimed(&self, state: &mut EngineState, m: Message, now: Instant) {
        state.unclaimed.push_back(m);
        while state.unclaimed.len() > self.unclaimed_fifo_capacity {
            if let Some(dropped) = state.unclaimed.pop_front() {
                debug!(
                    "unclaimed FIFO full, dropping {:?} after {:?}",
                    dropped, dropped.age(now)
                );
            }
        }
    }

    /// Wait until a message matching the filter arrives, the filter's deadline passes
    ///  (`Ok(None)`), or a peer the filter is bound to disconnects or restarts
    ///  (`Err(Disconnected)`).
    ///
    /// The unclaimed FIFO is consulted first, so a response that arrived before the
    ///  caller got around to waiting is not lost. A delivered message's wire size is
    ///  charged to `counter`. Filters carrying a callback must use
    ///  [MessageCore::add_async_filter] instead.
    pub async fn wait_for(
        &self,
        filter: &Arc<MessageFilter>,
        counter: &dyn ByteCounter,
    ) -> Result<Option<Message>, FilterError> {
        if filter.has_callback() {
            return Err(FilterError::IllegalUse(
                "wait_for on a filter carrying a callback, use add_async_filter",
            ));
        }
        filter.begin_use()?;
        let result = self.do_wait_for(filter).await;
        filter.end_use();
        if let Ok(Some(m)) = &result {
            counter.received_bytes(m.received_byte_count());
        }
        result
    }

    async fn do_wait_for(
        &self,
        filter: &Arc<MessageFilter>,
    ) -> Result<Option<Message>, FilterError> {
        let now = Instant::now();
        filter.on_start_waiting(now);

        {
            let mut state = self.lock();
            if let Some(m) = self.claim_unclaimed(&mut state, filter, now) {
                return Ok(Some(m));
            }
            Self::insert_by_deadline(&mut state.waiting, filter.clone());
        }

        let wake_at = filter.deadline() + WAIT_DEADLINE_GRACE;

        loop {
            if let Some(peer) = filter.any_connections_dropped() {
                self.remove_waiting(filter);
                debug!("{:?} dropped while {:?} was waiting", peer, filter);
                return Err(FilterError::Disconnected);
            }

            let slept_out = tokio::time::timeout_at(wake_at, filter.wait_notified())
                .await
                .is_err();

            let mut state = self.lock();
            if filter.matched() {
                // already off the waiting list, the message was captured under the
                //  engine lock before we were woken
                drop(state);
                return Ok(filter.take_message());
            }
            if filter.dropped_peer().is_some() {
                Self::remove_from(&mut state.waiting, filter);
                drop(state);
                return Err(FilterError::Disconnected);
            }
            if slept_out || Instant::now() >= filter.deadline() {
                Self::remove_from(&mut state.waiting, filter);
                return Ok(None);
            }
            // spurious wakeup, e.g. a leftover permit from an earlier use
        }
    }

    /// Register a callback-carrying filter without blocking. The callback fires later
    ///  from [MessageCore::check_filters], the periodic sweep, or
    ///  [MessageCore::on_disconnect] / [MessageCore::on_restart];
    ///  if the unclaimed FIFO already holds a match, or the deadline has already
    ///  passed, it fires before this returns, and a delivered message's wire size is
    ///  charged to `counter`. A filter bound to a peer that is already disconnected or
    ///  restarted is refused outright: the condition is known now, so it must not sit
    ///  registered until its deadline.
    pub fn add_async_filter(
        &self,
        filter: &Arc<MessageFilter>,
        counter: &dyn ByteCounter,
    ) -> Result<(), FilterError> {
        if !filter.has_callback() {
            return Err(FilterError::IllegalUse(
                "add_async_filter on a filter without a callback, use wait_for",
            ));
        }
        filter.begin_use()?;

        let now = Instant::now();
        filter.on_start_waiting(now);

        let delivered_bytes = {
            let mut state = self.lock();
            if let Some(peer) = filter.any_connections_dropped() {
                drop(state);
                debug!("refusing async filter {:?}, {:?} is already dropped", filter, peer);
                filter.end_use();
                return Err(FilterError::Disconnected);
            }
            match self.claim_unclaimed(&mut state, filter, now) {
                Some(m) => {
                    let n = m.received_byte_count();
                    filter.set_message(m);
                    Some(n)
                }
                None => {
                    if now < filter.deadline() {
                        Self::insert_by_deadline(&mut state.waiting, filter.clone());
                    }
                    None
                }
            }
        };

        if let Some(n) = delivered_bytes {
            counter.received_bytes(n);
            filter.notify_matched();
        } else if now >= filter.deadline() {
            debug!("async filter {:?} was submitted already expired", filter);
            filter.notify_timeout();
        }
        Ok(())
    }

    /// Take the first unclaimed message the filter matches, dropping overaged entries
    ///  encountered along the way.
    fn claim_unclaimed(
        &self,
        state: &mut EngineState,
        filter: &MessageFilter,
        now: Instant,
    ) -> Option<Message> {
        let mut i = 0;
        while i < state.unclaimed.len() {
            let age = state.unclaimed[i].age(now);
            if age > self.unclaimed_max_age {
                if let Some(dropped) = state.unclaimed.remove(i) {
                    debug!("dropping unclaimed {:?} after {:?}", dropped, age);
                }
                continue;
            }
            match filter.match_message(&state.unclaimed[i], now) {
                MatchOutcome::Matched | MatchOutcome::TimedOutAndMatched => {
                    return state.unclaimed.remove(i);
                }
                MatchOutcome::TimedOut | MatchOutcome::None => i += 1,
            }
        }
        None
    }

    fn insert_by_deadline(waiting: &mut Vec<Arc<MessageFilter>>, filter: Arc<MessageFilter>) {
        let deadline = filter.deadline();
        let idx = waiting.partition_point(|f| f.deadline() <= deadline);
        waiting.insert(idx, filter);
    }

    fn remove_from(waiting: &mut Vec<Arc<MessageFilter>>, filter: &Arc<MessageFilter>) {
        if let Some(idx) = waiting.iter().position(|f| Arc::ptr_eq(f, filter)) {
            waiting.remove(idx);
        }
    }

    fn remove_waiting(&self, filter: &Arc<MessageFilter>) {
        Self::remove_from(&mut self.lock().waiting, filter);
    }

    pub fn on_disconnect(&self, peer: &PeerHandle) {
        for filter in self.extract_bound_to(peer) {
            filter.notify_disconnect(peer);
        }
    }

    pub fn on_restart(&self, peer: &PeerHandle) {
        for filter in self.extract_bound_to(peer) {
            filter.notify_restarted(peer);
        }
    }

    /// atomically remove every waiting filter with a clause bound to the peer
    fn extract_bound_to(&self, peer: &PeerHandle) -> Vec<Arc<MessageFilter>> {
        let mut affected = Vec::new();
        let mut state = self.lock();
        state.waiting.retain(|filter| {
            if filter.bound_to(peer) {
                affected.push(filter.clone());
                false
            } else {
                true
            }
        });
        drop(state);
        if !affected.is_empty() {
            debug!("removed {} waiting filters bound to {:?}", affected.len(), peer);
        }
        affected
    }

    /// Run the periodic sweep until the task is aborted.
    pub fn spawn_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(core.sweep_interval).await;
                core.sweep_once();
            }
        })
    }

    /// One sweep pass: expire every waiting filter whose deadline has passed or whose
    ///  callback votes for expiry, and age out the unclaimed FIFO.
    ///
    /// `should_timeout` is polled on a snapshot, without the engine lock held, since
    ///  it is caller-supplied code. The pass is self-timed; an overlong pass points at
    ///  contention or a stuck callback somewhere else and is logged accordingly.
    pub fn sweep_once(&self) {
        let sweep_start = Instant::now();

        let snapshot: Vec<Arc<MessageFilter>> = self.lock().waiting.clone();
        let force_expired: Vec<Arc<MessageFilter>> = snapshot
            .iter()
            .filter(|f| f.callback_should_timeout())
            .cloned()
            .collect();

        let now = Instant::now();
        let expired: Vec<Arc<MessageFilter>> = {
            let mut state = self.lock();
            let mut expired = Vec::new();
            state.waiting.retain(|filter| {
                let expire = now >= filter.deadline()
                    || force_expired.iter().any(|f| Arc::ptr_eq(f, filter));
                if expire {
                    expired.push(filter.clone());
                }
                !expire
            });

            while let Some(front) = state.unclaimed.front() {
                let age = front.age(now);
                if age <= self.unclaimed_max_age {
                    break;
                }
                if let Some(dropped) = state.unclaimed.pop_front() {
                    debug!("dropping unclaimed {:?} after {:?}", dropped, age);
                }
            }
            expired
        };

        for filter in &expired {
            trace!("filter {:?} timed out", filter);
            filter.notify_timeout();
        }

        let duration = sweep_start.elapsed();
        if duration > SWEEP_DURATION_ERROR {
            error!("filter sweep took {:?}", duration);
        } else if duration > SWEEP_DURATION_WARN {
            warn!("filter sweep took {:?}", duration);
        }
    }

    /// Encode and hand a message to the transport, accounting payload and estimated
    ///  wire bytes on success. Internal-only messages must never reach the network.
    pub async fn send(
        &self,
        peer: &PeerHandle,
        message: &Message,
        counter: &dyn ByteCounter,
    ) -> anyhow::Result<()> {
        if message.schema().is_internal_only() {
            bail!(
                "refusing to send internal-only message {:?} to {:?}",
                message.schema().name(),
                peer
            );
        }

        let mut buf = BytesMut::new();
        message.encode(&mut buf)?;
        if buf.len() > self.transport.max_payload_size() {
            bail!(
                "message {:?} encodes to {} bytes, above the transport limit of {}",
                message.schema().name(),
                buf.len(),
                self.transport.max_payload_size()
            );
        }

        self.transport.send(peer.addr(), &buf).await?;
        counter.sent_bytes(buf.len() + udp_overhead(&peer.addr()));
        counter.sent_payload(buf.len());
        trace!("sent {:?} to {:?}", message, peer);
        Ok(())
    }

    pub fn unclaimed_fifo_size(&self) -> usize {
        self.lock().unclaimed.len()
    }

    /// per-schema-name sizes of the unclaimed FIFO, for diagnostics
    pub fn unclaimed_message_counts(&self) -> FxHashMap<String, usize> {
        let state = self.lock();
        let mut counts = FxHashMap::default();
        for m in &state.unclaimed {
            *counts.entry(m.schema().name().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[cfg(test)]
    fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
