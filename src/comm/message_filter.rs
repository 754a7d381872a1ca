use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::comm::message::Message;
use crate::comm::peer::PeerHandle;
use crate::comm::schema::{FieldValue, MessageSchema};

/// Outcome of testing one message against one filter (or filter chain).
///
/// `TimedOutAndMatched` is deliberately its own variant rather than a pair of flags:
///  the message must still be delivered exactly once, but the filter is spent and must
///  not be waited on again.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MatchOutcome {
    Matched,
    TimedOut,
    TimedOutAndMatched,
    None,
}

#[derive(Debug, Error)]
pub enum FilterError {
    /// the peer a blocking wait was bound to disconnected or restarted its connection
    #[error("peer disconnected while waiting")]
    Disconnected,
    /// programmer error at the call site, surfaced immediately
    #[error("illegal filter use: {0}")]
    IllegalUse(&'static str),
}

/// Notification interface for filters registered asynchronously. Exactly one of
///  `on_matched` / `on_timeout` / `on_disconnect` / `on_restarted` fires per filter
///  lifetime, always without the engine lock held.
pub trait FilterCallback: Send + Sync + 'static {
    fn on_matched(&self, message: Message);

    fn on_timeout(&self);

    fn on_disconnect(&self, peer: &PeerHandle);

    fn on_restarted(&self, peer: &PeerHandle);

    /// Polled by the periodic sweep to allow expiry conditions that are not driven by
    ///  message arrival (e.g. an enclosing request being cancelled). Must not block:
    ///  it is called once per sweep for every registered filter.
    fn should_timeout(&self) -> bool {
        false
    }
}

/// One alternative of a filter: a conjunction of schema / source / field-equality
///  constraints plus a deadline. A filter is an ordered list of these, evaluated
///  short-circuit (see [MessageFilter::match_message]).
struct FilterClause {
    schema: Option<Arc<MessageSchema>>,
    source: Option<PeerHandle>,
    /// boot id of the bound source at filter construction; a change means the peer
    ///  restarted underneath us
    source_boot_id: u64,
    field_eq: Vec<(String, FieldValue)>,
    timeout: Option<Duration>,
    relative_to_creation: bool,
    deadline: Instant,
}

impl FilterClause {
    fn match_message(&self, m: &Message, now: Instant) -> MatchOutcome {
        let timed_out = now >= self.deadline;

        if let Some(schema) = &self.schema {
            if !Arc::ptr_eq(schema, m.schema()) {
                return if timed_out { MatchOutcome::TimedOut } else { MatchOutcome::None };
            }
        }
        if let Some(source) = &self.source {
            if m.source() != Some(source) {
                return if timed_out { MatchOutcome::TimedOut } else { MatchOutcome::None };
            }
        }
        for (name, want) in &self.field_eq {
            if m.get(name) != Some(want) {
                return if timed_out { MatchOutcome::TimedOut } else { MatchOutcome::None };
            }
        }

        if timed_out {
            MatchOutcome::TimedOutAndMatched
        } else {
            MatchOutcome::Matched
        }
    }

    fn on_start_waiting(&mut self, now: Instant) {
        if !self.relative_to_creation {
            if let Some(timeout) = self.timeout {
                self.deadline = now + timeout;
            }
        }
    }

    fn dropped_source(&self) -> Option<PeerHandle> {
        let source = self.source.as_ref()?;
        if !source.is_connected() || source.boot_id() != self.source_boot_id {
            Some(source.clone())
        } else {
            None
        }
    }
}

struct FilterState {
    matched: bool,
    message: Option<Message>,
    dropped: Option<PeerHandle>,
    /// guards against a filter being submitted twice concurrently
    registered: bool,
    /// ensures the async callback is notified at most once per lifetime
    notified: bool,
}

/// A caller-supplied predicate plus deadline used to claim one matching message.
///
/// Built once, submitted to the engine exactly once per use - either to a blocking
///  `wait_for` or, when carrying a callback, via `add_async_filter` - and removed from
///  the engine on match, timeout or disconnect. After removal the owner may
///  [MessageFilter::reset] and resubmit it.
pub struct MessageFilter {
    clauses: Mutex<Vec<FilterClause>>,
    state: Mutex<FilterState>,
    wakeup: Notify,
    callback: Option<Arc<dyn FilterCallback>>,
    slow_callback: bool,
}

impl MessageFilter {
    pub fn builder() -> MessageFilterBuilder {
        MessageFilterBuilder::new()
    }

    /// Test a message against all clauses of this filter.
    ///
    /// Clauses are evaluated most-recently-`or`ed first, and the first clause with a
    ///  non-`None` outcome decides for the whole chain - a chain is matched (or timed
    ///  out) at most once no matter how many alternatives it has.
    pub fn match_message(&self, m: &Message, now: Instant) -> MatchOutcome {
        for clause in self.lock_clauses().iter().rev() {
            let outcome = clause.match_message(m, now);
            if outcome != MatchOutcome::None {
                return outcome;
            }
        }
        MatchOutcome::None
    }

    /// earliest deadline across all clauses; the engine keeps its waiting list sorted
    ///  by this
    pub fn deadline(&self) -> Instant {
        self.lock_clauses().iter()
            .map(|c| c.deadline)
            .min()
            .unwrap_or_else(Instant::now)
    }

    /// Called when the owner actually starts waiting. Unless a clause fixed its
    ///  deadline at creation time, its absolute deadline is recomputed now - this is
    ///  what makes `timeout` mean "from the start of the wait" by default.
    pub(crate) fn on_start_waiting(&self, now: Instant) {
        for clause in self.lock_clauses().iter_mut() {
            clause.on_start_waiting(now);
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// is any bound source peer disconnected or restarted since the filter was built?
    pub(crate) fn any_connections_dropped(&self) -> Option<PeerHandle> {
        self.lock_clauses().iter().find_map(|c| c.dropped_source())
    }

    pub(crate) fn bound_to(&self, peer: &PeerHandle) -> bool {
        self.lock_clauses().iter().any(|c| c.source.as_ref() == Some(peer))
    }

    pub(crate) fn callback_should_timeout(&self) -> bool {
        match &self.callback {
            Some(cb) => cb.should_timeout(),
            None => false,
        }
    }

    pub fn matched(&self) -> bool {
        self.lock_state().matched
    }

    /// NB: must be called with the engine lock held, so a concurrently timing-out
    ///  waiter cannot miss the message
    pub(crate) fn set_message(&self, m: Message) {
        let mut state = self.lock_state();
        state.matched = true;
        state.message = Some(m);
    }

    pub(crate) fn take_message(&self) -> Option<Message> {
        self.lock_state().message.take()
    }

    pub(crate) fn dropped_peer(&self) -> Option<PeerHandle> {
        self.lock_state().dropped.clone()
    }

    /// Make the filter reusable after it has been removed from the engine. Calling this
    ///  while the filter is still submitted is an error.
    pub fn reset(&self) -> Result<(), FilterError> {
        let mut state = self.lock_state();
        if state.registered {
            return Err(FilterError::IllegalUse("reset() on a filter that is still registered"));
        }
        state.matched = false;
        state.message = None;
        state.dropped = None;
        state.notified = false;
        Ok(())
    }

    pub(crate) fn begin_use(&self) -> Result<(), FilterError> {
        let mut state = self.lock_state();
        if state.registered {
            return Err(FilterError::IllegalUse("filter is already submitted to the engine"));
        }
        state.registered = true;
        Ok(())
    }

    pub(crate) fn end_use(&self) {
        self.lock_state().registered = false;
    }

    pub(crate) async fn wait_notified(&self) {
        self.wakeup.notified().await;
    }

    /// Match notification: wake a blocking waiter, or hand the captured message to the
    ///  async callback. Never called with the engine lock held.
    pub(crate) fn notify_matched(&self) {
        let Some(cb) = &self.callback else {
            self.wakeup.notify_one();
            return;
        };
        let message = {
            let mut state = self.lock_state();
            if state.notified {
                return;
            }
            state.notified = true;
            state.registered = false;
            state.message.take()
        };
        if let Some(message) = message {
            let cb = cb.clone();
            self.dispatch(move || cb.on_matched(message));
        }
    }

    pub(crate) fn notify_timeout(&self) {
        let Some(cb) = &self.callback else {
            self.wakeup.notify_one();
            return;
        };
        {
            let mut state = self.lock_state();
            if state.notified {
                return;
            }
            state.notified = true;
            state.registered = false;
        }
        let cb = cb.clone();
        self.dispatch(move || cb.on_timeout());
    }

    pub(crate) fn notify_disconnect(&self, peer: &PeerHandle) {
        self.notify_connection_lost(peer, false);
    }

    pub(crate) fn notify_restarted(&self, peer: &PeerHandle) {
        self.notify_connection_lost(peer, true);
    }

    fn notify_connection_lost(&self, peer: &PeerHandle, restarted: bool) {
        {
            let mut state = self.lock_state();
            state.dropped = Some(peer.clone());
            if self.callback.is_some() {
                if state.notified {
                    return;
                }
                state.notified = true;
                state.registered = false;
            }
        }
        match &self.callback {
            None => self.wakeup.notify_one(),
            Some(cb) => {
                let cb = cb.clone();
                let peer = peer.clone();
                if restarted {
                    self.dispatch(move || cb.on_restarted(&peer));
                } else {
                    self.dispatch(move || cb.on_disconnect(&peer));
                }
            }
        }
    }

    /// Callbacks flagged slow run on the blocking worker pool so they cannot hold up
    ///  the notifying task (which is usually the receive path).
    fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        if self.slow_callback {
            trace!("dispatching slow filter callback to the worker pool");
            tokio::task::spawn_blocking(f);
        } else {
            f();
        }
    }

    fn lock_clauses(&self) -> MutexGuard<'_, Vec<FilterClause>> {
        self.clauses.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Debug for MessageFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let clauses = self.lock_clauses();
        write!(f, "MessageFilter[")?;
        let mut separator = "";
        for clause in clauses.iter().rev() {
            write!(f, "{}{{", separator)?;
            if let Some(schema) = &clause.schema {
                write!(f, "schema={}", schema.name())?;
            }
            if let Some(source) = &clause.source {
                write!(f, " source={:?}", source)?;
            }
            for (name, value) in &clause.field_eq {
                write!(f, " {}={:?}", name, value)?;
            }
            write!(f, "}}")?;
            separator = " | ";
        }
        write!(f, "]")
    }
}

pub struct MessageFilterBuilder {
    current: FilterClause,
    /// completed clauses collected through [MessageFilterBuilder::or]; kept in the
    ///  order they were added
    alternatives: Vec<FilterClause>,
    callback: Option<Arc<dyn FilterCallback>>,
    slow_callback: bool,
}

impl MessageFilterBuilder {
    fn new() -> MessageFilterBuilder {
        MessageFilterBuilder {
            current: Self::empty_clause(),
            alternatives: Vec::new(),
            callback: None,
            slow_callback: false,
        }
    }

    fn empty_clause() -> FilterClause {
        FilterClause {
            schema: None,
            source: None,
            source_boot_id: 0,
            field_eq: Vec::new(),
            timeout: None,
            relative_to_creation: false,
            deadline: Instant::now() + Duration::from_secs(30 * 365 * 24 * 60 * 60),
        }
    }

    pub fn schema(mut self, schema: &Arc<MessageSchema>) -> Self {
        self.current.schema = Some(schema.clone());
        self
    }

    pub fn source(mut self, peer: &PeerHandle) -> Self {
        self.current.source_boot_id = peer.boot_id();
        self.current.source = Some(peer.clone());
        self
    }

    pub fn field_eq(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.current.field_eq.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.current.timeout = Some(timeout);
        self.current.deadline = Instant::now() + timeout;
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.current.timeout = None;
        self.current.deadline = Instant::now() + Duration::from_secs(30 * 365 * 24 * 60 * 60);
        self
    }

    /// Fix the absolute deadline now instead of recomputing it when the owner starts
    ///  waiting. Useful when the filter is built early but submitted late and the
    ///  overall budget must not grow.
    pub fn timeout_relative_to_creation(mut self) -> Self {
        self.current.relative_to_creation = true;
        self
    }

    /// Add an alternative: the resulting filter matches if either side matches, and is
    ///  consumed by whichever alternative matches first. The most recently added
    ///  alternative is tested first.
    pub fn or(mut self, alternative: MessageFilterBuilder) -> Self {
        assert!(
            alternative.callback.is_none(),
            "callbacks belong on the outermost filter, not on an alternative"
        );
        self.alternatives.push(alternative.current);
        self.alternatives.extend(alternative.alternatives);
        self
    }

    pub fn callback(mut self, callback: Arc<dyn FilterCallback>) -> Self {
        self.callback = Some(callback);
        self.slow_callback = false;
        self
    }

    /// like [MessageFilterBuilder::callback], but the notification runs on the blocking
    ///  worker pool
    pub fn slow_callback(mut self, callback: Arc<dyn FilterCallback>) -> Self {
        self.callback = Some(callback);
        self.slow_callback = true;
        self
    }

    pub fn build(self) -> Arc<MessageFilter> {
        let mut clauses = Vec::with_capacity(1 + self.alternatives.len());
        clauses.push(self.current);
        clauses.extend(self.alternatives);

        Arc::new(MessageFilter {
            clauses: Mutex::new(clauses),
            state: Mutex::new(FilterState {
                matched: false,
                message: None,
                dropped: None,
                registered: false,
                notified: false,
            }),
            wakeup: Notify::new(),
            callback: self.callback,
            slow_callback: self.slow_callback,
        })
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::comm::schema::{FieldType, MessageSchema};
    use crate::test_util::test_peer_from_number;

    use super::*;

    fn ping_schema() -> Arc<MessageSchema> {
        Arc::new(MessageSchema::new("ping").field("seq", FieldType::I32))
    }

    fn pong_schema() -> Arc<MessageSchema> {
        Arc::new(MessageSchema::new("pong").field("seq", FieldType::I32))
    }

    fn ping(schema: &Arc<MessageSchema>, seq: i32) -> Message {
        let mut m = Message::new(schema);
        m.set("seq", seq).unwrap();
        m
    }

    #[test]
    fn test_match_constraints() {
        let ping_s = ping_schema();
        let pong_s = pong_schema();
        let now = Instant::now();

        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .field_eq("seq", 7)
            .timeout(Duration::from_secs(10))
            .build();

        assert_eq!(filter.match_message(&ping(&ping_s, 7), now), MatchOutcome::Matched);
        assert_eq!(filter.match_message(&ping(&ping_s, 8), now), MatchOutcome::None);
        assert_eq!(filter.match_message(&ping(&pong_s, 7), now), MatchOutcome::None);
    }

    #[test]
    fn test_match_source_constraint() {
        let peer_a = test_peer_from_number(1);
        let peer_b = test_peer_from_number(2);
        let now = Instant::now();

        let mut registry = crate::comm::schema::MessageRegistry::new();
        let schema = registry
            .register(MessageSchema::new("ping").field("seq", FieldType::I32))
            .unwrap();

        let filter = MessageFilter::builder()
            .schema(&schema)
            .source(&peer_a)
            .timeout(Duration::from_secs(10))
            .build();

        let mut buf = bytes::BytesMut::new();
        ping(&schema, 1).encode(&mut buf).unwrap();

        let from_a = Message::decode(&registry, &buf, Some(peer_a.clone()), buf.len()).unwrap();
        let from_b = Message::decode(&registry, &buf, Some(peer_b.clone()), buf.len()).unwrap();
        let local = Message::decode(&registry, &buf, None, buf.len()).unwrap();

        assert_eq!(filter.match_message(&from_a, now), MatchOutcome::Matched);
        assert_eq!(filter.match_message(&from_b, now), MatchOutcome::None);
        assert_eq!(filter.match_message(&local, now), MatchOutcome::None);
    }

    #[rstest]
    #[case::mismatch_before_deadline(8, Duration::from_secs(1), MatchOutcome::None)]
    #[case::mismatch_after_deadline(8, Duration::from_secs(11), MatchOutcome::TimedOut)]
    #[case::match_before_deadline(7, Duration::from_secs(1), MatchOutcome::Matched)]
    #[case::match_after_deadline(7, Duration::from_secs(11), MatchOutcome::TimedOutAndMatched)]
    fn test_match_outcomes_around_deadline(
        #[case] seq: i32,
        #[case] elapsed: Duration,
        #[case] expected: MatchOutcome,
    ) {
        let ping_s = ping_schema();
        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .field_eq("seq", 7)
            .timeout(Duration::from_secs(10))
            .build();

        let now = Instant::now() + elapsed;
        assert_eq!(filter.match_message(&ping(&ping_s, seq), now), expected);
    }

    #[test]
    fn test_or_chain_matches_once() {
        let ping_s = ping_schema();
        let pong_s = pong_schema();
        let now = Instant::now();

        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .timeout(Duration::from_secs(10))
            .or(MessageFilter::builder()
                .schema(&pong_s)
                .timeout(Duration::from_secs(10)))
            .build();

        assert_eq!(filter.match_message(&ping(&ping_s, 1), now), MatchOutcome::Matched);
        assert_eq!(filter.match_message(&ping(&pong_s, 1), now), MatchOutcome::Matched);

        let other = Arc::new(MessageSchema::new("other"));
        assert_eq!(filter.match_message(&Message::new(&other), now), MatchOutcome::None);
    }

    #[test]
    fn test_or_chain_timeout_propagates() {
        let ping_s = ping_schema();
        let pong_s = pong_schema();

        // the alternative expires long before the primary clause
        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .timeout(Duration::from_secs(100))
            .or(MessageFilter::builder()
                .schema(&pong_s)
                .timeout(Duration::from_secs(1)))
            .build();

        let now = Instant::now() + Duration::from_secs(10);
        // a message matching neither clause: the expired alternative is consulted
        //  first and times out the whole chain
        let other = Arc::new(MessageSchema::new("other"));
        assert_eq!(filter.match_message(&Message::new(&other), now), MatchOutcome::TimedOut);
    }

    #[test]
    fn test_deadline_is_chain_minimum() {
        let ping_s = ping_schema();
        let pong_s = pong_schema();

        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .timeout(Duration::from_secs(100))
            .or(MessageFilter::builder()
                .schema(&pong_s)
                .timeout(Duration::from_secs(1)))
            .build();

        assert!(filter.deadline() <= Instant::now() + Duration::from_secs(1));
    }

    #[test]
    fn test_on_start_waiting_recomputes_deadline() {
        let ping_s = ping_schema();

        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .timeout(Duration::from_secs(10))
            .build();

        let late = Instant::now() + Duration::from_secs(60);
        filter.on_start_waiting(late);
        assert!(filter.deadline() >= late + Duration::from_secs(9));
    }

    #[test]
    fn test_timeout_relative_to_creation_is_fixed() {
        let ping_s = ping_schema();

        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .timeout(Duration::from_secs(10))
            .timeout_relative_to_creation()
            .build();

        let original = filter.deadline();
        filter.on_start_waiting(Instant::now() + Duration::from_secs(60));
        assert_eq!(filter.deadline(), original);
    }

    #[test]
    fn test_dropped_source_detection() {
        let ping_s = ping_schema();
        let peer = test_peer_from_number(1);

        let filter = MessageFilter::builder()
            .schema(&ping_s)
            .source(&peer)
            .timeout(Duration::from_secs(10))
            .build();

        assert!(filter.any_connections_dropped().is_none());

        peer.restart(99);
        assert_eq!(filter.any_connections_dropped(), Some(peer.clone()));

        peer.set_connected(false);
        assert_eq!(filter.any_connections_dropped(), Some(peer));
    }

    #[test]
    fn test_begin_use_guards_concurrent_submission() {
        let filter = MessageFilter::builder()
            .schema(&ping_schema())
            .timeout(Duration::from_secs(10))
            .build();

        filter.begin_use().unwrap();
        assert!(matches!(filter.begin_use(), Err(FilterError::IllegalUse(_))));
        assert!(matches!(filter.reset(), Err(FilterError::IllegalUse(_))));

        filter.end_use();
        filter.reset().unwrap();
        filter.begin_use().unwrap();
    }
}
