#[cfg(test)] use mockall::automock;

/// Byte accounting hook, invoked by the transport on every send / receive and by the
///  matching engine when a message is actually delivered to a consumer.
///
/// Implementations must be cheap and non-blocking - these are called on the hot path.
#[cfg_attr(test, automock)]
pub trait ByteCounter: Send + Sync + 'static {
    fn sent_bytes(&self, n: usize);

    fn received_bytes(&self, n: usize);

    /// payload bytes actually handed to a consumer, as opposed to raw wire bytes
    fn sent_payload(&self, n: usize);
}

/// for callers that do not care about accounting
#[derive(Debug)]
pub struct NoopByteCounter;

impl ByteCounter for NoopByteCounter {
    fn sent_bytes(&self, _n: usize) {}
    fn received_bytes(&self, _n: usize) {}
    fn sent_payload(&self, _n: usize) {}
}
