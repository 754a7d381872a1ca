use crate::comm::message::Message;

#[cfg(test)] use mockall::automock;

/// Fallback consumer for messages that no waiting filter claimed. This is where
///  unsolicited protocol messages (e.g. incoming requests) enter the node.
///
/// Invoked by the matching engine *without* its lock held, so implementations are free
///  to register new filters or send messages from within `handle_message`.
#[cfg_attr(test, automock)]
pub trait Dispatcher: Send + Sync + 'static {
    /// true = the dispatcher consumed the message; false = it declined, and the engine
    ///  keeps the message around in the unclaimed FIFO
    fn handle_message(&self, message: &Message) -> bool;
}
