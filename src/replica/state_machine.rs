use bytes::Bytes;
use std::error::Error;
use std::io::Read;

pub type StateMachineError = Box<dyn Error + Send + Sync>;

/// StateMachine is the application specific view of applying the replicated log in sequential
/// consistent order.
pub trait StateMachine: Send + 'static {
    /// `apply` is called only when it's guaranteed that the provided command has been committed
    /// (i.e. replicated to a majority). Because of this guarantee, you will never need to reverse a
    /// command once you've been asked to apply it. Note: a command is synonymous with a state
    /// transition.
    ///
    /// The leader will not respond success to the client's request until this method call
    /// completes. The returned bytes are handed back to the client that proposed the command. An
    /// error is also handed back to that client, but the command still counts as applied.
    fn apply(&mut self, command: Bytes) -> Result<Bytes, StateMachineError>;

    /// Point-in-time copy of the whole state, read lazily by the snapshot writer.
    fn snapshot(&mut self) -> Result<Box<dyn Read + Send>, StateMachineError>;

    /// Replace the whole state with what `snapshot` produced. An empty reader means empty state.
    fn restore(&mut self, snapshot: Box<dyn Read + Send>) -> Result<(), StateMachineError>;
}
