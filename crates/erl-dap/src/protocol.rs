use crate::connector::NodeChannel;
use crate::session::{SessionError, StartError};

/// Messages sent from a running session to the DAP server
#[derive(Debug)]
pub enum SessionEvent {
    /// The debugging channel to the node is up
    Attached { channel: NodeChannel },
    /// The session never reached the node
    StartFailed(StartError),
    /// The session was stopped by the user
    Detached,
    /// An attached session lost its node
    ConnectionLost(SessionError),
}
