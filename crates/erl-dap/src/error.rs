use dap::prelude::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErlAdapterError {
    #[error("Unhandled command: {0:?}")]
    UnhandledCommand(Box<Command>),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Missing {0} arguments")]
    MissingArguments(&'static str),
    #[error("Failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
