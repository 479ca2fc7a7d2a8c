//! Debug adapter that launches Erlang nodes, or attaches to running ones, and
//! manages the lifetime of the debug session over the Debug Adapter Protocol.
pub mod adapter;
pub mod config;
pub mod connector;
pub mod debugger;
pub mod dist;
pub mod error;
pub mod launcher;
pub mod log;
pub mod node;
pub mod protocol;
pub mod server;
pub mod session;
pub mod settings;
pub mod source_path;
pub mod term;

pub use server::start;
pub use settings::AdapterSettings;
