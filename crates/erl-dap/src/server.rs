use dap::prelude::*;
use std::io::{self, BufReader, BufWriter};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

use crate::adapter::{ErlAdapter, console_output};
use crate::error::ErlAdapterError;
use crate::log::DebugConsoleWriter;
use crate::settings::AdapterSettings;

type DynResult<T> = miette::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn start(settings: AdapterSettings) -> DynResult<()> {
    let (debug_writer, log_rx) = DebugConsoleWriter::new();

    tracing_subscriber::fmt()
        .with_env_filter(settings.env_filter())
        .with_ansi(false)
        .with_writer(debug_writer)
        .init();

    info!(?settings, "Starting erl-dap debug adapter");

    let mut adapter = ErlAdapter::new(settings.backends())?;
    let reader = BufReader::new(io::stdin());
    let writer = BufWriter::new(io::stdout());
    let mut server = Server::new(reader, writer);

    // First, the client sends an initialize request
    let req = match server.poll_request()? {
        Some(req) => req,
        None => {
            return Err(Box::new(ErlAdapterError::ProtocolError(
                "Missing initialize request".to_string(),
            )));
        }
    };

    if let Command::Initialize(_) = &req.command {
        let capabilities = types::Capabilities {
            supports_configuration_done_request: Some(true),
            supports_terminate_request: Some(true),
            supports_restart_request: Some(true),
            supports_exception_options: Some(false),
            supports_exception_filter_options: Some(false),
            ..Default::default()
        };
        let rsp = req.success(ResponseBody::Initialize(capabilities));
        server.respond(rsp)?;
        server.send_event(Event::Initialized)?;
    } else {
        return Err(Box::new(ErlAdapterError::ProtocolError(
            "Expected initialize request".to_string(),
        )));
    }

    let output = Arc::clone(&server.output);
    thread::spawn(move || {
        for line in log_rx {
            let Ok(mut output) = output.lock() else {
                break;
            };
            if let Err(e) = output.send_event(console_output(line.text, line.category)) {
                eprintln!("Failed to send log output: {}", e);
            }
        }
    });

    loop {
        debug!("Waiting for next request");
        match server.poll_request()? {
            Some(req) => {
                if let Err(e) = adapter.handle_request(req, &mut server) {
                    error!(error = %e, "Failed to handle DAP request");
                    if let Some(ErlAdapterError::ProtocolError(msg)) = e.downcast_ref::<ErlAdapterError>()
                        && msg == "Shutdown"
                    {
                        break;
                    }
                }
            }
            None => {
                info!("Client disconnected or stream ended");
                break;
            }
        }
    }

    adapter.teardown();
    Ok(())
}
