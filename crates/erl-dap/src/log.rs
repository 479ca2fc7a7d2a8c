use std::io::{self, Write};

use crossbeam_channel::{Receiver, Sender};
use dap::types::OutputEventCategory;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

/// Target the launcher logs debuggee output under.
pub const DEBUGGEE_TARGET: &str = "debuggee";

/// One formatted log record bound for the client's debug console.
#[derive(Debug, Clone)]
pub struct ConsoleLine {
    pub text: String,
    pub category: OutputEventCategory,
}

/// Tracing writer whose output ends up in the client's debug console.
/// Debuggee output is shown as `stdout`, warnings and errors as `stderr`.
#[derive(Clone)]
pub struct DebugConsoleWriter {
    sender: Sender<ConsoleLine>,
    category: OutputEventCategory,
}

impl DebugConsoleWriter {
    pub fn new() -> (Self, Receiver<ConsoleLine>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = Self {
            sender: tx,
            category: OutputEventCategory::Console,
        };
        (writer, rx)
    }

    fn with_category(&self, category: OutputEventCategory) -> Self {
        Self {
            sender: self.sender.clone(),
            category,
        }
    }
}

fn category_for(meta: &Metadata<'_>) -> OutputEventCategory {
    if meta.target() == DEBUGGEE_TARGET {
        OutputEventCategory::Stdout
    } else if *meta.level() <= Level::WARN {
        OutputEventCategory::Stderr
    } else {
        OutputEventCategory::Console
    }
}

impl Write for DebugConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = ConsoleLine {
            text: String::from_utf8_lossy(buf).to_string(),
            category: self.category.clone(),
        };
        if let Err(e) = self.sender.send(line) {
            // stdout belongs to the protocol, so stderr is the only place left
            eprintln!("Warning: Log channel is closed, message dropped: {}", e.0.text);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DebugConsoleWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.with_category(category_for(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{error, info, warn};

    #[test]
    fn test_records_are_categorized() {
        let (writer, rx) = DebugConsoleWriter::new();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            info!("Session attached");
            warn!("Lost connection to node");
            error!("Failed to terminate debuggee");
            info!(target: DEBUGGEE_TARGET, "Eshell V15");
        });

        let lines: Vec<ConsoleLine> = rx.try_iter().collect();
        let categories: Vec<_> = lines
            .iter()
            .map(|line| serde_json::to_value(&line.category).unwrap())
            .collect();
        assert_eq!(categories, ["console", "stderr", "stderr", "stdout"]);
        assert!(lines[3].text.contains("Eshell V15"));
    }

    #[test]
    fn test_writer_survives_closed_channel() {
        let (mut writer, rx) = DebugConsoleWriter::new();
        drop(rx);
        assert_eq!(writer.write(b"lost").unwrap(), 4);
    }
}
