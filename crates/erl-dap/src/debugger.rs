//! Breakpoints and stopped processes, driven through the node's `int`
//! interpreter over remote calls.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::connector::{NodeChannel, RpcError};
use crate::source_path::SourcePathResolver;
use crate::term::{Pid, Term};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebuggerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("module {0} cannot be interpreted (it needs debug_info and its source on the node)")]
    NotInterpretable(String),
    #[error("unexpected reply from {call}: {reply}")]
    UnexpectedReply { call: &'static str, reply: String },
}

fn unexpected(call: &'static str, reply: &Term) -> DebuggerError {
    DebuggerError::UnexpectedReply {
        call,
        reply: format!("{reply:?}"),
    }
}

/// Module an Erlang source file compiles to.
pub fn module_of(path: &Path) -> Option<&str> {
    if path.extension()? != "erl" {
        return None;
    }
    path.file_stem()?.to_str()
}

/// Outcome of one requested breakpoint line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBreakpoint {
    pub line: i64,
    pub verified: bool,
    pub message: Option<String>,
}

/// Interprets `module` and replaces its breakpoints with `lines`.
pub async fn set_breakpoints(
    channel: &NodeChannel,
    module: &str,
    lines: &[i64],
) -> Result<Vec<LineBreakpoint>, DebuggerError> {
    let reply = channel.rpc("int", "ni", vec![Term::atom(module)]).await?;
    match reply.as_tuple() {
        Some([tag, name]) if tag.is_atom("module") && name.is_atom(module) => {}
        _ => return Err(DebuggerError::NotInterpretable(module.to_string())),
    }

    channel.rpc("int", "no_break", vec![Term::atom(module)]).await?;

    let mut results = Vec::with_capacity(lines.len());
    for &line in lines {
        let reply = channel
            .rpc("int", "break", vec![Term::atom(module), Term::Int(line)])
            .await?;
        let verified = reply.is_atom("ok")
            || matches!(reply.as_tuple(), Some([tag, reason]) if tag.is_atom("error") && reason.is_atom("break_exists"));
        results.push(LineBreakpoint {
            line,
            verified,
            message: (!verified).then(|| format!("{reply:?}")),
        });
    }

    debug!(node = %channel.node(), module, ?lines, "Breakpoints set");
    Ok(results)
}

/// An interpreted process sitting on a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedProcess {
    pub pid: Pid,
    /// Initial call as `module:function/arity`.
    pub function: String,
    pub module: String,
    pub line: i64,
}

pub async fn stopped_processes(channel: &NodeChannel) -> Result<Vec<StoppedProcess>, DebuggerError> {
    let reply = channel.rpc("int", "snapshot", vec![]).await?;
    let entries = reply.as_list().ok_or_else(|| unexpected("int:snapshot", &reply))?;
    Ok(entries.iter().filter_map(stopped_process).collect())
}

/// `{Pid, {M, F, Args}, break, {Module, Line}}`; other statuses are skipped.
fn stopped_process(entry: &Term) -> Option<StoppedProcess> {
    let [Term::Pid(pid), function, status, info] = entry.as_tuple()? else {
        return None;
    };
    if !status.is_atom("break") {
        return None;
    }
    let [module, line] = info.as_tuple()? else {
        return None;
    };
    let [m, f, args] = function.as_tuple()? else {
        return None;
    };
    let arity = args.as_list().map_or(0, <[Term]>::len);

    Some(StoppedProcess {
        pid: pid.clone(),
        function: format!("{}:{}/{arity}", m.as_atom()?, f.as_atom()?),
        module: module.as_atom()?.to_string(),
        line: line.as_int()?,
    })
}

/// Source path recorded in the module's compile info, mapped into the
/// workspace.
pub async fn module_source(
    channel: &NodeChannel,
    module: &str,
    resolver: &SourcePathResolver,
) -> Result<Option<PathBuf>, DebuggerError> {
    let reply = channel
        .rpc(module, "module_info", vec![Term::atom("compile")])
        .await?;

    let source = reply.as_list().into_iter().flatten().find_map(|item| match item.as_tuple() {
        Some([key, value]) if key.is_atom("source") => value.as_string(),
        _ => None,
    });
    Ok(source.map(|path| resolver.resolve(path)))
}

/// A stopped process together with where its source lives locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedFrame {
    pub process: StoppedProcess,
    pub source: Option<PathBuf>,
}

pub async fn stopped_frames(
    channel: &NodeChannel,
    resolver: &SourcePathResolver,
) -> Result<Vec<StoppedFrame>, DebuggerError> {
    let mut frames = Vec::new();
    for process in stopped_processes(channel).await? {
        let source = match module_source(channel, &process.module, resolver).await {
            Ok(source) => source,
            Err(e) => {
                debug!(module = %process.module, error = %e, "No source for module");
                None
            }
        };
        frames.push(StoppedFrame { process, source });
    }
    Ok(frames)
}

/// Resumes a process stopped on a breakpoint.
pub async fn continue_process(channel: &NodeChannel, pid: &Pid) -> Result<(), DebuggerError> {
    let reply = channel
        .rpc("int", "continue", vec![Term::Pid(pid.clone())])
        .await?;
    if reply.is_atom("ok") {
        Ok(())
    } else {
        Err(unexpected("int:continue", &reply))
    }
}
