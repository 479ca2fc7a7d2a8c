use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::node::{NameDomain, NodeId};
use crate::source_path::SourcePathResolver;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl fmt::Display) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            ConfigError::Missing(field) => field,
            ConfigError::Invalid { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Launch,
    Attach,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Launch => "launch",
            SessionMode::Attach => "attach",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    #[default]
    Integrated,
    External,
}

/// How the debuggee is started in launch mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInTerminal {
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Overlay on the ambient environment. `None` unsets the variable.
    pub env: BTreeMap<String, Option<String>>,
    pub kind: TerminalKind,
    pub args_can_be_interpreted_by_shell: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachConfig {
    pub node: NodeId,
    pub cookie: Option<String>,
    pub cwd: PathBuf,
    pub strip_source_prefix: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub run_in_terminal: RunInTerminal,
    pub name_domain: NameDomain,
    /// Node name the args already give the debuggee with `-sname`/`-name`.
    pub node: Option<NodeId>,
    pub node_init_code_in_env_var: Option<String>,
    pub strip_source_prefix: Option<PathBuf>,
    pub timeout: Duration,
}

/// Validated configuration of one debug session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionConfig {
    Attach(AttachConfig),
    Launch(LaunchConfig),
}

impl SessionConfig {
    /// Validates a raw request body for the given mode. Only the shape of the
    /// request is checked; paths and nodes are not looked up.
    pub fn validate(mode: SessionMode, raw: &Value) -> Result<Self, ConfigError> {
        debug!(mode = mode.as_str(), "Validating session configuration");

        let config = match mode {
            SessionMode::Attach => SessionConfig::Attach(validate_attach(raw)?),
            SessionMode::Launch => SessionConfig::Launch(validate_launch(raw)?),
        };

        Ok(config)
    }

    pub fn mode(&self) -> SessionMode {
        match self {
            SessionConfig::Attach(_) => SessionMode::Attach,
            SessionConfig::Launch(_) => SessionMode::Launch,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            SessionConfig::Attach(c) => c.timeout,
            SessionConfig::Launch(c) => c.timeout,
        }
    }

    pub fn source_path_resolver(&self) -> SourcePathResolver {
        match self {
            SessionConfig::Attach(c) => {
                SourcePathResolver::new(&c.cwd, c.strip_source_prefix.clone())
            }
            SessionConfig::Launch(c) => SourcePathResolver::new(
                &c.run_in_terminal.cwd,
                c.strip_source_prefix.clone(),
            ),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachArgs {
    node: Option<String>,
    cookie: Option<String>,
    cwd: Option<PathBuf>,
    strip_source_prefix: Option<PathBuf>,
    timeout: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunInTerminalArgs {
    args: Option<Vec<String>>,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, Option<String>>>,
    kind: Option<TerminalKind>,
    args_can_be_interpreted_by_shell: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchArgs {
    name_domain: Option<NameDomain>,
    node_init_code_in_env_var: Option<String>,
    strip_source_prefix: Option<PathBuf>,
    timeout: Option<f64>,
}

fn validate_attach(raw: &Value) -> Result<AttachConfig, ConfigError> {
    let args: AttachArgs = section(raw, "config")?;

    let node = args
        .node
        .ok_or(ConfigError::Missing("config.node"))?
        .parse::<NodeId>()
        .map_err(|e| ConfigError::invalid("config.node", e))?;

    Ok(AttachConfig {
        node,
        cookie: args.cookie,
        cwd: args.cwd.ok_or(ConfigError::Missing("config.cwd"))?,
        strip_source_prefix: args.strip_source_prefix,
        timeout: timeout(args.timeout, "config.timeout")?,
    })
}

fn validate_launch(raw: &Value) -> Result<LaunchConfig, ConfigError> {
    let terminal: RunInTerminalArgs = section(raw, "runInTerminal")?;
    let config: LaunchArgs = section(raw, "config")?;

    let args = terminal.args.ok_or(ConfigError::Missing("runInTerminal.args"))?;
    if args.is_empty() {
        return Err(ConfigError::invalid(
            "runInTerminal.args",
            "expected a non-empty array of strings",
        ));
    }

    let run_in_terminal = RunInTerminal {
        args,
        cwd: terminal.cwd.ok_or(ConfigError::Missing("runInTerminal.cwd"))?,
        env: terminal.env.unwrap_or_default(),
        kind: terminal.kind.unwrap_or_default(),
        args_can_be_interpreted_by_shell: terminal.args_can_be_interpreted_by_shell.unwrap_or(false),
    };
    let name_domain = config.name_domain.ok_or(ConfigError::Missing("config.nameDomain"))?;
    let node = named_node(&run_in_terminal, name_domain)?;

    Ok(LaunchConfig {
        run_in_terminal,
        name_domain,
        node,
        node_init_code_in_env_var: config.node_init_code_in_env_var,
        strip_source_prefix: config.strip_source_prefix,
        timeout: timeout(config.timeout, "config.timeout")?,
    })
}

/// Deserializes one object of the request body. A type error is attributed
/// to the first member that fails on its own.
fn section<T: DeserializeOwned>(raw: &Value, name: &'static str) -> Result<T, ConfigError> {
    let fields = match raw.get(name) {
        None | Some(Value::Null) => return Err(ConfigError::Missing(name)),
        Some(Value::Object(fields)) => fields,
        Some(_) => return Err(ConfigError::invalid(name, "expected an object")),
    };

    serde_json::from_value(Value::Object(fields.clone())).map_err(|e| {
        let culprit = fields.iter().find(|(key, value)| {
            let single = Map::from_iter([((*key).clone(), (*value).clone())]);
            serde_json::from_value::<T>(Value::Object(single)).is_err()
        });
        match culprit {
            Some((key, _)) => ConfigError::invalid(format!("{name}.{key}"), e),
            None => ConfigError::invalid(name, e),
        }
    })
}

fn timeout(secs: Option<f64>, field: &'static str) -> Result<Duration, ConfigError> {
    match secs {
        None => Ok(DEFAULT_TIMEOUT),
        Some(secs) if secs.is_finite() && (0.0..=f64::from(u32::MAX)).contains(&secs) => {
            Ok(Duration::from_secs_f64(secs))
        }
        Some(_) => Err(ConfigError::invalid(field, "expected a non-negative number of seconds")),
    }
}

/// Finds a `-sname`/`-name` flag in the debuggee's args. The adapter must
/// connect to that node, so it needs an explicit host in the configured
/// domain.
fn named_node(terminal: &RunInTerminal, domain: NameDomain) -> Result<Option<NodeId>, ConfigError> {
    const FIELD: &str = "runInTerminal.args";

    let tokens: Vec<&str> = if terminal.args_can_be_interpreted_by_shell {
        terminal.args.iter().flat_map(|arg| arg.split_whitespace()).collect()
    } else {
        terminal.args.iter().map(String::as_str).collect()
    };

    let Some(position) = tokens.iter().position(|t| matches!(*t, "-sname" | "-name")) else {
        return Ok(None);
    };
    let flag = tokens[position];
    let flag_domain = if flag == "-sname" {
        NameDomain::Shortnames
    } else {
        NameDomain::Longnames
    };
    if flag_domain != domain {
        return Err(ConfigError::invalid(
            "config.nameDomain",
            format!("`{flag}` in the args starts the node with {flag_domain}"),
        ));
    }

    let value = tokens
        .get(position + 1)
        .ok_or_else(|| ConfigError::invalid(FIELD, format!("`{flag}` has no node name")))?;
    let node = value.parse::<NodeId>().map_err(|e| {
        ConfigError::invalid(
            FIELD,
            format!("{e}; give `{flag}` a full `name@host` so the adapter can connect to it"),
        )
    })?;
    node.check_domain(domain).map_err(|e| ConfigError::invalid(FIELD, e))?;

    Ok(Some(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn launch_body() -> Value {
        json!({
            "runInTerminal": {
                "args": ["erl", "-pa", "ebin"],
                "cwd": "/ws",
            },
            "config": { "nameDomain": "shortnames" }
        })
    }

    #[test]
    fn test_attach_minimal() {
        let raw = json!({ "config": { "node": "app@box", "cwd": "/ws" } });
        let config = SessionConfig::validate(SessionMode::Attach, &raw).unwrap();

        let SessionConfig::Attach(attach) = config else {
            panic!("expected attach config");
        };
        assert_eq!(attach.node, NodeId::new("app", "box"));
        assert_eq!(attach.cookie, None);
        assert_eq!(attach.cwd, PathBuf::from("/ws"));
        assert_eq!(attach.strip_source_prefix, None);
        assert_eq!(attach.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_attach_full() {
        let raw = json!({
            "config": {
                "node": "app@box.lan",
                "cookie": "secret",
                "cwd": "/ws",
                "stripSourcePrefix": "/build",
                "timeout": 5
            }
        });
        let SessionConfig::Attach(attach) = SessionConfig::validate(SessionMode::Attach, &raw).unwrap()
        else {
            panic!("expected attach config");
        };
        assert_eq!(attach.cookie.as_deref(), Some("secret"));
        assert_eq!(attach.strip_source_prefix, Some(PathBuf::from("/build")));
        assert_eq!(attach.timeout, Duration::from_secs(5));
    }

    #[rstest]
    #[case::missing_node(json!({ "config": { "cwd": "/ws" } }), "config.node")]
    #[case::missing_cwd(json!({ "config": { "node": "app@box" } }), "config.cwd")]
    #[case::missing_config(json!({}), "config")]
    #[case::bad_node(json!({ "config": { "node": "app", "cwd": "/ws" } }), "config.node")]
    #[case::bad_cookie(json!({ "config": { "node": "a@b", "cwd": "/ws", "cookie": 1 } }), "config.cookie")]
    fn test_attach_errors(#[case] raw: Value, #[case] field: &str) {
        let err = SessionConfig::validate(SessionMode::Attach, &raw).unwrap_err();
        assert_eq!(err.field(), field);
    }

    #[test]
    fn test_launch_defaults() {
        let SessionConfig::Launch(launch) =
            SessionConfig::validate(SessionMode::Launch, &launch_body()).unwrap()
        else {
            panic!("expected launch config");
        };
        assert_eq!(launch.run_in_terminal.args, vec!["erl", "-pa", "ebin"]);
        assert_eq!(launch.node, None);
        assert_eq!(launch.run_in_terminal.kind, TerminalKind::Integrated);
        assert!(!launch.run_in_terminal.args_can_be_interpreted_by_shell);
        assert!(launch.run_in_terminal.env.is_empty());
        assert_eq!(launch.name_domain, NameDomain::Shortnames);
        assert_eq!(launch.timeout, DEFAULT_TIMEOUT);
        assert_eq!(launch.node_init_code_in_env_var, None);
    }

    #[test]
    fn test_launch_env_unset_marker() {
        let mut raw = launch_body();
        raw["runInTerminal"]["env"] = json!({ "KEEP": "1", "DROP": null, "EMPTY": "" });
        raw["runInTerminal"]["kind"] = json!("external");
        raw["config"]["nodeInitCodeInEnvVar"] = json!("ERL_DAP_INIT");

        let SessionConfig::Launch(launch) = SessionConfig::validate(SessionMode::Launch, &raw).unwrap()
        else {
            panic!("expected launch config");
        };
        let env = &launch.run_in_terminal.env;
        assert_eq!(env.get("KEEP"), Some(&Some("1".to_string())));
        assert_eq!(env.get("DROP"), Some(&None));
        assert_eq!(env.get("EMPTY"), Some(&Some(String::new())));
        assert_eq!(launch.run_in_terminal.kind, TerminalKind::External);
        assert_eq!(launch.node_init_code_in_env_var.as_deref(), Some("ERL_DAP_INIT"));
    }

    #[rstest]
    #[case::missing_args("/runInTerminal/args", Value::Null, "runInTerminal.args")]
    #[case::empty_args("/runInTerminal/args", json!([]), "runInTerminal.args")]
    #[case::non_string_args("/runInTerminal/args", json!(["erl", 1]), "runInTerminal.args")]
    #[case::missing_cwd("/runInTerminal/cwd", Value::Null, "runInTerminal.cwd")]
    #[case::missing_domain("/config/nameDomain", Value::Null, "config.nameDomain")]
    #[case::bad_domain("/config/nameDomain", json!("mediumnames"), "config.nameDomain")]
    #[case::bad_kind("/runInTerminal/kind", json!("floating"), "runInTerminal.kind")]
    #[case::bad_env("/runInTerminal/env", json!({ "A": 1 }), "runInTerminal.env")]
    #[case::negative_timeout("/config/timeout", json!(-1), "config.timeout")]
    fn test_launch_errors(#[case] pointer: &str, #[case] value: Value, #[case] field: &str) {
        let mut raw = launch_body();
        let (parent, key) = pointer.rsplit_once('/').unwrap();
        raw.pointer_mut(parent).unwrap()[key] = value;

        let err = SessionConfig::validate(SessionMode::Launch, &raw).unwrap_err();
        assert_eq!(err.field(), field);
    }

    #[test]
    fn test_attach_body_is_not_a_launch_body() {
        let raw = json!({ "config": { "node": "app@box", "cwd": "/ws" } });
        let err = SessionConfig::validate(SessionMode::Launch, &raw).unwrap_err();
        assert_eq!(err, ConfigError::Missing("runInTerminal"));
    }

    #[test]
    fn test_resolver_follows_mode_cwd() {
        let SessionConfig::Launch(mut launch) =
            SessionConfig::validate(SessionMode::Launch, &launch_body()).unwrap()
        else {
            panic!("expected launch config");
        };
        launch.strip_source_prefix = Some(PathBuf::from("/build"));
        let resolver = SessionConfig::Launch(launch).source_path_resolver();
        assert_eq!(resolver.resolve("/build/src/a.erl"), PathBuf::from("/ws/src/a.erl"));
    }

    #[test]
    fn test_type_errors_name_the_member() {
        let raw = json!({ "config": { "node": "app@box", "cwd": "/ws", "timeout": "soon" } });
        let err = SessionConfig::validate(SessionMode::Attach, &raw).unwrap_err();

        assert_eq!(err.field(), "config.timeout");
        assert!(err.to_string().contains("invalid type: string"), "{err}");
    }

    #[rstest]
    #[case::sname_with_host(json!(["erl", "-sname", "app@localhost"]), false, "shortnames", Some("app@localhost"))]
    #[case::name_with_host(json!(["erl", "-name", "app@box.lan"]), false, "longnames", Some("app@box.lan"))]
    #[case::shell_args(json!(["erl -sname app@localhost -s app"]), true, "shortnames", Some("app@localhost"))]
    #[case::no_name(json!(["rebar3", "shell"]), false, "shortnames", None)]
    fn test_launch_node_from_args(
        #[case] args: Value,
        #[case] shell: bool,
        #[case] domain: &str,
        #[case] expected: Option<&str>,
    ) {
        let mut raw = launch_body();
        raw["runInTerminal"]["args"] = args;
        raw["runInTerminal"]["argsCanBeInterpretedByShell"] = json!(shell);
        raw["config"]["nameDomain"] = json!(domain);

        let SessionConfig::Launch(launch) = SessionConfig::validate(SessionMode::Launch, &raw).unwrap()
        else {
            panic!("expected launch config");
        };
        assert_eq!(launch.node, expected.map(|n| n.parse::<NodeId>().unwrap()));
    }

    #[rstest]
    #[case::sname_without_host(json!(["erl", "-sname", "app"]), "shortnames", "runInTerminal.args")]
    #[case::dangling_flag(json!(["erl", "-sname"]), "shortnames", "runInTerminal.args")]
    #[case::flag_against_domain(json!(["erl", "-name", "app@box.lan"]), "shortnames", "config.nameDomain")]
    #[case::dotted_short_name(json!(["erl", "-sname", "app@box.lan"]), "shortnames", "runInTerminal.args")]
    fn test_launch_node_flag_errors(#[case] args: Value, #[case] domain: &str, #[case] field: &str) {
        let mut raw = launch_body();
        raw["runInTerminal"]["args"] = args;
        raw["config"]["nameDomain"] = json!(domain);

        let err = SessionConfig::validate(SessionMode::Launch, &raw).unwrap_err();
        assert_eq!(err.field(), field, "{err}");
    }
}
