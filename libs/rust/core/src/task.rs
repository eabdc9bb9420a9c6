//! Training task descriptor and the validated command line handed to the
//! external trainer.
//!
//! Every token that reaches the process boundary (interpreter, script, flag
//! names, values, model paths) must match `[A-Za-z0-9./_=-]{1,256}`. Flag names
//! may not start with `-`, so a value can never smuggle in an extra option.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FederationError;

pub const MAX_ARG_LEN: usize = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub train: TaskConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Executable or script path.
    #[serde(default)]
    pub script: String,
    /// Optional program that runs `script` (e.g. `python3`).
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Named arguments, rendered as `--name value` in name order.
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Int(i) => write!(f, "{i}"),
            ArgValue::Float(x) => write!(f, "{x}"),
            ArgValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self { ArgValue::Text(s.to_string()) }
}

/// A fully validated trainer invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingCommand {
    program: String,
    args: Vec<String>,
}

impl TrainingCommand {
    pub fn builder(task: &TaskConfig) -> TrainingCommandBuilder<'_> {
        TrainingCommandBuilder { task, model_in: None, model_out: None }
    }

    pub fn program(&self) -> &str { &self.program }

    pub fn args(&self) -> &[String] { &self.args }
}

pub struct TrainingCommandBuilder<'a> {
    task: &'a TaskConfig,
    model_in: Option<&'a Path>,
    model_out: Option<&'a Path>,
}

impl<'a> TrainingCommandBuilder<'a> {
    pub fn model_in(mut self, path: &'a Path) -> Self { self.model_in = Some(path); self }

    pub fn model_out(mut self, path: &'a Path) -> Self { self.model_out = Some(path); self }

    pub fn build(self) -> Result<TrainingCommand, FederationError> {
        let script = check_token("script", &self.task.script)?;
        let model_in = path_token("model-in", self.model_in)?;
        let model_out = path_token("model-out", self.model_out)?;

        let (program, mut args) = match &self.task.interpreter {
            Some(interp) => (check_token("interpreter", interp)?.to_string(), vec![script.to_string()]),
            None => (script.to_string(), Vec::new()),
        };
        args.extend(["--model-in".to_string(), model_in, "--model-out".to_string(), model_out]);

        for (name, value) in &self.task.args {
            let name = check_token("argument name", name)?;
            if name.starts_with('-') {
                return Err(FederationError::InvalidArgument(format!("argument name `{name}` must not start with '-'")));
            }
            if name == "model-in" || name == "model-out" {
                return Err(FederationError::InvalidArgument(format!("argument name `{name}` is reserved")));
            }
            let rendered = value.to_string();
            check_token(name, &rendered)?;
            args.push(format!("--{name}"));
            args.push(rendered);
        }
        Ok(TrainingCommand { program, args })
    }
}

fn path_token(what: &str, path: Option<&Path>) -> Result<String, FederationError> {
    let path = path.ok_or_else(|| FederationError::InvalidArgument(format!("{what} path not set")))?;
    let s = path.to_str().ok_or_else(|| FederationError::InvalidArgument(format!("{what} path is not valid UTF-8")))?;
    Ok(check_token(what, s)?.to_string())
}

/// Accepts `[A-Za-z0-9./_=-]{1,MAX_ARG_LEN}`.
pub fn check_token<'s>(what: &str, s: &'s str) -> Result<&'s str, FederationError> {
    if s.is_empty() {
        return Err(FederationError::InvalidArgument(format!("{what} is empty")));
    }
    if s.len() > MAX_ARG_LEN {
        return Err(FederationError::InvalidArgument(format!("{what} exceeds {MAX_ARG_LEN} bytes")));
    }
    if let Some(bad) = s.chars().find(|c| !is_safe_char(*c)) {
        return Err(FederationError::InvalidArgument(format!("{what} contains forbidden character {bad:?}")));
    }
    Ok(s)
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '-' | '_' | '=')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task(args: &[(&str, ArgValue)]) -> TaskConfig {
        TaskConfig {
            script: "scripts/train.py".into(),
            interpreter: Some("python3".into()),
            args: args.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn build(task: &TaskConfig) -> Result<TrainingCommand, FederationError> {
        let input = PathBuf::from("work/model.bin");
        let output = PathBuf::from("work/update.bin");
        TrainingCommand::builder(task).model_in(&input).model_out(&output).build()
    }

    #[test]
    fn well_formed_arguments_are_accepted() {
        let t = task(&[("learning_rate", ArgValue::Float(0.01)), ("epochs", ArgValue::Int(2))]);
        let cmd = build(&t).unwrap();
        assert_eq!(cmd.program(), "python3");
        assert_eq!(
            cmd.args(),
            ["scripts/train.py", "--model-in", "work/model.bin", "--model-out", "work/update.bin", "--epochs", "2", "--learning_rate", "0.01"]
        );
    }

    #[test]
    fn shell_metacharacters_are_rejected() {
        for bad in ["0.01;rm", "a|b", "`id`", "x y", "$(id)", "a&b", "a>b"] {
            let t = task(&[("learning_rate", ArgValue::from(bad))]);
            assert!(matches!(build(&t), Err(FederationError::InvalidArgument(_))), "accepted {bad:?}");
        }
        let t = task(&[("lr;x", ArgValue::Float(0.1))]);
        assert!(matches!(build(&t), Err(FederationError::InvalidArgument(_))));
    }

    #[test]
    fn option_smuggling_and_oversize_are_rejected() {
        let t = task(&[("-lr", ArgValue::Int(1))]);
        assert!(build(&t).is_err());
        let t = task(&[("model-out", ArgValue::from("elsewhere"))]);
        assert!(build(&t).is_err());
        let long = "a".repeat(MAX_ARG_LEN + 1);
        let t = task(&[("tag", ArgValue::Text(long))]);
        assert!(build(&t).is_err());
    }

    #[test]
    fn script_without_interpreter_is_the_program() {
        let mut t = task(&[]);
        t.interpreter = None;
        t.script = "./train.sh".into();
        let cmd = build(&t).unwrap();
        assert_eq!(cmd.program(), "./train.sh");
        assert_eq!(cmd.args()[0], "--model-in");
    }

    #[test]
    fn booleans_render_as_text() {
        let t = task(&[("shuffle", ArgValue::Bool(true))]);
        let cmd = build(&t).unwrap();
        assert!(cmd.args().ends_with(&["--shuffle".to_string(), "true".to_string()]));
    }
}
