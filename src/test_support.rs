//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::exec::{CommandFuture, CommandOutput, CommandRunner, CommandSpec, ExecError};

/// Scripted command runner that answers by matching command lines.
///
/// Each rule pairs a substring with a queue of responses. The first rule
/// whose needle occurs in the command line answers; its queue is popped
/// until one response remains, which then repeats. Commands matching no rule
/// succeed with empty output. Every invocation is recorded.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Vec<Rule>,
    invocations: Vec<CommandInvocation>,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    responses: VecDeque<Result<CommandOutput, ExecError>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Environment overrides passed to the program.
    pub env: Vec<(String, String)>,
    /// Stdin supplied, if any.
    pub stdin: Option<Vec<u8>>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the last argument, which for `ssh` is the remote command.
    #[must_use]
    pub fn last_arg(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `output` for commands containing `needle`.
    pub fn respond(&self, needle: &str, output: CommandOutput) {
        self.push(needle, Ok(output));
    }

    /// Queues an execution error for commands containing `needle`.
    pub fn fail(&self, needle: &str, error: ExecError) {
        self.push(needle, Err(error));
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Returns recorded command lines containing `needle`.
    #[must_use]
    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.lock()
            .invocations
            .iter()
            .map(CommandInvocation::command_string)
            .filter(|line| line.contains(needle))
            .collect()
    }

    fn push(&self, needle: &str, response: Result<CommandOutput, ExecError>) {
        let mut state = self.lock();
        if let Some(rule) = state.rules.iter_mut().find(|rule| rule.needle == needle) {
            rule.responses.push_back(response);
            return;
        }
        state.rules.push(Rule {
            needle: needle.to_owned(),
            responses: VecDeque::from([response]),
        });
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let line = spec.command_string();
        let mut state = self.lock();
        state.invocations.push(CommandInvocation {
            program: spec.program.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            stdin: spec.stdin.clone(),
        });
        let Some(rule) = state
            .rules
            .iter_mut()
            .find(|rule| line.contains(rule.needle.as_str()))
        else {
            return Ok(CommandOutput::success(""));
        };
        if rule.responses.len() > 1
            && let Some(next) = rule.responses.pop_front()
        {
            return next;
        }
        rule.responses
            .front()
            .cloned()
            .unwrap_or_else(|| Ok(CommandOutput::success("")))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> CommandFuture<'a> {
        let result = self.answer(spec);
        Box::pin(async move { result })
    }
}
