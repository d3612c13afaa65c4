//! Typed command lines and shell rendering
//!
//! Commands are kept as argument vectors until they have to cross a shell
//! boundary (a remote login shell or `sh -c` for pipelines). Only then are
//! they rendered, with every token quoted.

use std::fmt;
use zreplica_types::{Error, Result};

/// Quote a token for a POSIX shell
///
/// Tokens made only of safe characters pass through unchanged; anything
/// else is wrapped in single quotes with embedded quotes escaped.
pub fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':' | '=' | '@' | ',' | '+')
        })
    {
        return token.to_owned();
    }

    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('\'');
    for ch in token.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Start a command line for `program`
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument only when `condition` holds
    pub fn arg_if<S: Into<String>>(self, condition: bool, arg: S) -> Self {
        if condition {
            self.arg(arg)
        } else {
            self
        }
    }

    /// Program name or path
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Reject command lines no process could be started with
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(Error::command(self.to_shell(), None, "empty program name"));
        }
        if self
            .args
            .iter()
            .chain(std::iter::once(&self.program))
            .any(|token| token.contains('\0'))
        {
            return Err(Error::command(self.to_shell(), None, "argument contains NUL byte"));
        }
        Ok(())
    }

    /// Render as a quoted shell command
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|token| shell_quote(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Commands connected stdout to stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<CommandLine>,
}

impl Pipeline {
    /// Start a pipeline with its first stage
    pub fn new(first: CommandLine) -> Self {
        Self {
            stages: vec![first],
        }
    }

    /// Pipe the output of the previous stage into `stage`
    pub fn pipe(mut self, stage: CommandLine) -> Self {
        self.stages.push(stage);
        self
    }

    /// Pipeline stages in order
    pub fn stages(&self) -> &[CommandLine] {
        &self.stages
    }

    /// Render as a shell pipeline
    pub fn to_shell(&self) -> String {
        self.stages
            .iter()
            .map(CommandLine::to_shell)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl From<CommandLine> for Pipeline {
    fn from(command: CommandLine) -> Self {
        Self::new(command)
    }
}

/// Pipelines run one after another in a single round-trip, stopping at the first failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    steps: Vec<Pipeline>,
}

impl Script {
    /// Build a script from its steps
    pub fn new<I, P>(steps: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Pipeline>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a step
    pub fn then<P: Into<Pipeline>>(mut self, step: P) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Script steps in order
    pub fn steps(&self) -> &[Pipeline] {
        &self.steps
    }

    /// The command, when the script is exactly one plain command
    pub fn as_single(&self) -> Option<&CommandLine> {
        match self.steps.as_slice() {
            [step] => match step.stages() {
                [command] => Some(command),
                _ => None,
            },
            _ => None,
        }
    }

    /// Reject scripts containing an unusable command line
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::command("", None, "empty script"));
        }
        self.steps
            .iter()
            .flat_map(Pipeline::stages)
            .try_for_each(CommandLine::validate)
    }

    /// Render as a shell command list
    pub fn to_shell(&self) -> String {
        self.steps
            .iter()
            .map(Pipeline::to_shell)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

impl From<CommandLine> for Script {
    fn from(command: CommandLine) -> Self {
        Self::new([command])
    }
}

impl From<Pipeline> for Script {
    fn from(pipeline: Pipeline) -> Self {
        Self::new([pipeline])
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("simple", "simple")]
    #[case("tank/data@zreplica-host-20240101", "tank/data@zreplica-host-20240101")]
    #[case("needs quoting", "'needs quoting'")]
    #[case("has'quote", "'has'\\''quote'")]
    #[case("$special", "'$special'")]
    #[case("", "''")]
    fn test_shell_quote(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[test]
    fn test_pipeline_rendering() {
        let pipeline = Pipeline::new(
            CommandLine::new("zfs")
                .arg("send")
                .arg_if(true, "-I")
                .arg_if(false, "-R")
                .arg("tank/a@1")
                .arg("tank/a@2"),
        )
        .pipe(CommandLine::new("zstd").args(["-c", "-3"]));

        assert_eq!(
            pipeline.to_shell(),
            "zfs send -I tank/a@1 tank/a@2 | zstd -c -3"
        );
    }

    #[test]
    fn test_script_rendering_and_single_detection() {
        let single: Script = CommandLine::new("zfs").arg("list").into();
        assert!(single.as_single().is_some());

        let script = Script::new([
            CommandLine::new("zfs").args(["set", "readonly=on", "pool/a"]),
            CommandLine::new("zfs").args(["rollback", "-r", "pool/a@m"]),
        ]);
        assert!(script.as_single().is_none());
        assert_eq!(
            script.to_shell(),
            "zfs set readonly=on pool/a && zfs rollback -r pool/a@m"
        );
    }

    #[test]
    fn test_validation() {
        assert!(CommandLine::new(" ").validate().is_err());
        assert!(CommandLine::new("zfs").arg("a\0b").validate().is_err());
        assert!(Script::new(Vec::<CommandLine>::new()).validate().is_err());
        assert!(Script::from(CommandLine::new("zfs")).validate().is_ok());
    }

    /// Undo single-quote rendering the way a POSIX shell would
    fn shell_unquote(rendered: &str) -> String {
        let mut out = String::new();
        let mut in_quotes = false;
        let mut chars = rendered.chars();
        while let Some(ch) = chars.next() {
            match (ch, in_quotes) {
                ('\'', _) => in_quotes = !in_quotes,
                ('\\', false) => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                (other, _) => out.push(other),
            }
        }
        out
    }

    proptest! {
        #[test]
        fn test_quote_round_trips_through_shell_rules(token in "[ -~]{0,40}") {
            prop_assert_eq!(shell_unquote(&shell_quote(&token)), token);
        }

        #[test]
        fn test_quoted_tokens_hide_metacharacters(token in "[ -~]{1,40}") {
            let quoted = shell_quote(&token);
            if quoted != token {
                prop_assert!(quoted.starts_with('\''));
                prop_assert!(quoted.ends_with('\''));
            }
        }
    }
}
