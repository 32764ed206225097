//! Typed shell script builder.
//!
//! Scripts are assembled from commands, pipelines, subshells and
//! conditionals and rendered to a single string for `sh -c` style
//! interpreters. Every word is quoted on render.

use std::borrow::Cow;

/// Quotes a word for POSIX shells.
///
/// Words made only of characters with no special meaning are returned
/// unchanged; anything else is single-quoted.
pub fn quote(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@,+%".contains(&b));
    if plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Makes a path safe to pass as an operand (never parsed as an option).
pub fn operand(path: &str) -> String {
    if path.starts_with('-') {
        format!("./{path}")
    } else {
        path.to_string()
    }
}

/// A single command with arguments and an optional stdout redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    argv: Vec<String>,
    stdout: Option<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Redirects standard output to `target` (`> target`).
    pub fn stdout_to(mut self, target: impl Into<String>) -> Self {
        self.stdout = Some(target.into());
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn render(&self) -> String {
        let mut out = self
            .argv
            .iter()
            .map(|a| quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(target) = &self.stdout {
            out.push_str(" > ");
            out.push_str(&quote(target));
        }
        out
    }
}

/// A shell script built from typed parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Command(ShellCommand),
    /// `a | b | c`
    Pipeline(Vec<Script>),
    /// `a && b`
    AndThen(Vec<Script>),
    /// `a ; b`
    Sequence(Vec<Script>),
    /// `( a )`
    Subshell(Box<Script>),
    /// `if cond ; then body ; fi`
    IfThen {
        condition: Box<Script>,
        body: Box<Script>,
    },
}

impl From<ShellCommand> for Script {
    fn from(cmd: ShellCommand) -> Self {
        Self::Command(cmd)
    }
}

impl Script {
    pub fn pipeline<I: IntoIterator<Item = Script>>(stages: I) -> Self {
        Self::Pipeline(stages.into_iter().collect())
    }

    pub fn and_then<I: IntoIterator<Item = Script>>(steps: I) -> Self {
        Self::AndThen(steps.into_iter().collect())
    }

    pub fn sequence<I: IntoIterator<Item = Script>>(steps: I) -> Self {
        Self::Sequence(steps.into_iter().collect())
    }

    pub fn subshell(inner: Script) -> Self {
        Self::Subshell(Box::new(inner))
    }

    pub fn if_then(condition: Script, body: Script) -> Self {
        Self::IfThen {
            condition: Box::new(condition),
            body: Box::new(body),
        }
    }

    /// Renders the script as a single shell string.
    pub fn render(&self) -> String {
        match self {
            Self::Command(cmd) => cmd.render(),
            Self::Pipeline(stages) => join(stages, " | "),
            Self::AndThen(steps) => join(steps, " && "),
            Self::Sequence(steps) => join(steps, " ; "),
            Self::Subshell(inner) => format!("( {} )", inner.render()),
            Self::IfThen { condition, body } => {
                format!("if {} ; then {} ; fi", condition.render(), body.render())
            }
        }
    }
}

fn join(parts: &[Script], sep: &str) -> String {
    parts
        .iter()
        .map(Script::render)
        .collect::<Vec<_>>()
        .join(sep)
}
