//! Remote shell transport and configuration.

use std::process::Stdio;

use serde::{Deserialize, Serialize};

use crate::command::{Script, ShellCommand, quote};

/// How scripts reach the source host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// `ssh <options> -- user@host <interpreter> '<script>'`
    #[default]
    Ssh,
    /// Runs the interpreter locally (loopback operation).
    Local,
}

/// How the source host pushes a stream to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkSend {
    /// `nc [args] <host> <port>`
    Netcat {
        #[serde(default = "default_netcat_program")]
        program: String,
        #[serde(default = "default_netcat_args")]
        args: Vec<String>,
    },
    /// `cat > /dev/tcp/<host>/<port>` (bash only).
    DevTcp,
}

fn default_netcat_program() -> String {
    "nc".into()
}

fn default_netcat_args() -> Vec<String> {
    // Quit once stdin reaches EOF so the broker sees end of stream.
    vec!["-q".into(), "0".into()]
}

impl Default for NetworkSend {
    fn default() -> Self {
        Self::Netcat {
            program: default_netcat_program(),
            args: default_netcat_args(),
        }
    }
}

impl NetworkSend {
    /// Builds the pipeline stage sending stdin to `host:port`.
    pub fn to_command(&self, host: &str, port: u16) -> ShellCommand {
        match self {
            Self::Netcat { program, args } => ShellCommand::new(program.clone())
                .args(args.iter().cloned())
                .arg(host)
                .arg(port.to_string()),
            Self::DevTcp => ShellCommand::new("cat").stdout_to(format!("/dev/tcp/{host}/{port}")),
        }
    }
}

/// Remote side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub transport: Transport,

    /// ssh client binary.
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Options passed to ssh before the destination.
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,

    /// Interpreter and flags; the script is appended as the last argument.
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,

    #[serde(default)]
    pub network_send: NetworkSend,

    /// Directory on the source host holding the session pipe.
    #[serde(default = "default_fifo_dir")]
    pub fifo_dir: String,
}

fn default_ssh_program() -> String {
    "ssh".into()
}

fn default_ssh_options() -> Vec<String> {
    vec!["-o".into(), "BatchMode=yes".into()]
}

fn default_interpreter() -> Vec<String> {
    vec!["bash".into(), "-o".into(), "pipefail".into(), "-c".into()]
}

fn default_fifo_dir() -> String {
    "/tmp".into()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            ssh_program: default_ssh_program(),
            ssh_options: default_ssh_options(),
            interpreter: default_interpreter(),
            network_send: NetworkSend::default(),
            fifo_dir: default_fifo_dir(),
        }
    }
}

/// Executes scripts on one source host.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    transport: Transport,
    ssh_program: String,
    ssh_options: Vec<String>,
    interpreter: Vec<String>,
    destination: String,
}

impl RemoteShell {
    /// Creates a shell for `user@host` (user may be empty).
    pub fn new(config: &RemoteConfig, user: &str, host: &str) -> Self {
        let destination = if user.is_empty() {
            host.to_string()
        } else {
            format!("{user}@{host}")
        };
        Self {
            transport: config.transport,
            ssh_program: config.ssh_program.clone(),
            ssh_options: config.ssh_options.clone(),
            interpreter: config.interpreter.clone(),
            destination,
        }
    }

    /// `user@host` this shell targets.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Program that will be launched locally.
    pub fn program(&self) -> &str {
        match self.transport {
            Transport::Ssh => &self.ssh_program,
            Transport::Local => self.interpreter.first().map(String::as_str).unwrap_or("sh"),
        }
    }

    /// Builds the local process running `script` on the source host.
    ///
    /// Standard input is closed; output streams are piped.
    pub fn command(&self, script: &Script) -> std::process::Command {
        let rendered = script.render();
        let mut cmd = match self.transport {
            Transport::Ssh => {
                // ssh joins its arguments into one string for the remote login
                // shell, so the interpreter invocation is quoted here.
                let remote = self
                    .interpreter
                    .iter()
                    .map(|w| quote(w).into_owned())
                    .chain(std::iter::once(quote(&rendered).into_owned()))
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut cmd = std::process::Command::new(&self.ssh_program);
                // Nothing after `--` is parsed as an ssh option.
                cmd.args(&self.ssh_options)
                    .arg("--")
                    .arg(&self.destination)
                    .arg(remote);
                cmd
            }
            Transport::Local => {
                let mut cmd = std::process::Command::new(self.program());
                cmd.args(self.interpreter.iter().skip(1)).arg(&rendered);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Human-readable description of a script run through this shell.
    pub fn describe(&self, script: &Script) -> String {
        format!("{}: {}", self.destination, script.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn default_config() {
        let config = RemoteConfig::default();
        assert_eq!(config.transport, Transport::Ssh);
        assert_eq!(config.interpreter, ["bash", "-o", "pipefail", "-c"]);
        assert_eq!(config.fifo_dir, "/tmp");
        assert!(matches!(config.network_send, NetworkSend::Netcat { .. }));
    }

    #[test]
    fn netcat_send_command() {
        let cmd = NetworkSend::default().to_command("broker.example", 50123);
        assert_eq!(cmd.render(), "nc -q 0 broker.example 50123");
    }

    #[test]
    fn dev_tcp_send_command() {
        let cmd = NetworkSend::DevTcp.to_command("127.0.0.1", 50123);
        assert_eq!(cmd.render(), "cat > /dev/tcp/127.0.0.1/50123");
    }

    #[test]
    fn ssh_command_quotes_script() {
        let shell = RemoteShell::new(&RemoteConfig::default(), "obs", "h1");
        let script: Script = ShellCommand::new("mkfifo").arg("/tmp/a b").into();
        let cmd = shell.command(&script);

        assert_eq!(cmd.get_program(), "ssh");
        let args = args_of(&cmd);
        assert_eq!(args[..4], ["-o", "BatchMode=yes", "--", "obs@h1"]);
        assert_eq!(args[4], r#"bash -o pipefail -c 'mkfifo '\''/tmp/a b'\'''"#);
    }

    #[test]
    fn ssh_destination_cannot_be_read_as_an_option() {
        let shell = RemoteShell::new(&RemoteConfig::default(), "", "-oProxyCommand=touch /tmp/x");
        let cmd = shell.command(&Script::from(ShellCommand::new("true")));

        let args = args_of(&cmd);
        let end_of_options = args.iter().position(|a| a == "--").unwrap();
        let hostile = args
            .iter()
            .position(|a| a.starts_with("-oProxyCommand"))
            .unwrap();
        assert_eq!(hostile, end_of_options + 1, "{args:?}");
        assert_eq!(args.len(), end_of_options + 3);
    }

    #[test]
    fn local_command_passes_script_verbatim() {
        let config = RemoteConfig {
            transport: Transport::Local,
            ..RemoteConfig::default()
        };
        let shell = RemoteShell::new(&config, "", "localhost");
        let script: Script = ShellCommand::new("mkfifo").arg("/tmp/a b").into();
        let cmd = shell.command(&script);

        assert_eq!(cmd.get_program(), "bash");
        assert_eq!(args_of(&cmd), ["-o", "pipefail", "-c", "mkfifo '/tmp/a b'"]);
        assert_eq!(shell.destination(), "localhost");
    }
}
