use std::fmt;

use serde::{Deserialize, Serialize};

use ltacp_checksum::ChecksumPair;

use crate::error::TransferError;

/// One logical item to move: a path on a source host and its storage URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_host: String,
    #[serde(default)]
    pub source_user: String,
    pub source_path: String,
    pub destination_url: String,
}

impl TransferRequest {
    pub fn new(
        source_host: impl Into<String>,
        source_user: impl Into<String>,
        source_path: impl Into<String>,
        destination_url: impl Into<String>,
    ) -> Self {
        Self {
            source_host: source_host.into(),
            source_user: source_user.into(),
            source_path: source_path.into(),
            destination_url: destination_url.into(),
        }
    }

    /// Parses `[user@]host:/path` and pairs it with a destination URL.
    pub fn from_source_arg(
        arg: &str,
        destination_url: impl Into<String>,
    ) -> Result<Self, TransferError> {
        let (login, path) = arg.split_once(':').ok_or_else(|| {
            TransferError::InvalidRequest(format!("expected host:path, got {arg:?}"))
        })?;
        let (user, host) = match login.rsplit_once('@') {
            Some((user, host)) => (user, host),
            None => ("", login),
        };
        let request = Self::new(host, user, path, destination_url);
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.source_host.is_empty() {
            return Err(TransferError::InvalidRequest("empty source host".into()));
        }
        check_login_part("source host", &self.source_host)?;
        check_login_part("source user", &self.source_user)?;
        if self.source_path.is_empty() {
            return Err(TransferError::InvalidRequest("empty source path".into()));
        }
        if self.destination_url.is_empty() {
            return Err(TransferError::InvalidRequest("empty destination URL".into()));
        }
        Ok(())
    }

    /// `user@host:path` as given on the command line.
    pub fn source(&self) -> String {
        if self.source_user.is_empty() {
            format!("{}:{}", self.source_host, self.source_path)
        } else {
            format!("{}@{}:{}", self.source_user, self.source_host, self.source_path)
        }
    }
}

/// Hosts and users end up on the ssh command line, so they must not look like
/// an option or split into several words.
fn check_login_part(what: &str, value: &str) -> Result<(), TransferError> {
    if value.starts_with('-') {
        return Err(TransferError::InvalidRequest(format!(
            "{what} {value:?} starts with '-'"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TransferError::InvalidRequest(format!(
            "{what} {value:?} contains whitespace"
        )));
    }
    Ok(())
}

/// Checksums of a verified transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedChecksums {
    pub md5: ChecksumPair,
    pub adler32: ChecksumPair,
    /// Bytes relayed from the source host.
    pub bytes: u64,
}

/// Coordinator state for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    PortsAllocated,
    RemoteAgentLaunched,
    Streaming,
    Verifying,
    Succeeded,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Forward steps follow the pipeline order; any live state may fail.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Idle, PortsAllocated)
            | (PortsAllocated, RemoteAgentLaunched)
            | (RemoteAgentLaunched, Streaming)
            | (Streaming, Verifying)
            | (Verifying, Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::PortsAllocated => "ports_allocated",
            Self::RemoteAgentLaunched => "remote_agent_launched",
            Self::Streaming => "streaming",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_source_arg() {
        let req = TransferRequest::from_source_arg("lofarsys@node12:/data/L1234", "srm://h/x").unwrap();
        assert_eq!(req.source_user, "lofarsys");
        assert_eq!(req.source_host, "node12");
        assert_eq!(req.source_path, "/data/L1234");
        assert_eq!(req.source(), "lofarsys@node12:/data/L1234");
    }

    #[test]
    fn parse_source_arg_without_user() {
        let req = TransferRequest::from_source_arg("node12:/data/x", "srm://h/x").unwrap();
        assert_eq!(req.source_user, "");
        assert_eq!(req.source(), "node12:/data/x");
    }

    #[test]
    fn parse_source_arg_rejects_missing_parts() {
        assert!(TransferRequest::from_source_arg("/data/x", "srm://h/x").is_err());
        assert!(TransferRequest::from_source_arg("node12:", "srm://h/x").is_err());
        assert!(TransferRequest::from_source_arg(":/data/x", "srm://h/x").is_err());
        assert!(TransferRequest::from_source_arg("node12:/x", "").is_err());
    }

    #[test]
    fn rejects_host_that_looks_like_an_option() {
        let err = TransferRequest::from_source_arg("-oProxyCommand=sh:/data/x", "srm://h/x")
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)), "{err}");

        let req = TransferRequest::new("-oProxyCommand=touch /tmp/x", "", "/data/x", "srm://h/x");
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_user_that_looks_like_an_option_or_has_spaces() {
        assert!(TransferRequest::from_source_arg("-lroot@node12:/data/x", "srm://h/x").is_err());
        assert!(TransferRequest::new("node12", "obs user", "/x", "srm://h/x").validate().is_err());
        assert!(TransferRequest::new("node 12", "obs", "/x", "srm://h/x").validate().is_err());
        assert!(TransferRequest::new("node12", "obs-user", "/x", "srm://h/x").validate().is_ok());
    }

    #[test]
    fn forward_transitions() {
        use TransferState::*;
        let path = [Idle, PortsAllocated, RemoteAgentLaunched, Streaming, Verifying, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn illegal_transitions() {
        use TransferState::*;
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Succeeded));
        assert!(!Verifying.can_transition_to(Idle));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Failed));
        assert!(Idle.can_transition_to(Failed));
    }
}
