//! Provisioning invoker - runs the external certificate command for a domain
//!
//! The command is invoked as `<command> <domain>` and is expected to leave
//! `privkey.pem`, `cert.pem` and `chain.pem` in the domain's certificate
//! directory. Exit status and captured stderr decide success; whether the
//! bundle is actually usable is always re-checked by the certificate store.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;

/// Environment variable carrying the per-domain bundle directory to the command.
pub const CERT_DIR_ENV: &str = "DSTORE_CERT_DIR";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to start provisioning command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provisioning failed for {domain}: {detail}")]
    Failed { domain: String, detail: String },
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Obtain a bundle for `domain`, writing it into `cert_dir`.
    async fn provision(&self, domain: &str, cert_dir: PathBuf) -> Result<(), ProvisionError>;
}

/// Runs an external executable with the domain as its final argument.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: String,
    /// Arguments placed before the domain
    args: Vec<String>,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, domain: &str, cert_dir: PathBuf) -> Result<(), ProvisionError> {
        tracing::info!(domain = %domain, command = %self.command, "Running certificate provisioning");

        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(domain)
            .env(CERT_DIR_ENV, &cert_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(ProvisionError::Failed {
            domain: domain.to_string(),
            detail: format_process_failure(
                "certificate command failed",
                output.status,
                &output.stdout,
                &output.stderr,
            ),
        })
    }
}

fn format_process_failure(
    context: &str,
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
) -> String {
    let status_text = match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };

    let stderr_text = String::from_utf8_lossy(stderr).trim().to_string();
    let detail = if stderr_text.is_empty() {
        String::from_utf8_lossy(stdout).trim().to_string()
    } else {
        stderr_text
    };

    if detail.is_empty() {
        return format!("{context} ({status_text})");
    }

    let preview: String = detail.chars().take(400).collect();
    if detail.chars().count() > 400 {
        format!("{context} ({status_text}): {preview}...")
    } else {
        format!("{context} ({status_text}): {preview}")
    }
}
