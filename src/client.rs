//! Typed credential client
//!
//! [`CredentialClient`] is the surface agents program against. Two
//! transports implement it: [`LocalClient`] runs everything in process and
//! [`ProcessClient`] drives the `agentcred` binary over its command
//! contract, mapping exit codes back to [`CredError`] variants.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::codec;
use crate::directory::{KeyRegistry, TrustAnchor};
use crate::error::{exit_code, CredError, CredResult};
use crate::github::IdentityProvider;
use crate::identity::{IdentityManager, IdentityStore, InitPolicy};
use crate::signer::{self, SignOptions};
use crate::types::{Envelope, IdentitySummary, VerificationResult};
use crate::verifier::Verifier;

pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait CredentialClient: Send + Sync {
    /// Bind a new identity to the account behind `token`
    async fn init(&self, token: &str) -> CredResult<IdentitySummary>;

    /// Sign `content` as `agent`
    async fn sign(&self, content: &str, agent: &str) -> CredResult<Envelope>;

    /// Verify an envelope. Verification failures are reported in the result.
    async fn verify(&self, envelope: &Envelope) -> CredResult<VerificationResult>;

    async fn whoami(&self) -> CredResult<IdentitySummary>;
}

// ============ In-Process Transport ============

pub struct LocalClient<S, P, R, A> {
    manager: IdentityManager<S, P, R>,
    verifier: Verifier<A>,
    policy: InitPolicy,
}

impl<S, P, R, A> LocalClient<S, P, R, A>
where
    S: IdentityStore,
    P: IdentityProvider,
    R: KeyRegistry,
    A: TrustAnchor,
{
    pub fn new(manager: IdentityManager<S, P, R>, verifier: Verifier<A>) -> Self {
        Self {
            manager,
            verifier,
            policy: InitPolicy::default(),
        }
    }

    pub fn with_init_policy(mut self, policy: InitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn manager(&self) -> &IdentityManager<S, P, R> {
        &self.manager
    }
}

#[async_trait]
impl<S, P, R, A> CredentialClient for LocalClient<S, P, R, A>
where
    S: IdentityStore,
    P: IdentityProvider,
    R: KeyRegistry,
    A: TrustAnchor,
{
    async fn init(&self, token: &str) -> CredResult<IdentitySummary> {
        Ok(self.manager.init(token, self.policy).await?.summary())
    }

    async fn sign(&self, content: &str, agent: &str) -> CredResult<Envelope> {
        let identity = self.manager.load()?;
        signer::sign(content, &identity, &SignOptions::agent(agent))
    }

    async fn verify(&self, envelope: &Envelope) -> CredResult<VerificationResult> {
        Ok(self.verifier.verify(envelope).await)
    }

    async fn whoami(&self) -> CredResult<IdentitySummary> {
        self.manager.whoami()
    }
}

// ============ Subprocess Transport ============

/// Drives the `agentcred` binary
#[derive(Debug, Clone)]
pub struct ProcessClient {
    program: PathBuf,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

struct Output {
    code: i32,
    stdout: String,
    stderr: String,
}

impl Default for ProcessClient {
    fn default() -> Self {
        Self::new("agentcred")
    }
}

impl ProcessClient {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
            timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    /// Set an environment variable for every invocation
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        args: &[&str],
        stdin: Option<&str>,
        extra_env: &[(&str, &str)],
    ) -> CredResult<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        for (k, v) in extra_env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            CredError::Process {
                code: exit_code::FAILURE,
                message: format!("cannot run {}: {}", self.program.display(), e),
            }
        })?;

        // Feed stdin while draining the output, all under one deadline
        let pipe = child.stdin.take();
        let write = async {
            let (Some(input), Some(mut pipe)) = (stdin, pipe) else {
                return Ok::<(), CredError>(());
            };
            match pipe.write_all(input.as_bytes()).await {
                Ok(()) => Ok(()),
                // The child may exit before reading, e.g. when no identity exists
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(CredError::Process {
                    code: exit_code::FAILURE,
                    message: format!("cannot write to {}: {}", self.program.display(), e),
                }),
            }
        };
        let exchange = async {
            let (written, output) = tokio::join!(write, child.wait_with_output());
            written?;
            output.map_err(|e| CredError::Process {
                code: exit_code::FAILURE,
                message: e.to_string(),
            })
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                CredError::Timeout(format!(
                    "agentcred {} did not finish within {:?}",
                    args.first().copied().unwrap_or_default(),
                    self.timeout
                ))
            })??;

        let out = Output {
            code: output.status.code().unwrap_or(exit_code::FAILURE),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!("agentcred {:?} exited with {}", args, out.code);
        Ok(out)
    }

    fn parse<T: DeserializeOwned>(out: &Output) -> CredResult<T> {
        if out.code != 0 {
            return Err(CredError::from_exit(out.code, &out.stderr));
        }
        serde_json::from_str(out.stdout.trim())
            .map_err(|e| CredError::Decode(format!("unexpected agentcred output: {}", e)))
    }
}

#[async_trait]
impl CredentialClient for ProcessClient {
    async fn init(&self, token: &str) -> CredResult<IdentitySummary> {
        // Token goes through the environment, not argv
        let out = self
            .run(&["init", "--json"], None, &[("GITHUB_TOKEN", token)])
            .await?;
        Self::parse(&out)
    }

    async fn sign(&self, content: &str, agent: &str) -> CredResult<Envelope> {
        let out = self
            .run(&["sign", "--agent", agent], Some(content), &[])
            .await?;
        if out.code != 0 {
            return Err(CredError::from_exit(out.code, &out.stderr));
        }
        codec::decode(out.stdout.trim()).map_err(CredError::from)
    }

    async fn verify(&self, envelope: &Envelope) -> CredResult<VerificationResult> {
        let input = codec::encode(envelope);
        let out = self.run(&["verify", "--json"], Some(&input), &[]).await?;

        // A failed verification still prints its result
        if out.code == exit_code::VERIFICATION_FAILED {
            if let Ok(result) = serde_json::from_str::<VerificationResult>(out.stdout.trim()) {
                return Ok(result);
            }
        }
        Self::parse(&out)
    }

    async fn whoami(&self) -> CredResult<IdentitySummary> {
        let out = self.run(&["whoami", "--json"], None, &[]).await?;
        Self::parse(&out)
    }
}
