//! CLI argument definitions for agentcred
//!
//! stdout carries command output only (JSON with `--json`, and always for
//! `sign`); diagnostics and logs go to stderr.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::signer::WrapperTag;
use crate::types::{DEFAULT_AGENT, DEFAULT_CONTENT_TYPE};

/// agentcred - human accountability for AI agents
///
/// Bind an Ed25519 key to your GitHub account, sign what your agents
/// produce, and let anyone verify who is accountable for it.
#[derive(Parser, Debug)]
#[command(name = "agentcred")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Local state directory (keys live in <home>/keys)
    #[arg(long, global = true, env = "AGENTCRED_HOME", value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Key directory URL
    #[arg(long, global = true, env = "AGENTCRED_API_URL", value_name = "URL")]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an identity bound to your GitHub account
    #[command(after_help = "EXAMPLES:
    # Authenticate through the browser (OAuth device flow)
    agentcred init

    # Use a personal access token
    agentcred init --token ghp_xxx

    # Machine readable output
    GITHUB_TOKEN=ghp_xxx agentcred init --json
")]
    Init(InitArgs),

    /// Sign content as one of your agents
    #[command(after_help = "EXAMPLES:
    # Sign a file
    agentcred sign report.md --agent research-bot

    # Sign stdin
    echo 'Hello, world!' | agentcred sign --agent bot

    # Embed the credential in HTML
    agentcred sign post.html --html --tag div --class signed
")]
    Sign(SignArgs),

    /// Verify a signed envelope
    #[command(after_help = "EXAMPLES:
    # Verify against the key directory
    agentcred verify envelope.json

    # Verify stdin and get JSON
    agentcred sign --agent bot < note.txt | agentcred verify --json

    # Verify without network access
    agentcred verify envelope.json --offline --key alice.jwk
")]
    Verify(VerifyArgs),

    /// Show the current identity
    Whoami(WhoamiArgs),

    /// Run the key directory service
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// GitHub personal access token (skips the OAuth device flow)
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output result as JSON
    #[arg(long)]
    pub json: bool,

    /// Refuse to replace an existing identity
    #[arg(long)]
    pub no_clobber: bool,
}

#[derive(Args, Debug)]
pub struct SignArgs {
    /// File to sign (reads stdin when omitted)
    pub file: Option<PathBuf>,

    /// Name of the agent producing the content
    #[arg(long, short = 'a', default_value = DEFAULT_AGENT)]
    pub agent: String,

    /// Media type recorded in the signed claims
    #[arg(long, default_value = DEFAULT_CONTENT_TYPE)]
    pub content_type: String,

    /// Emit an HTML element instead of a JSON envelope
    #[arg(long)]
    pub html: bool,

    /// Wrapper element for --html (span, div or p)
    #[arg(long, default_value = "span", requires = "html")]
    pub tag: WrapperTag,

    /// CSS class for the --html wrapper
    #[arg(long = "class", value_name = "CLASS", requires = "html")]
    pub class_name: Option<String>,

    /// Accepted for symmetry with other commands; output is always JSON
    #[arg(long, hide = true)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Envelope file (reads stdin when omitted)
    pub file: Option<PathBuf>,

    /// Output result as JSON
    #[arg(long)]
    pub json: bool,

    /// Verify against a local key instead of the key directory
    #[arg(long, requires = "key")]
    pub offline: bool,

    /// Public (or private) JWK file used with --offline
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WhoamiArgs {
    /// Output result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory for the key snapshot
    #[arg(long, env = "DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}
