use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use axum::http::{header, Method};
use clap::Parser;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentcred::api;
use agentcred::cli::{Cli, Commands, InitArgs, ServeArgs, SignArgs, VerifyArgs, WhoamiArgs};
use agentcred::codec;
use agentcred::config::Config;
use agentcred::directory::{HttpKeyDirectory, PinnedKey, TrustAnchor};
use agentcred::error::{exit_code, CredError};
use agentcred::github::{DeviceFlow, GitHubClient};
use agentcred::identity::{FileKeyStore, IdentityManager, InitPolicy};
use agentcred::signer::{self, HtmlOptions, SignOptions};
use agentcred::state::AppState;
use agentcred::types::VerificationResult;
use agentcred::verifier::Verifier;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Serve(_)));

    let mut config = Config::from_env();
    if let Some(home) = cli.home {
        config.home = home;
    }
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }

    let result = match cli.command {
        Commands::Init(args) => init(&config, args).await,
        Commands::Sign(args) => sign(&config, args),
        Commands::Verify(args) => verify(&config, args).await,
        Commands::Whoami(args) => whoami(&config, args),
        Commands::Serve(args) => serve(config, args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("✗ {}", e);
            let code = e
                .downcast_ref::<CredError>()
                .map(CredError::exit_code)
                .unwrap_or(exit_code::FAILURE);
            ExitCode::from(code as u8)
        }
    }
}

fn init_tracing(serving: bool) {
    let default_filter = if serving {
        "agentcred=info,tower_http=debug"
    } else {
        "agentcred=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_input(file: Option<&Path>) -> Result<String, CredError> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| CredError::InvalidInput(format!("cannot read {}: {}", path.display(), e))),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .map_err(|e| CredError::InvalidInput(format!("cannot read stdin: {}", e)))?;
            Ok(input)
        }
    }
}

fn identity_manager(
    config: &Config,
) -> Result<IdentityManager<FileKeyStore, GitHubClient, HttpKeyDirectory>, CredError> {
    Ok(IdentityManager::new(
        FileKeyStore::new(config.key_dir()),
        GitHubClient::new(&config.github_api_url, config.resolve_timeout)?,
        HttpKeyDirectory::new(&config.api_url, config.resolve_timeout, config.resolve_retries)?,
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============ Commands ============

async fn init(config: &Config, args: InitArgs) -> anyhow::Result<ExitCode> {
    let token = match args.token.filter(|t| !t.trim().is_empty()) {
        Some(token) => token,
        None => {
            let flow = DeviceFlow::new(&config.github_login_url, &config.client_id)?;
            let code = flow.request_code().await?;
            eprintln!("! First, copy your one-time code: {}", code.user_code);
            eprintln!("Then open {} in your browser and paste it.", code.verification_uri);
            flow.poll_token(&code).await?
        }
    };

    let policy = if args.no_clobber {
        InitPolicy::KeepExisting
    } else {
        InitPolicy::Replace
    };
    let identity = identity_manager(config)?.init(&token, policy).await?;

    if args.json {
        print_json(&identity.summary())?;
    } else {
        println!("✓ Identity created for @{}", identity.username());
        println!("  Fingerprint: {}", identity.fingerprint());
    }
    Ok(ExitCode::SUCCESS)
}

fn sign(config: &Config, args: SignArgs) -> anyhow::Result<ExitCode> {
    let identity = identity_manager(config)?.load()?;
    let content = read_input(args.file.as_deref())?;
    let options = SignOptions {
        agent: args.agent,
        content_type: args.content_type,
    };

    if args.html {
        let html = signer::sign_html(
            &content,
            &identity,
            &HtmlOptions {
                sign: options,
                tag: args.tag,
                class_name: args.class_name,
            },
        )?;
        println!("{}", html);
    } else {
        let envelope = signer::sign(&content, &identity, &options)?;
        println!("{}", codec::encode(&envelope));
    }
    Ok(ExitCode::SUCCESS)
}

async fn verify(config: &Config, args: VerifyArgs) -> anyhow::Result<ExitCode> {
    let input = read_input(args.file.as_deref())?;

    let result = match (args.offline, args.key.as_deref()) {
        (true, Some(key_path)) => {
            let jwk = std::fs::read_to_string(key_path).map_err(|e| {
                CredError::InvalidInput(format!("cannot read {}: {}", key_path.display(), e))
            })?;
            run_verifier(config, PinnedKey::from_jwk_json(&jwk)?, &input).await
        }
        (true, None) => {
            return Err(CredError::InvalidInput("--key <path> is required with --offline".into()).into())
        }
        (false, _) => {
            let directory = HttpKeyDirectory::new(
                &config.api_url,
                config.resolve_timeout,
                config.resolve_retries,
            )?;
            run_verifier(config, directory, &input).await
        }
    };

    if args.json {
        print_json(&result)?;
    } else if result.verified {
        let who = result.github.as_ref().map(|g| g.username.as_str()).unwrap_or_default();
        println!(
            "✓ Verified: @{} ({}) at {}",
            who,
            result.agent.as_deref().unwrap_or_default(),
            result.signed_at.map(|t| t.to_rfc3339()).unwrap_or_default()
        );
    } else {
        eprintln!(
            "✗ Verification failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(if result.verified {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(exit_code::VERIFICATION_FAILED as u8)
    })
}

async fn run_verifier<A: TrustAnchor>(config: &Config, anchor: A, input: &str) -> VerificationResult {
    // Deadline covers every resolve attempt plus backoff
    let deadline = config.resolve_timeout * config.resolve_retries.max(1) + config.resolve_timeout;
    Verifier::new(anchor)
        .with_resolve_timeout(deadline)
        .with_max_clock_skew(config.max_clock_skew)
        .verify_json(input)
        .await
}

fn whoami(config: &Config, args: WhoamiArgs) -> anyhow::Result<ExitCode> {
    let summary = identity_manager(config)?.whoami()?;
    if args.json {
        print_json(&summary)?;
    } else {
        println!(
            "You are @{} (fingerprint: {})",
            summary.username, summary.fingerprint
        );
    }
    Ok(ExitCode::SUCCESS)
}

// ============ Key Directory Service ============

async fn serve(mut config: Config, args: ServeArgs) -> anyhow::Result<ExitCode> {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!("Starting AgentCred key directory v{}", config.version);
    tracing::info!("Host: {}:{}", config.host, config.port);
    tracing::info!("Data dir: {:?}", config.data_dir);

    let provider = Arc::new(GitHubClient::new(&config.github_api_url, config.resolve_timeout)?);
    let state = AppState::new(config.clone(), provider);

    if let Err(e) = state.load_from_disk().await {
        tracing::warn!("Failed to load state from disk: {}", e);
    }

    let persister = state.spawn_persister();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    let app = api::create_router(Arc::clone(&state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let state_for_shutdown = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state_for_shutdown))
        .await?;

    tracing::info!("Waiting for final persistence...");
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), persister).await;

    tracing::info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    state.signal_shutdown();
}
