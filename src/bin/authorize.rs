#![forbid(unsafe_code)]

//! One-time OAuth consent for the uploader.
//!
//! Prints the Google consent URL, waits for the browser to come back to a
//! loopback callback, and stores the resulting token file.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use parking_lot::Mutex;
use relaytube_tools::auth::{Authenticator, random_state};
use relaytube_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use relaytube_tools::logging::init_tracing;
use relaytube_tools::security::ensure_not_root;
use serde::Deserialize;
use tokio::{signal, sync::oneshot};
use tracing::{info, warn};

const DEFAULT_CALLBACK_PORT: u16 = 8080;

#[derive(Debug, Parser)]
#[command(name = "authorize", about = "Grant the uploader access to a YouTube channel")]
struct AuthorizeArgs {
    #[arg(long)]
    client_secret: Option<PathBuf>,
    /// Where the token file is written.
    #[arg(long)]
    token: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Loopback port for the consent callback.
    #[arg(long, default_value_t = DEFAULT_CALLBACK_PORT)]
    port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

type CodeSender = oneshot::Sender<Result<String, String>>;

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<String>,
    sender: Arc<Mutex<Option<CodeSender>>>,
}

fn callback_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Redirect target naming the literal bound address, never `localhost`.
fn redirect_uri(addr: SocketAddr) -> String {
    format!("http://{addr}/")
}

/// Accepts the callback only when it carries a code and the state we sent.
fn verify_callback(params: &CallbackParams, expected_state: &str) -> Result<String, String> {
    if let Some(error) = &params.error {
        return Err(format!("consent was refused: {error}"));
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err("state mismatch; ignoring callback".to_string());
    }
    match params.code.as_deref() {
        Some(code) if !code.is_empty() => Ok(code.to_string()),
        _ => Err("callback carried no authorization code".to_string()),
    }
}

async fn oauth_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    let verdict = verify_callback(&params, &state.expected_state);
    let reply = match &verdict {
        Ok(_) => (
            StatusCode::OK,
            "Authorization received. You can close this window.",
        ),
        Err(_) => (StatusCode::BAD_REQUEST, "Authorization failed. See the terminal."),
    };
    if let Some(sender) = state.sender.lock().take() {
        let _ = sender.send(verdict);
    }
    reply
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AuthorizeArgs::parse();
    init_tracing("authorize");
    ensure_not_root("authorize")?;

    let paths = resolve_runtime_paths(RuntimeOverrides {
        client_secret_path: args.client_secret.clone(),
        token_path: args.token.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let mut auth = Authenticator::load(&paths.client_secret_path, &paths.token_path)?;

    let addr = callback_addr(args.port);
    let redirect_uri = redirect_uri(addr);
    let expected_state = random_state();
    let consent_url = auth
        .secrets()
        .authorization_url(&redirect_uri, &expected_state)?;

    let (code_tx, code_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = Router::new()
        .route("/", get(oauth_callback))
        .with_state(CallbackState {
            expected_state: Arc::new(expected_state),
            sender: Arc::new(Mutex::new(Some(code_tx))),
        });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    println!("Open this URL in a browser to authorize the uploader:\n\n{consent_url}\n");
    info!(%addr, "waiting for the consent callback");

    let verdict = tokio::select! {
        received = code_rx => received.map_err(|_| anyhow!("callback server stopped early"))?,
        _ = signal::ctrl_c() => bail!("interrupted before authorization completed"),
    };
    let _ = stop_tx.send(());
    if let Err(err) = server.await? {
        warn!("callback server error: {err}");
    }

    let code = verdict.map_err(|reason| anyhow!(reason))?;
    let token_path = paths.token_path.clone();
    tokio::task::spawn_blocking(move || auth.exchange_code(&code, &redirect_uri)).await??;
    info!(token = %token_path.display(), "token saved");
    Ok(())
}
