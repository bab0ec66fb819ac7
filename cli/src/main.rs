use std::path::PathBuf;

use clap::{Parser, Subcommand};
use garden_session::config::DEFAULT_API_URL;
use garden_session::token;
use garden_session::{
    ApiRequest, AuthError, ConfigError, ErrorCode, Notice, SessionClient, SessionConfig, SignupRequest,
};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{message} [{code}]")]
    Auth { code: &'static str, message: String },
    #[error("no credentials file location; pass --credentials or set GARDEN_CREDENTIALS_PATH")]
    NoCredentialsPath,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("server returned HTTP {status}")]
    Status { status: u16 },
}

impl From<AuthError> for CliError {
    fn from(err: AuthError) -> Self {
        Self::Auth { code: err.error_code(), message: err.user_message() }
    }
}

#[derive(Parser, Debug)]
#[command(name = "garden", about = "GARDEN session and API CLI")]
struct Cli {
    #[arg(long, env = "GARDEN_API_URL", default_value = DEFAULT_API_URL)]
    base_url: String,

    /// Credential file; defaults to the user config directory.
    #[arg(long, env = "GARDEN_CREDENTIALS_PATH")]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange email and password for a token pair.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "GARDEN_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored tokens.
    Logout,
    /// Show the current user, refreshing the session if needed.
    Whoami,
    /// Force a token refresh.
    Refresh,
    /// Show local session state without calling the backend.
    Status,
    /// Create an account.
    Signup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "GARDEN_PASSWORD", hide_env_values = true)]
        password: String,
        /// Defaults to --password.
        #[arg(long)]
        re_password: Option<String>,
    },
    /// Confirm an account from its activation link.
    Activate { uid: String, token: String },
    /// Authenticated request through the gateway.
    Api {
        method: String,
        path: String,
        #[arg(long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: .env not loaded: {e}");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = build_client(&cli)?;

    match cli.command {
        Command::Login { email, password } => run_login(&client, &email, &password).await,
        Command::Logout => run_logout(&client),
        Command::Whoami => run_whoami(&client).await,
        Command::Refresh => run_refresh(&client).await,
        Command::Status => run_status(&client),
        Command::Signup { name, email, password, re_password } => {
            let re_password = re_password.unwrap_or_else(|| password.clone());
            let signup = SignupRequest { name, email, password, re_password };
            let account = client.register(&signup).await?;
            print_json(&serde_json::to_value(account)?)
        }
        Command::Activate { uid, token } => {
            client.activate(&uid, &token).await?;
            println!("activated");
            Ok(())
        }
        Command::Api { method, path, data } => run_api(&client, &method, &path, data.as_deref()).await,
    }
}

fn build_client(cli: &Cli) -> Result<SessionClient, CliError> {
    let credentials = match &cli.credentials {
        Some(path) => path.clone(),
        None => dirs::config_dir()
            .map(|dir| dir.join("garden").join("credentials.json"))
            .ok_or(CliError::NoCredentialsPath)?,
    };

    let mut config = SessionConfig::from_env()?;
    config.api_url = SessionConfig::new(&cli.base_url).api_url;
    config.credentials_path = Some(credentials);
    tracing::debug!(api_url = %config.api_url, "session config loaded");

    Ok(SessionClient::from_config(config)?)
}

async fn run_login(client: &SessionClient, email: &str, password: &str) -> Result<(), CliError> {
    let mut notices = client.notices();
    let user = client.login(email, password).await?;
    drain_notices(&mut notices);
    match user {
        Some(user) => print_json(&serde_json::to_value(user)?),
        None => {
            println!("logged in (user profile unavailable)");
            Ok(())
        }
    }
}

fn run_logout(client: &SessionClient) -> Result<(), CliError> {
    let mut notices = client.notices();
    client.logout()?;
    drain_notices(&mut notices);
    Ok(())
}

async fn run_whoami(client: &SessionClient) -> Result<(), CliError> {
    let Some(user) = client.restore().await? else {
        return Err(CliError::NotLoggedIn);
    };
    print_json(&serde_json::to_value(user)?)
}

async fn run_refresh(client: &SessionClient) -> Result<(), CliError> {
    let access = client.refresh().await?;
    let expires_at = token::expires_at(&access);
    print_json(&json!({ "refreshed": true, "access_expires_at": expires_at }))
}

fn run_status(client: &SessionClient) -> Result<(), CliError> {
    let session = client.session().snapshot();
    let expires_at = session.access_token.as_deref().and_then(token::expires_at);
    let expired = session
        .access_token
        .as_deref()
        .is_some_and(|t| token::is_expired(t, token::now_secs(), client.config().expiry_skew_secs));

    print_json(&json!({
        "api_url": client.config().api_url,
        "phase": format!("{:?}", session.phase()),
        "has_access_token": session.access_token.is_some(),
        "has_refresh_token": session.refresh_token.is_some(),
        "access_expires_at": expires_at,
        "access_expired": expired,
    }))
}

async fn run_api(client: &SessionClient, method: &str, path: &str, data: Option<&str>) -> Result<(), CliError> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| CliError::InvalidMethod(method.to_owned()))?;
    let mut request = ApiRequest::new(method, path);
    if let Some(data) = data {
        let body = serde_json::from_str::<Value>(data)?;
        request = request.json(&body)?;
    }

    let response = client.send(request).await?;
    let status = response.status().as_u16();
    match response.json::<Value>() {
        Ok(body) => print_json(&body)?,
        Err(_) if response.body().is_empty() => {}
        Err(_) => println!("{}", response.text()),
    }

    if response.is_success() {
        Ok(())
    } else {
        Err(CliError::Status { status })
    }
}

fn drain_notices(notices: &mut tokio::sync::broadcast::Receiver<Notice>) {
    loop {
        match notices.try_recv() {
            Ok(notice) => eprintln!("{}", notice.message()),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
