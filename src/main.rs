use anyhow::{Context, Result, bail};
use clap::Parser;
use log::debug;
use reqauth::auth::HttpTokenProvider;
use reqauth::config::ClientConfig;
use reqauth::http::{
    ApiClient, JSON_CONTENT_TYPE, MultipartPart, Payload, ReqwestTransport, RequestSpec,
};
use reqauth::session::UserSession;
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// reqauth - authenticated HTTP requests with retry and token refresh
///
/// Sends requests with a bearer token, retries transient failures and
/// refreshes the access token when the server answers 401/403.
///
/// Examples:
///   reqauth --base-url http://localhost:8080 login -u me@example.com -p secret
///   reqauth --access-token TOKEN request GET /api/v1/items -q page=2
#[derive(Parser, Debug)]
#[command(author, version = env!("REQAUTH_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to <config dir>/reqauth/config.json)
    #[arg(long, env = "REQAUTH_CONFIG", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Server base URL, e.g. https://api.example.com:8443
    #[arg(long, env = "REQAUTH_BASE_URL", value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Access token sent as a bearer token
    #[arg(long, env = "REQAUTH_ACCESS_TOKEN", value_name = "TOKEN", global = true)]
    access_token: Option<String>,

    /// Refresh token used when the access token is rejected
    #[arg(long, env = "REQAUTH_REFRESH_TOKEN", value_name = "TOKEN", global = true)]
    refresh_token: Option<String>,

    /// Retries after the first attempt
    #[arg(long, value_name = "N", global = true)]
    max_retries: Option<u32>,

    /// Delay between retries in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    retry_delay_ms: Option<u64>,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Add an X-Request-Time header with the current unix time to every attempt
    #[arg(long, global = true)]
    request_time: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a single request
    Request(RequestArgs),

    /// Log in and print the issued tokens
    Login(LoginArgs),
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// HTTP method: GET, POST, PUT, DELETE or PATCH
    #[arg(value_name = "METHOD")]
    method: String,

    /// Request path, e.g. /api/v1/items
    #[arg(value_name = "PATH")]
    path: String,

    /// Extra header as KEY:VALUE (repeatable)
    #[arg(short = 'H', long = "header", value_name = "KEY:VALUE")]
    headers: Vec<String>,

    /// Query parameter as KEY=VALUE (repeatable)
    #[arg(short = 'q', long = "query", value_name = "KEY=VALUE")]
    query: Vec<String>,

    /// JSON request body
    #[arg(long, value_name = "BODY", conflicts_with_all = ["form", "part"])]
    json: Option<String>,

    /// Form field as KEY=VALUE (repeatable)
    #[arg(long, value_name = "KEY=VALUE", conflicts_with = "part")]
    form: Vec<String>,

    /// Multipart part as NAME=VALUE or NAME=@FILE (repeatable)
    #[arg(long, value_name = "NAME=VALUE")]
    part: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct LoginArgs {
    #[arg(short, long)]
    username: String,

    #[arg(short, long, env = "REQAUTH_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let client = build_client(&cli, &config)?;

    match cli.command {
        Commands::Request(args) => run_request(&client, args).await,
        Commands::Login(args) => run_login(&client, &config, args).await,
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => match ClientConfig::default_path().filter(|p| p.exists()) {
            Some(path) => ClientConfig::load(&path)?,
            None => ClientConfig::default(),
        },
    };

    if let Some(base_url) = &cli.base_url {
        config.set_base_url(base_url)?;
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(delay) = cli.retry_delay_ms {
        config.retry.retry_delay_ms = delay;
    }
    if cli.insecure {
        config.verify_tls = false;
    }
    debug!("Effective config: {:?}", config);
    Ok(config)
}

fn build_client(cli: &Cli, config: &ClientConfig) -> Result<ApiClient> {
    let transport = Arc::new(ReqwestTransport::new(config)?);
    let client = ApiClient::builder(config.clone())
        .transport(transport.clone())
        .build()?;

    client.tokens().set_tokens(
        cli.access_token.clone().unwrap_or_default(),
        cli.refresh_token.clone().unwrap_or_default(),
    );
    client.set_token_provider(Arc::new(HttpTokenProvider::from_config(config, transport)?));

    if cli.request_time {
        client.set_request_interceptor(|headers| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            headers.insert("x-request-time", now.into());
        });
    }
    Ok(client)
}

async fn run_request(client: &ApiClient, args: RequestArgs) -> Result<()> {
    let spec = request_spec(args)?;
    let outcome = client.send(spec).await;

    println!("HTTP {}", outcome.status());
    if !outcome.body().is_empty() {
        println!("{}", outcome.body());
    }
    if !outcome.is_success() {
        bail!(
            "Request failed: {}",
            outcome.error_message().unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_login(client: &ApiClient, config: &ClientConfig, args: LoginArgs) -> Result<()> {
    let session = UserSession::new(client.clone(), &config.auth);
    let result = session.login(&args.username, &args.password).await;
    if !result.success {
        bail!("Login failed: {}", result.message);
    }

    println!("{}", result.message);
    let tokens = client.tokens().tokens();
    println!(
        "{}",
        serde_json::json!({
            "access_token": tokens.access_token,
            "refresh_token": tokens.refresh_token,
            "is_verify": session.is_verified(),
        })
    );
    Ok(())
}

fn request_spec(args: RequestArgs) -> Result<RequestSpec> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid method: {}", args.method))?;
    let mut spec = RequestSpec::new(method, args.path);

    for header in &args.headers {
        let (key, value) = split_pair(header, ':')
            .with_context(|| format!("Invalid header {:?}, expected KEY:VALUE", header))?;
        spec = spec.header(key, value);
    }
    for param in &args.query {
        let (key, value) = split_pair(param, '=')
            .with_context(|| format!("Invalid query parameter {:?}, expected KEY=VALUE", param))?;
        spec = spec.query(key, value);
    }

    if let Some(json) = args.json {
        spec = spec.body(Payload::new(JSON_CONTENT_TYPE, json));
    } else if !args.form.is_empty() {
        let pairs = args
            .form
            .iter()
            .map(|field| {
                split_pair(field, '=')
                    .with_context(|| format!("Invalid form field {:?}, expected KEY=VALUE", field))
            })
            .collect::<Result<Vec<_>>>()?;
        spec = spec.body(Payload::form(&pairs));
    }

    for part in &args.part {
        spec = spec.part(multipart_part(part)?);
    }
    Ok(spec)
}

fn split_pair(raw: &str, separator: char) -> Option<(&str, &str)> {
    let (key, value) = raw.split_once(separator)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

fn multipart_part(raw: &str) -> Result<MultipartPart> {
    let (name, value) = split_pair(raw, '=')
        .with_context(|| format!("Invalid part {:?}, expected NAME=VALUE or NAME=@FILE", raw))?;
    let Some(file) = value.strip_prefix('@') else {
        return Ok(MultipartPart::text(name, value));
    };

    let path = Path::new(file);
    let content = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());
    Ok(MultipartPart::file(name, filename, content))
}
