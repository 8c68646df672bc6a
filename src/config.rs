use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

const DEFAULT_PUBLIC_PATHS: &str =
    "/auth/signup,/auth/verify-email,/auth/resend-code,/auth/oauth/callback";

/// Session Client - authenticated REST client with token refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL
    #[arg(short = 'u', long, env = "SESSION_API_BASE_URL")]
    pub base_url: Option<String>,

    /// Login endpoint path
    #[arg(long, env = "SESSION_LOGIN_PATH", default_value = "/auth/login")]
    pub login_path: String,

    /// Refresh endpoint path
    #[arg(long, env = "SESSION_REFRESH_PATH", default_value = "/auth/refresh")]
    pub refresh_path: String,

    /// Logout endpoint path
    #[arg(long, env = "SESSION_LOGOUT_PATH", default_value = "/auth/logout")]
    pub logout_path: String,

    /// Comma-separated unauthenticated endpoint paths
    #[arg(long, env = "SESSION_PUBLIC_PATHS", default_value = DEFAULT_PUBLIC_PATHS)]
    pub public_paths: String,

    /// Account type sent in the x-role header on login
    #[arg(short = 'r', long, env = "SESSION_ROLE", default_value = "customer")]
    pub role: String,

    /// Path to the SQLite session database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in and store the session
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Password (prompted when omitted)
        #[arg(short, long, env = "SESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Show the stored session
    Whoami,

    /// Send an authenticated request
    Request {
        /// HTTP method
        method: String,

        /// Path relative to the base URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },

    /// End the session
    Logout,

    /// Print the claims carried by a token without verifying it
    Decode {
        token: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub public_paths: Vec<String>,
    pub role: String,

    // Persistence
    pub session_db: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Session bookkeeping
    pub expiry_warning_threshold: u64,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let config = Config {
            base_url: args
                .base_url
                .clone()
                .or_else(|| std::env::var("SESSION_API_BASE_URL").ok())
                .context(
                    "SESSION_API_BASE_URL is required (use -u or set SESSION_API_BASE_URL env var)",
                )?,

            login_path: args.login_path.clone(),
            refresh_path: args.refresh_path.clone(),
            logout_path: args.logout_path.clone(),
            public_paths: parse_path_list(&args.public_paths),
            role: args.role.clone(),

            session_db: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_session_db),

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            expiry_warning_threshold: std::env::var("EXPIRY_WARNING_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
        };

        Ok(config)
    }

    /// Configuration for a backend at `base_url` with default paths
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            public_paths: parse_path_list(DEFAULT_PUBLIC_PATHS),
            role: "customer".to_string(),
            session_db: default_session_db(),
            http_max_connections: 10,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            expiry_warning_threshold: 300,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .with_context(|| format!("SESSION_API_BASE_URL is not a valid URL: {}", self.base_url))?;

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    /// Resolve endpoint URLs
    pub fn endpoints(&self) -> Result<Endpoints> {
        Endpoints::new(
            &self.base_url,
            &self.login_path,
            &self.refresh_path,
            &self.logout_path,
            &self.public_paths,
        )
    }
}

/// Resolved backend endpoints and their classification
#[derive(Clone, Debug)]
pub struct Endpoints {
    base: Url,
    login: Url,
    refresh: Url,
    logout: Url,
    public: Vec<String>,
}

impl Endpoints {
    pub fn new(
        base_url: &str,
        login_path: &str,
        refresh_path: &str,
        logout_path: &str,
        public_paths: &[String],
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid base URL: {}", base_url))?;

        let login = join(&base, login_path)?;
        let refresh = join(&base, refresh_path)?;
        let logout = join(&base, logout_path)?;

        // Credential submission and refresh are never treated as session failures
        let mut public = vec![normalize(login.path()), normalize(refresh.path())];
        for path in public_paths {
            public.push(normalize(join(&base, path)?.path()));
        }

        Ok(Self {
            base,
            login,
            refresh,
            logout,
            public,
        })
    }

    /// Absolute URL for a path relative to the base URL
    pub fn url(&self, path: &str) -> Result<Url> {
        join(&self.base, path)
    }

    /// Same as [`Endpoints::url`], leaving parse errors to the HTTP client
    pub fn resolve(&self, path: &str) -> String {
        join_str(&self.base, path)
    }

    pub fn login(&self) -> &Url {
        &self.login
    }

    pub fn refresh(&self) -> &Url {
        &self.refresh
    }

    pub fn logout(&self) -> &Url {
        &self.logout
    }

    /// Whether `url` targets the logout endpoint
    pub fn is_logout(&self, url: &Url) -> bool {
        normalize(url.path()) == normalize(self.logout.path())
    }

    /// Whether `url` targets the refresh endpoint
    pub fn is_refresh(&self, url: &Url) -> bool {
        normalize(url.path()) == normalize(self.refresh.path())
    }

    /// Whether `url` targets an endpoint callable without a session
    pub fn is_public(&self, url: &Url) -> bool {
        let path = normalize(url.path());
        self.public.iter().any(|p| *p == path)
    }
}

/// Join a path onto the base URL, keeping any path prefix the base carries
fn join(base: &Url, path: &str) -> Result<Url> {
    Url::parse(&join_str(base, path)).with_context(|| format!("Invalid endpoint path: {}", path))
}

fn join_str(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_path_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_session_db() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("session-client")
        .join("session.sqlite3")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
