use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use std::sync::Arc;

use session_client::auth::{self, Navigator, SessionStore};
use session_client::config::{CliArgs, Command, Config};
use session_client::error::ApiError;
use session_client::http_client::ApiClient;

/// Prints the sign-in notice to the terminal
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn redirect_to_login(&self, message: &str) {
        eprintln!("{}", message);
        eprintln!("Run `session-client login --email <EMAIL>` to sign in again.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();

    // Initialize logging with the configured level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if args.log_format.eq_ignore_ascii_case("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // Decoding needs neither a backend nor a session
    if let Command::Decode { token } = &args.command {
        return print_claims(token);
    }

    let config = Config::from_args(&args)?;
    config.validate()?;
    tracing::debug!(base_url = %config.base_url, db = %config.session_db.display(), "Configuration loaded");

    let store = Arc::new(SessionStore::new(auth::open_session_storage(&config.session_db)));
    let client = ApiClient::new(&config, store.clone(), Arc::new(TerminalNavigator))?;

    match args.command {
        Command::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => Password::new()
                    .with_prompt(format!("Password for {}", email))
                    .interact()
                    .context("Failed to read password")?,
            };

            match client.login(&email, &password).await {
                Ok(session) => {
                    let name = session
                        .identity
                        .as_ref()
                        .and_then(|i| i.display_name.clone().or_else(|| i.email.clone()))
                        .unwrap_or(email);
                    println!("Signed in as {}", name);
                }
                Err(e) => {
                    anyhow::bail!("Sign-in failed: {}", e.user_message());
                }
            }
        }

        Command::Whoami => {
            let session = store.get();
            if !session.is_authenticated {
                println!("Not signed in");
                if let Some(error) = session.last_error {
                    println!("Last error: {}", error);
                }
                return Ok(());
            }

            println!(
                "{}",
                serde_json::to_string_pretty(&session.identity).unwrap_or_default()
            );
            if let Some(expires_at) = session.expires_at {
                println!("Access token expires: {}", expires_at.to_rfc3339());
            }
            warn_if_expiring(&store, &config);
        }

        Command::Request { method, path, body } => {
            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut request = client.request(method, &path);
            if let Some(body) = body {
                let json: serde_json::Value =
                    serde_json::from_str(&body).context("Request body is not valid JSON")?;
                request = request.json(&json);
            }

            match request.send().await {
                Ok(response) => {
                    println!("{}", pretty_body(response.bytes()));
                    warn_if_expiring(&store, &config);
                }
                Err(e) => {
                    tracing::debug!(kind = e.kind(), error = %e, "Request failed");
                    anyhow::bail!("{} ({})", e.user_message(), e.kind());
                }
            }
        }

        Command::Logout => {
            let outcome = client.logout().await;
            println!("{}", outcome.message());
        }

        Command::Decode { token } => print_claims(&token)?,
    }

    Ok(())
}

fn print_claims(token: &str) -> Result<()> {
    let claims = auth::claims::decode(token)
        .map_err(ApiError::from)
        .context("Failed to decode token")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&claims.raw).unwrap_or_default()
    );
    if let Some(subject) = &claims.subject {
        println!("Subject:    {}", subject);
    }
    if let Some(issued_at) = claims.issued_at_utc() {
        println!("Issued at:  {}", issued_at.to_rfc3339());
    }
    if let Some(expires_at) = claims.expires_at_utc() {
        let state = if claims.is_expired_at(chrono::Utc::now()) {
            " (expired)"
        } else {
            ""
        };
        println!("Expires at: {}{}", expires_at.to_rfc3339(), state);
    }
    Ok(())
}

fn warn_if_expiring(store: &SessionStore, config: &Config) {
    let Some(threshold) = i64::try_from(config.expiry_warning_threshold)
        .ok()
        .and_then(chrono::Duration::try_seconds)
    else {
        return;
    };
    if store.is_authenticated() && store.expires_within(threshold) {
        eprintln!("Warning: your access token expires soon; it will be renewed on the next request.");
    }
}

fn pretty_body(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}
