pub mod auth;
pub mod cli;
pub mod client;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;

use cli::Args;
use log::info;
use server::{ AppState, Server };
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("SoulGraph API URL: {}{}", args.api_url, args.api_prefix);
    info!("Upstream Auth: {}", if args.upstream_token.is_some() {
        "static token"
    } else if args.mock_auth {
        "mock JWT"
    } else {
        "none"
    });
    info!("Request Timeout: {}s", args.request_timeout_secs);
    info!("Default User: {}", args.default_user_id);
    info!("OpenAI Enabled: {}", !args.openai_api_key.is_empty());
    if !args.openai_api_key.is_empty() {
        info!("OpenAI Model: {}", args.openai_model.as_deref().unwrap_or(llm::chat::openai::DEFAULT_OPENAI_MODEL));
    }
    info!("Mirror Type: {}", args.mirror_type);
    if let Some(url) = &args.supabase_url {
        info!("Supabase URL: {}", url);
        info!("Supabase Table: {}", args.supabase_table);
    }
    info!("TLS Enabled: {}", args.tls_paths().is_some());
    info!("-------------------------");

    let state = AppState::from_args(&args)?;
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, state, args);
    server.run().await?;

    Ok(())
}
