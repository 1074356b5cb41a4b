use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the relay to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:3000")]
    pub server_addr: String,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    // --- SoulGraph Upstream Args ---
    /// Base URL of the SoulGraph API.
    #[arg(long, env = "API_URL", default_value = "http://localhost:8000")]
    pub api_url: String,

    /// Version prefix prepended to every SoulGraph path.
    #[arg(long, env = "API_PREFIX", default_value = "/v0")]
    pub api_prefix: String,

    /// Static bearer token sent to SoulGraph. Takes precedence over --mock-auth.
    #[arg(long, env = "UPSTREAM_TOKEN")]
    pub upstream_token: Option<String>,

    /// Sign a mock Supabase JWT for the test user and send it to SoulGraph.
    #[arg(long, env = "MOCK_AUTH", default_value = "false")]
    pub mock_auth: bool,

    /// Secret for the mock JWT. Falls back to the service-role key signature, then a fixed test secret.
    #[arg(long, env = "MOCK_JWT_SECRET")]
    pub mock_jwt_secret: Option<String>,

    /// Timeout in seconds for connecting and for non-streaming upstream calls.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Owner recorded on mirrored threads when the request carries no user_id.
    #[arg(long, env = "DEFAULT_USER_ID", default_value = "test-user-123")]
    pub default_user_id: String,

    /// System prompt used when a request does not carry one.
    #[arg(long, env = "DEFAULT_SYSTEM_PROMPT", default_value = "You are a helpful assistant.")]
    pub default_system_prompt: String,

    // --- OpenAI Args ---
    /// API key for OpenAI. The /api/openai route is disabled when empty.
    #[arg(long, env = "OPENAI_API_KEY", default_value = "")]
    pub openai_api_key: String,

    /// Model name for chat completion (e.g., gpt-3.5-turbo, gpt-4o)
    #[arg(long, env = "OPENAI_MODEL")]
    pub openai_model: Option<String>,

    /// Base URL for the OpenAI API (e.g., https://api.openai.com/v1)
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    // --- Mirror Args ---
    /// Mirror datastore type (supabase, memory, none)
    #[arg(long, env = "MIRROR_TYPE", default_value = "none")]
    pub mirror_type: String,

    /// Supabase project URL (e.g., https://abcd.supabase.co)
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Supabase service-role key used for mirror writes.
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", default_value = "")]
    pub supabase_service_role_key: String,

    /// Table holding mirrored threads.
    #[arg(long, env = "SUPABASE_TABLE", default_value = "chat_threads")]
    pub supabase_table: String,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        if !self.enable_tls {
            return None;
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}
