pub mod api;

use crate::auth::TokenSource;
use crate::cli::Args;
use crate::history::{ initialize_mirror, ThreadMirror };
use crate::llm::chat::{ InferenceBackend, OpenAIChatClient, SoulGraphClient, ThreadBackend };
use crate::llm::Provider;
use log::{ info, warn };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Services shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub soulgraph: Arc<dyn InferenceBackend>,
    pub openai: Option<Arc<dyn InferenceBackend>>,
    pub threads: Arc<dyn ThreadBackend>,
    pub mirror: Option<Arc<dyn ThreadMirror>>,
    pub default_user_id: String,
}

impl AppState {
    pub fn new(soulgraph: Arc<dyn InferenceBackend>, threads: Arc<dyn ThreadBackend>) -> Self {
        Self {
            soulgraph,
            openai: None,
            threads,
            mirror: None,
            default_user_id: "test-user-123".to_string(),
        }
    }

    pub fn with_openai(mut self, openai: Arc<dyn InferenceBackend>) -> Self {
        self.openai = Some(openai);
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ThreadMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_default_user(mut self, user_id: impl Into<String>) -> Self {
        self.default_user_id = user_id.into();
        self
    }

    pub fn backend(&self, provider: Provider) -> Option<Arc<dyn InferenceBackend>> {
        match provider {
            Provider::SoulGraph => Some(self.soulgraph.clone()),
            Provider::OpenAI => self.openai.clone(),
        }
    }

    pub fn from_args(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let timeout = Duration::from_secs(args.request_timeout_secs);
        let soulgraph = Arc::new(
            SoulGraphClient::new(&args.api_url, Some(&args.api_prefix), timeout, TokenSource::from_args(args))?
        );
        info!("SoulGraph API at {}", soulgraph.base_url());

        let mut state = AppState::new(soulgraph.clone(), soulgraph).with_default_user(
            args.default_user_id.clone()
        );

        if args.openai_api_key.is_empty() {
            warn!("OPENAI_API_KEY is not set, {} is disabled", Provider::OpenAI.route());
        } else {
            let openai = OpenAIChatClient::new(
                args.openai_api_key.clone(),
                args.openai_model.clone(),
                args.openai_base_url.clone(),
                Some(args.default_system_prompt.clone()),
                timeout
            )?;
            state = state.with_openai(Arc::new(openai));
        }

        if let Some(mirror) = initialize_mirror(args)? {
            state = state.with_mirror(mirror);
        }
        Ok(state)
    }
}

pub struct Server {
    addr: String,
    state: AppState,
    args: Args,
}

impl Server {
    pub fn new(addr: String, state: AppState, args: Args) -> Self {
        Self { addr, state, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(&self.addr, self.state.clone(), &self.args).await
    }
}
