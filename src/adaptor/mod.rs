//! Provider adaptors.
//!
//! Epistemic foundation:
//! - K_i: Every variant drives a batch of records to the terminal state
//! - K_i: Variant is chosen once, from configuration
//! - B_i: Configuration is usable → checked before any request is sent
//!
//! Lifecycle: `initialize` → `run` (any number of times) → `terminate` (once).

mod batch;
mod hosted;
mod session;
mod streaming;

pub use batch::*;
pub use hosted::*;
pub use session::*;
pub use streaming::*;

use crate::models::{BackendKind, Config, ConversationRecord, Result};
use async_trait::async_trait;
use tracing::info;

/// Backend capability: run a batch of records to completion.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Drive every record to the terminal state.
    ///
    /// Returns the same records, in unspecified order.
    async fn run(&self, records: Vec<ConversationRecord>) -> Vec<ConversationRecord>;

    /// Release backend resources. Consumes the adaptor.
    fn terminate(self: Box<Self>) {
        info!(adaptor = self.name(), "Terminating adaptor");
    }
}

/// Build the adaptor selected by `config.backend`.
///
/// B_i(config valid) → Result; fails before any request is sent.
pub fn initialize(config: &Config) -> Result<Box<dyn Adaptor>> {
    config.validate()?;

    let adaptor: Box<dyn Adaptor> = match config.backend {
        BackendKind::Openai => Box::new(HostedAdaptor::from_config(config)?),
        BackendKind::Anthropic => Box::new(StreamingAdaptor::from_config(config)?),
        BackendKind::Gemini => Box::new(SessionAdaptor::from_config(config)?),
        BackendKind::Vllm => Box::new(BatchAdaptor::from_config(config)?),
    };

    info!(
        adaptor = adaptor.name(),
        model = %config.model_name,
        concurrency = config.concurrency,
        "Initialized adaptor"
    );
    Ok(adaptor)
}
