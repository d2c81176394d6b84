use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::llm::types::ChatMessage;

/// Boundary to the inference endpoint: ordered conversation in, raw reply
/// text out. Implementations report network and timeout problems as
/// transport errors so the loop can retry them.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    async fn request(&self, messages: &[ChatMessage]) -> PilotResult<String>;
}
