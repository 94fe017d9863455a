//! Built-in echo brain.
//!
//! The fabric never reasons on its own; a real deployment plugs in an
//! external thinking unit.  This brain exists so the server runs end to
//! end out of the box: it acknowledges the accumulated input verbatim.

use async_trait::async_trait;

use acf_domain::Result;
use acf_fabric::{Brain, BrainResult, FabricTurnContext, ResponseSegment};

pub struct EchoBrain;

#[async_trait]
impl Brain for EchoBrain {
    async fn think(&self, ctx: &FabricTurnContext) -> Result<BrainResult> {
        let combined = ctx
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(BrainResult {
            response_segments: vec![ResponseSegment::text(format!("You said: {combined}"))],
            ..Default::default()
        })
    }
}
