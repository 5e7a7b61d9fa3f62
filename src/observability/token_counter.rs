use crate::protocol::canonical::{FinalResponse, Usage};
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate completion tokens for an assembled response: visible text,
/// reasoning, and tool-call names and arguments.
#[must_use]
pub fn estimate_completion_tokens(response: &FinalResponse) -> u64 {
    let mut total = estimate_tokens(&response.text) + estimate_tokens(&response.thinking);
    for call in &response.tool_calls {
        total += estimate_tokens(&call.function.name);
        total += estimate_tokens(&call.function.arguments);
    }
    total
}

/// Merge upstream-reported usage with local estimates.
///
/// - Always prefer upstream non-zero values
/// - Only fill zero fields with estimates
/// - Compute total = prompt + completion if total is missing
#[must_use]
pub fn merge_usage(upstream: &Usage, estimated_prompt: u64, estimated_completion: u64) -> Usage {
    let prompt_tokens = match upstream.prompt_tokens {
        0 => estimated_prompt,
        v => v,
    };
    let completion_tokens = match upstream.completion_tokens {
        0 => estimated_completion,
        v => v,
    };
    let total_tokens = match upstream.total_tokens {
        0 => prompt_tokens + completion_tokens,
        v => v,
    };
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }
}

/// Log token usage for a completed stream at INFO level.
pub fn log_stream_usage(response: &FinalResponse, duration: Duration) {
    let metadata = &response.metadata;
    info!(
        provider = metadata.provider.as_str(),
        model = metadata.model.as_str(),
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        total_tokens = response.usage.total_tokens,
        tool_calls = response.tool_calls.len(),
        warnings = response.warnings.len(),
        finish_reason = metadata.finish_reason.as_deref().unwrap_or("none"),
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}
