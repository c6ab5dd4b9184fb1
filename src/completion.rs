use crate::error::PipelineError;
use crate::gemini::{self, ContentModel, GenerateRequest};
use crate::retry::RetryPolicy;
use crate::sanitize::{self, Cleaned};

/// Fresh requests made when the model output holds no usable document.
pub const MAX_EXTRACTION_ATTEMPTS: u32 = 3;
/// Follow-up requests made for one truncated answer before it counts as a
/// failed attempt.
pub const MAX_CONTINUATIONS: u32 = 5;

const CONTINUE_INSTRUCTION: &str = "Your previous answer was cut off. Continue exactly where it stopped. \
Output only the remaining HTML, without repeating anything and without code fences.";

/// Asks the model for an HTML document and returns the cleaned markup.
///
/// Truncated answers are continued in the same conversation and stitched
/// back together. Output with no document at all is re-requested from
/// scratch a bounded number of times before failing with
/// [`PipelineError::ContentExtraction`], or with
/// [`PipelineError::UnfinishedDocument`] when the last attempt was cut off.
pub async fn generate_html(
    model: &dyn ContentModel,
    request: &GenerateRequest,
    policy: &RetryPolicy,
    operation: &str,
    streaming: bool,
) -> Result<String, PipelineError> {
    let mut unfinished: Option<usize> = None;
    for attempt in 1..=MAX_EXTRACTION_ATTEMPTS {
        let mut next = request.clone();
        let mut partial: Option<String> = None;

        for continuation in 0..=MAX_CONTINUATIONS {
            let response = gemini::invoke(model, &next, policy, operation, streaming).await?;
            match sanitize::clean_html(response.text(), partial.as_deref()) {
                Ok(Cleaned::Complete(html)) => {
                    if continuation > 0 {
                        tracing::info!(operation, continuation, "document completed by continuation");
                    }
                    return Ok(html);
                }
                Ok(Cleaned::Partial(text)) => {
                    tracing::info!(
                        operation,
                        continuation = continuation + 1,
                        chars = text.len(),
                        "requesting continuation"
                    );
                    next = request.continuation(&text, CONTINUE_INSTRUCTION);
                    partial = Some(text);
                }
                Err(err) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        error = %err,
                        preview = %sanitize::preview(response.text()),
                        "could not extract HTML"
                    );
                    partial = None;
                    break;
                }
            }
        }

        unfinished = partial.map(|text| text.len());
        if let Some(chars) = unfinished {
            tracing::warn!(
                operation,
                attempt,
                chars,
                "document still unfinished after continuations"
            );
        }
    }

    match unfinished {
        Some(chars) => Err(PipelineError::UnfinishedDocument {
            operation: operation.to_owned(),
            attempts: MAX_EXTRACTION_ATTEMPTS,
            chars,
        }),
        None => Err(PipelineError::ContentExtraction {
            operation: operation.to_owned(),
            attempts: MAX_EXTRACTION_ATTEMPTS,
        }),
    }
}

/// The first `limit` characters of the previous unit, handed to the next
/// request for continuity. `None` when carry-over is off or there is nothing
/// to carry.
pub fn context_excerpt(previous: Option<&str>, limit: usize) -> Option<&str> {
    let text = previous?.trim();
    if limit == 0 || text.is_empty() {
        return None;
    }
    match text.char_indices().nth(limit) {
        Some((end, _)) => Some(&text[..end]),
        None => Some(text),
    }
}
