//! Execution mode resolution.
//!
//! Decides, from the function descriptor and whatever text the editor handed
//! over, which input a function runs on and whether it may run unattended.
//! Pure and synchronous.

use crate::error::AiError;
use crate::types::{ExecutionMode, FunctionDescriptor, Message};

/// Where the effective input came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Prompt,
    Context,
    Selection,
}

/// Outcome of mode resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub mode: ExecutionMode,
    pub source: InputSource,
    pub text: String,
}

impl ResolvedInput {
    /// Whether the function may run without a typed prompt
    pub fn auto_execute(&self) -> bool {
        self.source != InputSource::Prompt
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

fn context_satisfies(descriptor: &FunctionDescriptor, context: Option<&str>) -> bool {
    non_blank(context).is_some_and(|c| c.trim().chars().count() >= descriptor.min_context_length)
}

/// Whether `mode` permits auto-execution with the given editor text.
pub fn can_auto_execute(
    descriptor: &FunctionDescriptor,
    mode: ExecutionMode,
    context: Option<&str>,
    selected_text: Option<&str>,
) -> bool {
    match mode {
        ExecutionMode::ManualInput => false,
        ExecutionMode::AutoContext => context_satisfies(descriptor, context),
        ExecutionMode::AutoSelection => non_blank(selected_text).is_some(),
        ExecutionMode::Hybrid => {
            non_blank(selected_text).is_some() || context_satisfies(descriptor, context)
        }
    }
}

/// Resolve the effective input for a request.
///
/// Fails with [`AiError::InsufficientInput`] when the mode's rule cannot be
/// satisfied.
pub fn resolve_input(
    descriptor: &FunctionDescriptor,
    mode: ExecutionMode,
    prompt: &str,
    context: Option<&str>,
    selected_text: Option<&str>,
) -> Result<ResolvedInput, AiError> {
    let resolved = |source, text: &str| ResolvedInput {
        mode,
        source,
        text: text.to_string(),
    };

    match mode {
        ExecutionMode::ManualInput => {
            if prompt.trim().is_empty() {
                return Err(AiError::insufficient_input(format!(
                    "function '{}' needs a prompt",
                    descriptor.id
                )));
            }
            Ok(resolved(InputSource::Prompt, prompt))
        }
        ExecutionMode::AutoContext => match context {
            Some(c) if context_satisfies(descriptor, Some(c)) => Ok(resolved(InputSource::Context, c)),
            _ => Err(context_too_short(descriptor, context)),
        },
        ExecutionMode::AutoSelection => match non_blank(selected_text) {
            Some(s) => Ok(resolved(InputSource::Selection, s)),
            None => Err(AiError::insufficient_input(format!(
                "function '{}' needs selected text",
                descriptor.id
            ))),
        },
        ExecutionMode::Hybrid => {
            if let Some(s) = non_blank(selected_text) {
                return Ok(resolved(InputSource::Selection, s));
            }
            match context {
                Some(c) if context_satisfies(descriptor, Some(c)) => {
                    Ok(resolved(InputSource::Context, c))
                }
                _ => Err(context_too_short(descriptor, context)),
            }
        }
    }
}

fn context_too_short(descriptor: &FunctionDescriptor, context: Option<&str>) -> AiError {
    let have = context.map(|c| c.trim().chars().count()).unwrap_or(0);
    AiError::insufficient_input(format!(
        "function '{}' needs at least {} characters of context, got {}",
        descriptor.id, descriptor.min_context_length, have
    ))
}

/// Build the backend conversation for a resolved request.
///
/// The function's system instruction goes first; a typed prompt is placed
/// ahead of automatically gathered input.
pub fn build_messages(
    descriptor: &FunctionDescriptor,
    prompt: &str,
    input: &ResolvedInput,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &descriptor.system_prompt {
        messages.push(Message::system(system.clone()));
    }

    let user = match input.source {
        InputSource::Prompt => input.text.clone(),
        _ if prompt.trim().is_empty() => input.text.clone(),
        _ => format!("{}\n\n{}", prompt.trim(), input.text),
    };
    messages.push(Message::user(user));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FunctionCategory, Role};

    fn continuation() -> FunctionDescriptor {
        FunctionDescriptor::new(
            "intelligent_continuation",
            "Continue",
            FunctionCategory::Generation,
            ExecutionMode::AutoContext,
        )
        .with_min_context_length(50)
    }

    #[test]
    fn test_auto_context_rejects_short_context() {
        let descriptor = continuation();
        let err = resolve_input(
            &descriptor,
            ExecutionMode::AutoContext,
            "",
            Some("0123456789"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AiError::InsufficientInput(_)));
        assert!(!can_auto_execute(&descriptor, ExecutionMode::AutoContext, Some("0123456789"), None));
    }

    #[test]
    fn test_auto_context_uses_context() {
        let descriptor = continuation();
        let context = "x".repeat(50);
        let resolved =
            resolve_input(&descriptor, ExecutionMode::AutoContext, "", Some(&context), None).unwrap();
        assert_eq!(resolved.source, InputSource::Context);
        assert_eq!(resolved.text, context);
        assert!(resolved.auto_execute());
    }

    #[test]
    fn test_context_length_counts_characters() {
        let descriptor = continuation();
        // 50 multi-byte characters, well over 50 bytes
        let context = "字".repeat(50);
        assert!(can_auto_execute(&descriptor, ExecutionMode::AutoContext, Some(&context), None));
        let padded = format!("   {}   ", "字".repeat(49));
        assert!(!can_auto_execute(&descriptor, ExecutionMode::AutoContext, Some(&padded), None));
    }

    #[test]
    fn test_manual_input_needs_prompt() {
        let descriptor = continuation();
        assert!(resolve_input(&descriptor, ExecutionMode::ManualInput, "  ", None, None).is_err());

        let resolved =
            resolve_input(&descriptor, ExecutionMode::ManualInput, "Write a haiku", None, None)
                .unwrap();
        assert_eq!(resolved.source, InputSource::Prompt);
        assert!(!resolved.auto_execute());
        assert!(!can_auto_execute(
            &descriptor,
            ExecutionMode::ManualInput,
            Some(&"x".repeat(100)),
            Some("sel")
        ));
    }

    #[test]
    fn test_auto_selection() {
        let descriptor = continuation();
        assert!(resolve_input(&descriptor, ExecutionMode::AutoSelection, "", Some("ctx"), Some(" ")).is_err());
        let resolved =
            resolve_input(&descriptor, ExecutionMode::AutoSelection, "", None, Some("picked")).unwrap();
        assert_eq!(resolved.source, InputSource::Selection);
        assert_eq!(resolved.text, "picked");
    }

    #[test]
    fn test_hybrid_prefers_selection_then_context() {
        let descriptor = continuation().with_min_context_length(5);
        let with_selection =
            resolve_input(&descriptor, ExecutionMode::Hybrid, "", Some("long context"), Some("sel"))
                .unwrap();
        assert_eq!(with_selection.source, InputSource::Selection);

        let fallback =
            resolve_input(&descriptor, ExecutionMode::Hybrid, "", Some("long context"), None).unwrap();
        assert_eq!(fallback.source, InputSource::Context);

        assert!(resolve_input(&descriptor, ExecutionMode::Hybrid, "", Some("abc"), None).is_err());
    }

    #[test]
    fn test_build_messages() {
        let descriptor = continuation().with_system_prompt("Continue the story.");
        let input = ResolvedInput {
            mode: ExecutionMode::AutoContext,
            source: InputSource::Context,
            text: "Once upon a time".to_string(),
        };

        let messages = build_messages(&descriptor, "", &input);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "Once upon a time");

        let messages = build_messages(&descriptor, "Make it darker", &input);
        assert_eq!(messages[1].content, "Make it darker\n\nOnce upon a time");
    }
}
