//! Human-prompt templates.
//!
//! Templates are keyed by `(kind, risk_level)` and bind the request payload
//! into the message shown to the human.

use crate::human::{HumanPrompt, PromptField};
use crate::request::{Request, RequestKind, RiskLevel};

/// How much payload text gets bound into a prompt message.
const PAYLOAD_EXCERPT_LEN: usize = 240;

fn payload_excerpt(request: &Request) -> String {
    let text = request.payload_text();
    if text.len() <= PAYLOAD_EXCERPT_LEN {
        text
    } else {
        let mut cut = PAYLOAD_EXCERPT_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

/// Pick and bind the prompt for a request.
pub fn prompt_for(request: &Request) -> HumanPrompt {
    let excerpt = payload_excerpt(request);
    let risk = request.metadata.risk_level;

    match (request.kind, risk) {
        (RequestKind::Deployment, RiskLevel::High | RiskLevel::Critical) => {
            HumanPrompt::confirmation(
                "Confirm high-risk deployment",
                format!(
                    "Request {} wants to deploy to {} with {} risk:\n{excerpt}",
                    request.id,
                    request.metadata.environment.as_str(),
                    risk.as_str(),
                ),
            )
        }
        (RequestKind::Deployment, _) => HumanPrompt::confirmation(
            "Confirm deployment",
            format!("Request {} wants to deploy:\n{excerpt}", request.id),
        ),
        (RequestKind::Config | RequestKind::Maintenance, _) => HumanPrompt::confirmation(
            format!("Confirm {} change", request.kind.as_str()),
            format!(
                "Request {} wants a {} change in {}:\n{excerpt}",
                request.id,
                request.kind.as_str(),
                request.metadata.environment.as_str(),
            ),
        ),
        (RequestKind::Review, _) => HumanPrompt::selection(
            "Review verdict needed",
            format!("Request {} needs a review decision:\n{excerpt}", request.id),
            vec![
                "approve".to_string(),
                "request_changes".to_string(),
                "reject".to_string(),
            ],
        ),
        (RequestKind::Analysis | RequestKind::Generation | RequestKind::Custom, _) => {
            HumanPrompt::input(
                "Guidance needed",
                format!(
                    "Request {} ({}) needs direction:\n{excerpt}",
                    request.id,
                    request.kind.as_str(),
                ),
                vec![PromptField {
                    name: "instructions".to_string(),
                    label: "How should this request proceed?".to_string(),
                    required: true,
                }],
            )
        }
    }
}

/// Prompt used when expert dissent escalates to a human.
pub fn escalation_prompt(request: &Request, expert_count: usize, dissent: f64) -> HumanPrompt {
    HumanPrompt::selection(
        "Experts disagree",
        format!(
            "Request {}: {expert_count} experts disagree (dissent {dissent:.2}).\n{}",
            request.id,
            payload_excerpt(request),
        ),
        vec![
            "accept_majority".to_string(),
            "accept_minority".to_string(),
            "reject_all".to_string(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::human::PromptKind;
    use crate::request::Environment;
    use serde_json::json;

    #[test]
    fn test_high_risk_deployment_is_confirmation() {
        let request = Request::new(RequestKind::Deployment, json!("ship the api"))
            .with_environment(Environment::Prod)
            .with_risk_level(RiskLevel::High);
        let prompt = prompt_for(&request);
        assert_eq!(prompt.kind, PromptKind::Confirmation);
        assert!(prompt.message.contains("ship the api"));
        assert!(prompt.message.contains("prod"));
    }

    #[test]
    fn test_review_is_selection() {
        let request = Request::new(RequestKind::Review, json!("diff contents"));
        let prompt = prompt_for(&request);
        assert_eq!(prompt.kind, PromptKind::Selection);
        assert_eq!(prompt.options.len(), 3);
    }

    #[test]
    fn test_analysis_is_input() {
        let request = Request::new(RequestKind::Analysis, json!("inspect this"));
        let prompt = prompt_for(&request);
        assert_eq!(prompt.kind, PromptKind::Input);
        assert_eq!(prompt.fields.len(), 1);
    }

    #[test]
    fn test_long_payload_truncated() {
        let request = Request::new(RequestKind::Review, json!("x".repeat(2_000)));
        let prompt = prompt_for(&request);
        assert!(prompt.message.len() < 600);
    }

    #[test]
    fn test_escalation_prompt_mentions_dissent() {
        let request = Request::new(RequestKind::Analysis, json!("inspect"));
        let prompt = escalation_prompt(&request, 4, 0.83);
        assert_eq!(prompt.kind, PromptKind::Selection);
        assert!(prompt.message.contains("0.83"));
    }
}
