//! Scenario signatures and capability-need extraction.
//!
//! A scenario signature is a deterministic hash identifying a request
//! category. It keys dynamic-expert creation: two requests with the same
//! signature always resolve to the same dynamic expert.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::registry::types::CapabilityVector;
use crate::request::{Request, RequestKind};

/// Length of the hex-encoded signature.
const SIGNATURE_LEN: usize = 16;

/// Weight of the kind-derived primary capability need.
const KIND_NEED_WEIGHT: f64 = 1.0;
/// Weight of each tag-derived secondary need.
const TAG_NEED_WEIGHT: f64 = 0.6;

/// Compiled patterns for domain-tag extraction.
struct DomainPatterns {
    security: Regex,
    performance: Regex,
    api_design: Regex,
    data_modeling: Regex,
    integration: Regex,
    requirements: Regex,
    debugging: Regex,
}

impl DomainPatterns {
    fn new() -> Self {
        Self {
            security: Regex::new(
                r"(?x)
                secur|vulnerab|auth|credential|
                encrypt|permission|inject|exploit
                ",
            )
            .unwrap(),
            performance: Regex::new(
                r"(?x)
                performan|latency|throughput|slow|
                optimi[sz]|profil|bottleneck|memory\s+usage
                ",
            )
            .unwrap(),
            api_design: Regex::new(
                r"(?x)
                \bapi\b|endpoint|rest|grpc|
                contract|schema|versioning
                ",
            )
            .unwrap(),
            data_modeling: Regex::new(
                r"(?x)
                database|migration|\bsql\b|query|
                data\s+model|index|table|partition
                ",
            )
            .unwrap(),
            integration: Regex::new(
                r"(?x)
                integrat|webhook|pipeline|deploy|
                third.party|connector|rollout
                ",
            )
            .unwrap(),
            requirements: Regex::new(
                r"(?x)
                requirement|stakeholder|business|
                roadmap|priorit|scope|estimate
                ",
            )
            .unwrap(),
            debugging: Regex::new(
                r"(?x)
                debug|error|bug|crash|
                fail|regression|root\s+cause
                ",
            )
            .unwrap(),
        }
    }
}

fn patterns() -> &'static DomainPatterns {
    static PATTERNS: OnceLock<DomainPatterns> = OnceLock::new();
    PATTERNS.get_or_init(DomainPatterns::new)
}

/// Extract sorted domain tags from free-form payload text.
pub fn extract_domain_tags(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let p = patterns();

    let mut tags = Vec::new();
    for (tag, regex) in [
        ("security", &p.security),
        ("performance", &p.performance),
        ("api_design", &p.api_design),
        ("data_modeling", &p.data_modeling),
        ("integration", &p.integration),
        ("requirements", &p.requirements),
        ("debugging", &p.debugging),
    ] {
        if regex.is_match(&lower) {
            tags.push(tag.to_string());
        }
    }
    // Patterns are checked in a fixed order, so tags are already sorted
    // alphabetically except for the pairs below; sort to make it explicit.
    tags.sort();
    tags
}

/// The primary capability a request kind asks for.
fn kind_capability(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Analysis => "code_analysis",
        RequestKind::Generation => "generation",
        RequestKind::Review => "review",
        RequestKind::Deployment => "deployment",
        RequestKind::Config => "integration",
        RequestKind::Maintenance => "debugging",
        RequestKind::Custom => "generation",
    }
}

/// Derive the capability needs of a request from its kind and domain tags.
pub fn capability_needs(request: &Request) -> CapabilityVector {
    let mut needs = CapabilityVector::new();
    needs.set(kind_capability(request.kind), KIND_NEED_WEIGHT);
    for tag in extract_domain_tags(&request.payload_text()) {
        // The kind-derived need keeps its full weight on overlap.
        if needs.get(&tag) == 0.0 {
            needs.set(tag, TAG_NEED_WEIGHT);
        }
    }
    needs
}

/// Deterministic hash identifying a request category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScenarioSignature(String);

impl ScenarioSignature {
    /// Compute the signature for a request.
    ///
    /// Covers the kind, the metadata fields that change how a request is
    /// serviced, and the sorted domain tags. Payload specifics are excluded
    /// so requests of the same shape share an expert.
    pub fn from_request(request: &Request) -> Self {
        let tags = extract_domain_tags(&request.payload_text());
        let mut hasher = Sha256::new();
        hasher.update(request.kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(request.metadata.environment.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(request.metadata.risk_level.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(request.metadata.system_impact.as_str().as_bytes());
        for tag in &tags {
            hasher.update(b"|");
            hasher.update(tag.as_bytes());
        }

        let digest = hasher.finalize();
        let hex: String = digest
            .iter()
            .take(SIGNATURE_LEN / 2)
            .map(|b| format!("{b:02x}"))
            .collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The capability vector a dynamic expert synthesised for this scenario
    /// starts with: strong on every needed axis.
    pub fn derive_capabilities(&self, needs: &CapabilityVector) -> CapabilityVector {
        needs
            .iter()
            .map(|(name, _)| (name.to_string(), 0.85))
            .collect()
    }
}

impl std::fmt::Display for ScenarioSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Environment, RiskLevel};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_tag_extraction() {
        let tags = extract_domain_tags("Audit the auth token handling for vulnerabilities");
        assert!(tags.contains(&"security".to_string()));

        let tags = extract_domain_tags("Why is the checkout endpoint so slow?");
        assert!(tags.contains(&"performance".to_string()));
        assert!(tags.contains(&"api_design".to_string()));

        assert!(extract_domain_tags("hello world").is_empty());
    }

    #[test]
    fn test_signature_deterministic() {
        let a = Request::new(RequestKind::Analysis, json!("audit the login security"));
        let b = Request::new(RequestKind::Analysis, json!("audit the login security"));
        assert_eq!(
            ScenarioSignature::from_request(&a),
            ScenarioSignature::from_request(&b)
        );
    }

    #[test]
    fn test_signature_ignores_payload_specifics() {
        // Same kind, metadata, and tags -> same signature even though the
        // payload text differs.
        let a = Request::new(RequestKind::Review, json!("review the security of module A"));
        let b = Request::new(RequestKind::Review, json!("review the security of module B"));
        assert_eq!(
            ScenarioSignature::from_request(&a),
            ScenarioSignature::from_request(&b)
        );
    }

    #[test]
    fn test_signature_varies_with_metadata() {
        let a = Request::new(RequestKind::Deployment, json!("ship it"))
            .with_environment(Environment::Dev);
        let b = Request::new(RequestKind::Deployment, json!("ship it"))
            .with_environment(Environment::Prod);
        assert_ne!(
            ScenarioSignature::from_request(&a),
            ScenarioSignature::from_request(&b)
        );

        let c = Request::new(RequestKind::Deployment, json!("ship it"))
            .with_risk_level(RiskLevel::Critical);
        assert_ne!(
            ScenarioSignature::from_request(&a),
            ScenarioSignature::from_request(&c)
        );
    }

    #[test]
    fn test_signature_length() {
        let request = Request::new(RequestKind::Custom, json!("anything"));
        assert_eq!(ScenarioSignature::from_request(&request).as_str().len(), 16);
    }

    #[test]
    fn test_capability_needs_from_kind_and_tags() {
        let request = Request::new(
            RequestKind::Analysis,
            json!("find the security hole in this slow query"),
        );
        let needs = capability_needs(&request);
        assert_eq!(needs.get("code_analysis"), 1.0);
        assert_eq!(needs.get("security"), 0.6);
        assert_eq!(needs.get("performance"), 0.6);
        assert_eq!(needs.get("data_modeling"), 0.6);
    }

    #[test]
    fn test_derived_capabilities_cover_needs() {
        let request = Request::new(RequestKind::Generation, json!("write a webhook handler"));
        let needs = capability_needs(&request);
        let sig = ScenarioSignature::from_request(&request);
        let caps = sig.derive_capabilities(&needs);
        // A synthesised expert must clear the match threshold for its own
        // scenario.
        assert!(caps.match_score(&needs) >= 0.6);
    }
}
