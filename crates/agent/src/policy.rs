//! Conversational policy
//!
//! `PolicyEngine` is the contract the pipeline consumes: a pre-check on the
//! inbound text, an advisory post-check on the reply, intent detection for
//! agent planning, and the tone fragment for system prompts.
//!
//! `RuleBasedPolicy` evaluates ordered rule lists grouped into bundles. The
//! bundle is chosen by the context's `policy_bundle`, falling back to
//! `default`. Bundles load from TOML:
//!
//! ```toml
//! [bundles.default]
//! tone = "Warm, brief, plain language."
//!
//! [bundles.default.messages]
//! spam_redirect = "I'm here to support caregivers."
//!
//! [[bundles.default.pre]]
//! id = "spam"
//! action = "block_with_message:spam_redirect"
//! when = { text_contains_any = { terms = ["buy now", "free money"], min_matches = 2 } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use carelink_core::domain::context::{HydratedContext, Inbound};

use crate::agents::AgentKind;

pub const DEFAULT_BLOCK_MESSAGE: &str = "Turn blocked by policy.";

const CRISIS_TERMS: &[&str] = &[
    "suicide",
    "kill myself",
    "end my life",
    "want to die",
    "better off dead",
    "can't go on",
    "end it all",
    "no reason to live",
    "self harm",
    "hurt myself",
];

const ASSESSMENT_TERMS: &[&str] = &["assessment", "survey", "questionnaire", "check my score"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleHit {
    pub rule_id: String,
    pub action: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allow: bool,
    pub route_override: Option<AgentKind>,
    pub message: Option<String>,
    pub actions: Vec<RuleHit>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self { allow: true, route_override: None, message: None, actions: Vec::new() }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self { allow: false, message: Some(message.into()), ..Self::allow() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Respond,
    Assessment,
    Crisis,
}

pub trait PolicyEngine: Send + Sync {
    fn pre(&self, input: &Inbound, context: &HydratedContext) -> PolicyDecision;

    /// Runs after the reply streamed. A disallow is recorded, never enforced.
    fn post(&self, input: &Inbound, context: &HydratedContext, reply: &str) -> PolicyDecision;

    fn intent(&self, text: &str) -> Intent;

    fn tone(&self, context: &HydratedContext) -> String;
}

/// Allows everything; keyword intent detection only.
#[derive(Clone, Debug, Default)]
pub struct AllowAllPolicy;

impl PolicyEngine for AllowAllPolicy {
    fn pre(&self, _input: &Inbound, _context: &HydratedContext) -> PolicyDecision {
        PolicyDecision::allow()
    }

    fn post(&self, _input: &Inbound, _context: &HydratedContext, _reply: &str) -> PolicyDecision {
        PolicyDecision::allow()
    }

    fn intent(&self, text: &str) -> Intent {
        detect_intent(text)
    }

    fn tone(&self, _context: &HydratedContext) -> String {
        DEFAULT_TONE.to_owned()
    }
}

const DEFAULT_TONE: &str = "You support family caregivers. Be warm, brief and concrete. \
Never give medical advice, diagnoses or medication guidance.";

pub fn detect_intent(text: &str) -> Intent {
    let lowered = text.to_lowercase();
    if CRISIS_TERMS.iter().any(|term| lowered.contains(term)) {
        Intent::Crisis
    } else if ASSESSMENT_TERMS.iter().any(|term| lowered.contains(term)) {
        Intent::Assessment
    } else {
        Intent::Respond
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    TextContainsAny {
        terms: Vec<String>,
        #[serde(default = "one")]
        min_matches: usize,
    },
    CrisisFlagActive,
    EmergencyConsentMissing,
    Always,
}

fn one() -> usize {
    1
}

fn owned_terms(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

impl Condition {
    fn matches(&self, text: &str, context: &HydratedContext) -> bool {
        match self {
            Self::TextContainsAny { terms, min_matches } => {
                let lowered = text.to_lowercase();
                let hits =
                    terms.iter().filter(|term| lowered.contains(&term.to_lowercase())).count();
                hits >= (*min_matches).max(1)
            }
            Self::CrisisFlagActive => context.crisis_active(),
            Self::EmergencyConsentMissing => !context.consent.emergency,
            Self::Always => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RuleAction {
    Route(AgentKind),
    BlockWithMessage(String),
    Flag,
}

impl TryFrom<String> for RuleAction {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed == "flag" {
            return Ok(Self::Flag);
        }
        if let Some(agent) = trimmed.strip_prefix("route:") {
            return AgentKind::parse(agent)
                .map(Self::Route)
                .ok_or_else(|| PolicyError::InvalidAction(value.clone()));
        }
        if let Some(token) = trimmed.strip_prefix("block_with_message:") {
            return Ok(Self::BlockWithMessage(token.to_owned()));
        }
        Err(PolicyError::InvalidAction(value))
    }
}

impl From<RuleAction> for String {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Route(agent) => format!("route:{}", agent.as_str()),
            RuleAction::BlockWithMessage(token) => format!("block_with_message:{token}"),
            RuleAction::Flag => "flag".to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub when: Condition,
    pub action: RuleAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBundle {
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default)]
    pub messages: BTreeMap<String, String>,
    #[serde(default)]
    pub pre: Vec<Rule>,
    #[serde(default)]
    pub post: Vec<Rule>,
}

fn default_tone() -> String {
    DEFAULT_TONE.to_owned()
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid rule action `{0}`")]
    InvalidAction(String),
    #[error("could not parse policy bundles: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("policy bundles must define a `default` bundle")]
    MissingDefaultBundle,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RuleBasedPolicy {
    bundles: BTreeMap<String, PolicyBundle>,
}

impl RuleBasedPolicy {
    pub fn from_toml_str(raw: &str) -> Result<Self, PolicyError> {
        let policy: Self = toml::from_str(raw)?;
        if !policy.bundles.contains_key("default") {
            return Err(PolicyError::MissingDefaultBundle);
        }
        Ok(policy)
    }

    pub fn with_bundle(mut self, name: impl Into<String>, bundle: PolicyBundle) -> Self {
        self.bundles.insert(name.into(), bundle);
        self
    }

    fn bundle(&self, context: &HydratedContext) -> Option<&PolicyBundle> {
        self.bundles.get(&context.policy_bundle).or_else(|| self.bundles.get("default"))
    }

    fn evaluate(
        &self,
        rules: &[Rule],
        bundle: &PolicyBundle,
        text: &str,
        context: &HydratedContext,
    ) -> PolicyDecision {
        let mut decision = PolicyDecision::allow();

        for rule in rules.iter().filter(|rule| rule.when.matches(text, context)) {
            decision
                .actions
                .push(RuleHit { rule_id: rule.id.clone(), action: String::from(rule.action.clone()) });

            match &rule.action {
                RuleAction::Route(agent) => {
                    decision.route_override.get_or_insert(*agent);
                }
                RuleAction::BlockWithMessage(token) => {
                    decision.allow = false;
                    decision.message = Some(
                        bundle
                            .messages
                            .get(token)
                            .cloned()
                            .unwrap_or_else(|| DEFAULT_BLOCK_MESSAGE.to_owned()),
                    );
                    break;
                }
                RuleAction::Flag => {}
            }
        }

        decision
    }
}

impl Default for RuleBasedPolicy {
    fn default() -> Self {
        let terms = owned_terms;

        let mut messages = BTreeMap::new();
        messages.insert(
            "spam_redirect".to_owned(),
            "I'm here to support caregivers. How can I help you today?".to_owned(),
        );
        messages.insert(
            "abuse_redirect".to_owned(),
            "I'm here to help. Let me know if you'd like support with caregiving.".to_owned(),
        );
        messages.insert(
            "medical_disclaimer".to_owned(),
            "I can't provide medical advice. Please check with your healthcare provider or \
             pharmacist about medications or symptoms."
                .to_owned(),
        );

        let bundle = PolicyBundle {
            tone: DEFAULT_TONE.to_owned(),
            messages,
            pre: vec![
                Rule {
                    id: "crisis_language".to_owned(),
                    when: Condition::TextContainsAny { terms: terms(CRISIS_TERMS), min_matches: 1 },
                    action: RuleAction::Route(AgentKind::Crisis),
                },
                Rule {
                    id: "spam".to_owned(),
                    when: Condition::TextContainsAny {
                        terms: terms(&[
                            "click here",
                            "buy now",
                            "limited time offer",
                            "act now",
                            "free money",
                            "make money fast",
                            "claim your prize",
                            "risk free",
                            "apply now",
                        ]),
                        min_matches: 2,
                    },
                    action: RuleAction::BlockWithMessage("spam_redirect".to_owned()),
                },
                Rule {
                    id: "abuse".to_owned(),
                    when: Condition::TextContainsAny {
                        terms: terms(&["fuck you", "fuck off", "go to hell", "stupid bot"]),
                        min_matches: 1,
                    },
                    action: RuleAction::BlockWithMessage("abuse_redirect".to_owned()),
                },
            ],
            post: vec![
                Rule {
                    id: "medical_advice".to_owned(),
                    when: Condition::TextContainsAny {
                        terms: terms(&[
                            "you should take",
                            "increase the dose",
                            "decrease the dose",
                            "stop taking",
                            "start taking",
                            "mg of",
                            "sounds like you have",
                        ]),
                        min_matches: 1,
                    },
                    action: RuleAction::BlockWithMessage("medical_disclaimer".to_owned()),
                },
                Rule {
                    id: "crisis_flag_active".to_owned(),
                    when: Condition::CrisisFlagActive,
                    action: RuleAction::Flag,
                },
            ],
        };

        Self { bundles: BTreeMap::from([("default".to_owned(), bundle)]) }
    }
}

impl PolicyEngine for RuleBasedPolicy {
    fn pre(&self, input: &Inbound, context: &HydratedContext) -> PolicyDecision {
        match self.bundle(context) {
            Some(bundle) => self.evaluate(&bundle.pre, bundle, &input.text, context),
            None => PolicyDecision::allow(),
        }
    }

    fn post(&self, _input: &Inbound, context: &HydratedContext, reply: &str) -> PolicyDecision {
        match self.bundle(context) {
            Some(bundle) => self.evaluate(&bundle.post, bundle, reply, context),
            None => PolicyDecision::allow(),
        }
    }

    fn intent(&self, text: &str) -> Intent {
        detect_intent(text)
    }

    fn tone(&self, context: &HydratedContext) -> String {
        self.bundle(context).map_or_else(default_tone, |bundle| bundle.tone.clone())
    }
}
