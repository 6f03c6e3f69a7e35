//! Two-stage intent classification.
//!
//! Stage one is a keyword rule-set; a confident match (≥ 0.90) returns
//! immediately and short greetings always short-circuit to GENERAL_CHAT.
//! Otherwise the model is asked to pick one label from the closed set, with
//! the keyword verdict as fallback when the model is unavailable or answers
//! off-vocabulary.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::events::TurnEmitter;
use crate::ai::client::LlmClient;

/// Closed intent vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    CodingTask,
    ErrorDiagnosis,
    RepoAnalysis,
    TechnicalConsulting,
    GeneralChat,
    CapabilityInquiry,
    Uncertain,
}

impl Intent {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::CodingTask => "CODING_TASK",
            Self::ErrorDiagnosis => "ERROR_DIAGNOSIS",
            Self::RepoAnalysis => "REPO_ANALYSIS",
            Self::TechnicalConsulting => "TECHNICAL_CONSULTING",
            Self::GeneralChat => "GENERAL_CHAT",
            Self::CapabilityInquiry => "CAPABILITY_INQUIRY",
            Self::Uncertain => "UNCERTAIN",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "CODING_TASK" => Some(Self::CodingTask),
            "ERROR_DIAGNOSIS" => Some(Self::ErrorDiagnosis),
            "REPO_ANALYSIS" => Some(Self::RepoAnalysis),
            "TECHNICAL_CONSULTING" => Some(Self::TechnicalConsulting),
            "GENERAL_CHAT" => Some(Self::GeneralChat),
            "CAPABILITY_INQUIRY" => Some(Self::CapabilityInquiry),
            "UNCERTAIN" => Some(Self::Uncertain),
            _ => None,
        }
    }

    /// Chat-like intents never plan; task-like intents do.
    pub fn planning_enabled(self) -> bool {
        matches!(
            self,
            Self::CodingTask | Self::ErrorDiagnosis | Self::RepoAnalysis
        )
    }

    pub fn all() -> [Intent; 7] {
        [
            Self::CodingTask,
            Self::ErrorDiagnosis,
            Self::RepoAnalysis,
            Self::TechnicalConsulting,
            Self::GeneralChat,
            Self::CapabilityInquiry,
            Self::Uncertain,
        ]
    }
}

/// Classification result with its provenance.
#[derive(Debug, Clone)]
pub struct Classified {
    pub intent: Intent,
    pub confidence: f32,
    pub source: &'static str,
}

/// Rule-stage confidence needed to skip the model.
const SHORT_CIRCUIT_CONFIDENCE: f32 = 0.90;

/// Exact (lowercased, trimmed) greeting forms.
const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "hiya", "howdy", "good morning", "good evening", "thanks",
    "thank you", "你好", "您好", "早上好", "谢谢",
];

struct Rule {
    intent: Intent,
    keywords: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        intent: Intent::CodingTask,
        keywords: &[
            "implement", "refactor", "fix ", "add ", "write ", "create ", "rename", "install",
            "update ", "migrate", "optimize", "修改", "实现", "编写",
        ],
    },
    Rule {
        intent: Intent::ErrorDiagnosis,
        keywords: &[
            "error", "panic", "exception", "stack trace", "traceback", "fails", "failing",
            "crash", "broken", "bug", "报错",
        ],
    },
    Rule {
        intent: Intent::RepoAnalysis,
        keywords: &[
            "show me", "explain", "where is", "find ", "list ", "analyze", "architecture",
            "structure", "how does", "read ", "look at",
        ],
    },
    Rule {
        intent: Intent::TechnicalConsulting,
        keywords: &[
            "should i", "which is better", "recommend", "compare", "pros and cons",
            "best practice", "tradeoff",
        ],
    },
    Rule {
        intent: Intent::CapabilityInquiry,
        keywords: &[
            "what can you do", "your capabilities", "what tools", "who are you", "how do you work",
        ],
    },
];

/// Stage one: keyword rules.
pub fn classify_keywords(text: &str) -> Classified {
    let normalized = text.trim().to_lowercase();

    // Short greetings always short-circuit.
    let bare = normalized.trim_end_matches(['!', '.', '?', '，', '。']);
    if GREETINGS.contains(&bare) {
        return Classified {
            intent: Intent::GeneralChat,
            confidence: 1.0,
            source: "keyword",
        };
    }

    let mut best: Option<(Intent, usize)> = None;
    for rule in RULES {
        let hits = rule
            .keywords
            .iter()
            .filter(|k| normalized.contains(*k))
            .count();
        if hits > 0 {
            match best {
                Some((_, best_hits)) if best_hits >= hits => {}
                _ => best = Some((rule.intent, hits)),
            }
        }
    }

    match best {
        Some((intent, hits)) => Classified {
            intent,
            confidence: (0.6 + 0.1 * (hits.saturating_sub(1)) as f32).min(0.95),
            source: "keyword",
        },
        None => Classified {
            intent: Intent::Uncertain,
            confidence: 0.0,
            source: "keyword",
        },
    }
}

const CLASSIFY_SYSTEM_PROMPT: &str = "\
You classify a user request for a code agent. Answer with exactly one label\n\
from this set and nothing else:\n\
CODING_TASK, ERROR_DIAGNOSIS, REPO_ANALYSIS, TECHNICAL_CONSULTING,\n\
GENERAL_CHAT, CAPABILITY_INQUIRY, UNCERTAIN";

/// Full two-stage classification.
pub async fn classify(
    text: &str,
    llm: &LlmClient,
    emitter: &TurnEmitter,
    cancel: &CancellationToken,
) -> Classified {
    let keyword = classify_keywords(text);
    if keyword.confidence >= SHORT_CIRCUIT_CONFIDENCE {
        return keyword;
    }

    match llm
        .complete_simple(CLASSIFY_SYSTEM_PROMPT, text, 16, emitter, cancel)
        .await
    {
        Ok(answer) => match Intent::from_label(&answer) {
            Some(intent) => Classified {
                intent,
                confidence: 0.75,
                source: "llm",
            },
            None => {
                tracing::debug!(answer = %answer, "model returned off-vocabulary intent label");
                fallback(keyword)
            }
        },
        Err(e) => {
            tracing::warn!("intent model unavailable, using keyword verdict: {}", e);
            fallback(keyword)
        }
    }
}

fn fallback(keyword: Classified) -> Classified {
    if keyword.confidence > 0.0 {
        Classified {
            source: "fallback",
            ..keyword
        }
    } else {
        Classified {
            intent: Intent::Uncertain,
            confidence: 0.0,
            source: "fallback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::EventBus;
    use crate::ai::client::ScriptedBackend;
    use crate::config::CoreConfig;
    use crate::error::LlmError;
    use std::sync::Arc;

    fn harness(backend: Arc<ScriptedBackend>) -> (LlmClient, TurnEmitter) {
        let client = LlmClient::new(backend, CoreConfig::default());
        let bus = Arc::new(EventBus::new());
        let emitter = TurnEmitter::new(bus, "t".into(), "s".into());
        (client, emitter)
    }

    #[test]
    fn greetings_short_circuit_to_general_chat() {
        for text in ["hi", "Hello!", "你好", "  hey  ", "Thanks."] {
            let verdict = classify_keywords(text);
            assert_eq!(verdict.intent, Intent::GeneralChat, "text: {}", text);
            assert!(verdict.confidence >= 0.9);
        }
    }

    #[test]
    fn keyword_rules_pick_the_dominant_intent() {
        let verdict = classify_keywords("please fix the error in the stack trace, it fails");
        assert_eq!(verdict.intent, Intent::ErrorDiagnosis);
        assert!(verdict.confidence > 0.6);
    }

    #[test]
    fn unmatched_text_is_uncertain() {
        let verdict = classify_keywords("qwertyuiop");
        assert_eq!(verdict.intent, Intent::Uncertain);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[tokio::test]
    async fn llm_stage_resolves_ambiguity() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_text("CODING_TASK");
        let (client, emitter) = harness(backend);

        let verdict = classify(
            "make it faster",
            &client,
            &emitter,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(verdict.intent, Intent::CodingTask);
        assert_eq!(verdict.source, "llm");
    }

    #[tokio::test]
    async fn invalid_label_falls_back_to_keywords() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_text("SOMETHING_ELSE");
        let (client, emitter) = harness(backend);

        let verdict = classify(
            "explain the architecture of this repo",
            &client,
            &emitter,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(verdict.intent, Intent::RepoAnalysis);
        assert_eq!(verdict.source, "fallback");
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_uncertain_when_no_keywords() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_error(LlmError::Timeout(1));
        let (client, emitter) = harness(backend);

        let verdict = classify("zzzz", &client, &emitter, &CancellationToken::new()).await;
        assert_eq!(verdict.intent, Intent::Uncertain);
    }

    #[test]
    fn planning_flags() {
        assert!(Intent::CodingTask.planning_enabled());
        assert!(Intent::RepoAnalysis.planning_enabled());
        assert!(!Intent::GeneralChat.planning_enabled());
        assert!(!Intent::CapabilityInquiry.planning_enabled());
        assert!(!Intent::Uncertain.planning_enabled());
    }

    #[test]
    fn labels_round_trip() {
        for intent in Intent::all() {
            assert_eq!(Intent::from_label(intent.as_label()), Some(intent));
        }
    }
}
