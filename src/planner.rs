//! Next-action planning: prompt construction, the model call and its retry policy.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::action::vocabulary;
use crate::annotate::PageSnapshot;
use crate::model::{ChatMessage, CompletionRequest, ModelClient, Usage};
use crate::parse::ParsedResponse;
use crate::{Error, Result};

/// Callback receiving human-readable error notifications.
pub type Notify<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Message sent through [`Notify`] when no credential is configured.
pub const NO_CREDENTIAL: &str = "No OpenAI key found";

/// Raw responses that end the task without an action call.
pub const TERMINAL_MARKERS: [&str; 2] = ["End", "Finish"];

const STOP_SEQUENCE: &str = "</Action>";

/// Settings read at call time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub model: String,
    pub api_key: Option<String>,
}

/// Supplies the active settings at the moment of a planning call.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> Settings;
}

/// A fixed settings value.
impl SettingsSource for Settings {
    fn snapshot(&self) -> Settings {
        self.clone()
    }
}

/// Settings that may change between calls; the latest value wins.
///
/// A missing key falls back to `OPENAI_API_KEY`.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<Settings>>);

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub fn set_model(&self, model: impl Into<String>) {
        self.write().model = model.into();
    }

    pub fn set_api_key(&self, key: Option<String>) {
        self.write().api_key = key;
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Settings> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl SettingsSource for SharedSettings {
    fn snapshot(&self) -> Settings {
        let mut settings = self.0.read().unwrap_or_else(|e| e.into_inner()).clone();
        if settings.api_key.as_deref().map_or(true, str::is_empty) {
            settings.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        }
        settings
    }
}

/// Instructions sent as the system message of every call.
pub fn system_message() -> String {
    format!(
        r#"You are a browser automation assistant.

You can use the following tools:

{}

You will be given tasks to perform in order together with the current state of the DOM. Only perform actions the current page contents allow, otherwise your response will be marked as invalid.
You will be given the history of actions you already performed. Never produce an action that was already performed, otherwise your response will be marked as invalid.
You may retry a failed action at most once.
Do not use quotes or special characters in your response except to delimit string arguments, otherwise your response will be marked as invalid.
When the performed actions cover every task, indicate that the task is complete.

This is an example of an action:

<Thought>I should click the add to cart button</Thought>
<Action>click(223)</Action>

Return exactly one action per response, in the order given by the tasks.
Always include the <Thought> and <Action> open and close tags, otherwise your response will be marked as invalid."#,
        vocabulary()
    )
}

/// Build the user prompt. Prior successful steps are replayed verbatim
/// apart from double quotes, which become single quotes.
///
/// The normalization also applies inside `setValue` values, so a value that
/// itself contains `"` is echoed with `'` and reads back with single quotes.
pub fn format_prompt(
    instruction: &str,
    prior: &[ParsedResponse],
    page: &str,
    now: DateTime<Local>,
) -> String {
    let steps: Vec<String> = prior
        .iter()
        .filter_map(|p| match p {
            ParsedResponse::Success { thought, action } => Some(
                format!("<Thought>{}</Thought>\n<Action>{}</Action>", thought, action)
                    .replace('"', "'"),
            ),
            ParsedResponse::Error { .. } => None,
        })
        .collect();

    let previous = if steps.is_empty() {
        String::new()
    } else {
        format!(
            "You already performed the following actions:\n{}\n\n",
            steps.join("\n\n")
        )
    };

    format!(
        "The user requested the following task:\n\n{}\n\n{}Current time: {}\n\nCurrent page contents:\n{}",
        instruction,
        previous,
        now.format("%Y-%m-%d %H:%M:%S"),
        page
    )
}

/// How the model answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The response was a terminal marker; no action to parse.
    Completed,
    /// The response should hold an action call.
    Proposed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    pub prompt: String,
    /// Trimmed model text; `</Action>` is re-appended for proposals.
    pub response: String,
    pub usage: Usage,
    /// Model calls consumed, including the successful one.
    pub attempts: u32,
    pub outcome: PlanOutcome,
}

pub struct Planner {
    model: Arc<dyn ModelClient>,
    settings: Arc<dyn SettingsSource>,
    max_attempts: u32,
    max_tokens: u32,
}

impl Planner {
    pub fn new(model: impl ModelClient + 'static, settings: impl SettingsSource + 'static) -> Self {
        Self {
            model: Arc::new(model),
            settings: Arc::new(settings),
            max_attempts: 3,
            max_tokens: 500,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    /// Ask the model for the next action.
    ///
    /// Returns `Ok(None)` after notifying when no credential is configured.
    /// Transient failures are notified and retried; anything else aborts.
    pub async fn plan(
        &self,
        instruction: &str,
        prior: &[ParsedResponse],
        snapshot: &PageSnapshot,
        notify: &Notify<'_>,
    ) -> Result<Option<PlanResult>> {
        let settings = self.settings.snapshot();
        let prompt = format_prompt(instruction, prior, &snapshot.markup, Local::now());

        let Some(api_key) = settings.api_key.filter(|k| !k.is_empty()) else {
            warn!("planner: no credential configured");
            notify(NO_CREDENTIAL);
            return Ok(None);
        };

        let request = CompletionRequest {
            model: settings.model,
            api_key,
            messages: vec![
                ChatMessage::system(system_message()),
                ChatMessage::user(prompt.clone()),
            ],
            temperature: 0.0,
            stop: vec![STOP_SEQUENCE.to_string()],
            max_tokens: self.max_tokens,
        };
        debug!("planner: prompt is {} bytes", prompt.len());

        for attempt in 1..=self.max_attempts {
            info!(
                "planner: querying {} (attempt {}/{})",
                request.model, attempt, self.max_attempts
            );
            match self.model.complete(&request).await {
                Ok(completion) => {
                    let text = completion.text.trim();
                    let (response, outcome) = if TERMINAL_MARKERS.contains(&text) {
                        (text.to_string(), PlanOutcome::Completed)
                    } else {
                        (format!("{}{}", text, STOP_SEQUENCE), PlanOutcome::Proposed)
                    };
                    debug!(
                        "planner: {} tokens used, outcome {:?}",
                        completion.usage.total_tokens, outcome
                    );
                    return Ok(Some(PlanResult {
                        prompt,
                        response,
                        usage: completion.usage,
                        attempts: attempt,
                        outcome,
                    }));
                }
                Err(e) if e.transient => {
                    warn!("planner: transient failure on attempt {}: {}", attempt, e);
                    notify(&Error::TransientUpstream(e.message).to_string());
                }
                Err(e) => return Err(Error::Upstream(e.message)),
            }
        }

        Err(Error::AttemptsExhausted {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ElementId};
    use crate::model::{Completion, ModelError};
    use crate::parse::parse_response;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Scripted {
        replies: Arc<Mutex<VecDeque<std::result::Result<Completion, ModelError>>>>,
        requests: Arc<Mutex<Vec<CompletionRequest>>>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<Completion, ModelError>>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                requests: Arc::default(),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> std::result::Result<Completion, ModelError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::fatal("script exhausted")))
        }
    }

    fn text(t: &str) -> std::result::Result<Completion, ModelError> {
        Ok(Completion {
            text: t.into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
            },
        })
    }

    fn keyed() -> Settings {
        Settings {
            model: "gpt-3.5-turbo".into(),
            api_key: Some("sk-test".into()),
        }
    }

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            doc_id: "d".into(),
            markup: "<button id=\"1\">Buy</button>".into(),
            ids: vec![ElementId(1)],
        }
    }

    fn collect() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |m: &str| sink.lock().unwrap().push(m.to_string()))
    }

    #[tokio::test]
    async fn test_no_credential_returns_none_without_call() {
        let model = Scripted::new(vec![text("<Thought>x</Thought><Action>finish()")]);
        let planner = Planner::new(model.clone(), Settings::default());
        let (seen, notify) = collect();

        let result = planner.plan("buy", &[], &snapshot(), &notify).await.unwrap();
        assert!(result.is_none());
        assert_eq!(*seen.lock().unwrap(), vec![NO_CREDENTIAL.to_string()]);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_notify_may_borrow_caller_state() {
        let planner = Planner::new(Scripted::default(), Settings::default());
        let seen = Mutex::new(Vec::new());
        let notify = |m: &str| seen.lock().unwrap().push(m.to_string());

        planner.plan("buy", &[], &snapshot(), &notify).await.unwrap();
        assert_eq!(seen.into_inner().unwrap(), vec![NO_CREDENTIAL.to_string()]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let model = Scripted::new(vec![
            Err(ModelError::transient("The server had an error (server error)")),
            Err(ModelError::transient("server error again")),
            text("<Thought>ok</Thought><Action>click(1)"),
        ]);
        let planner = Planner::new(model.clone(), keyed());
        let (seen, notify) = collect();

        let result = planner
            .plan("buy", &[], &snapshot(), &notify)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(result.outcome, PlanOutcome::Proposed);
        assert_eq!(result.response, "<Thought>ok</Thought><Action>click(1)</Action>");
        assert_eq!(result.usage.total_tokens, 12);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts() {
        let model = Scripted::new(vec![
            Err(ModelError::fatal("invalid api key")),
            text("unused"),
        ]);
        let planner = Planner::new(model.clone(), keyed());
        let (_, notify) = collect();

        let err = planner
            .plan("buy", &[], &snapshot(), &notify)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(ref m) if m == "invalid api key"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let model = Scripted::new(vec![
            Err(ModelError::transient("server error")),
            Err(ModelError::transient("server error")),
        ]);
        let planner = Planner::new(model.clone(), keyed()).max_attempts(2);
        let (_, notify) = collect();

        let err = planner
            .plan("buy", &[], &snapshot(), &notify)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AttemptsExhausted { attempts: 2 }));
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn test_terminal_marker_completes() {
        for marker in ["End", "  Finish\n"] {
            let planner = Planner::new(Scripted::new(vec![text(marker)]), keyed());
            let (_, notify) = collect();
            let result = planner
                .plan("buy", &[], &snapshot(), &notify)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result.outcome, PlanOutcome::Completed);
            assert_eq!(result.response, marker.trim());
        }
    }

    #[tokio::test]
    async fn test_request_shape() {
        let model = Scripted::new(vec![text("<Thought>x</Thought><Action>finish()")]);
        let planner = Planner::new(model.clone(), keyed()).max_tokens(300);
        let (_, notify) = collect();
        planner
            .plan("add the item to the cart", &[], &snapshot(), &notify)
            .await
            .unwrap();

        let req = model.requests.lock().unwrap()[0].clone();
        assert_eq!(req.model, "gpt-3.5-turbo");
        assert_eq!(req.api_key, "sk-test");
        assert_eq!(req.temperature, 0.0);
        assert_eq!(req.stop, vec!["</Action>".to_string()]);
        assert_eq!(req.max_tokens, 300);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert!(req.messages[0].content.contains("1. click(elementId: number)"));
        assert!(req.messages[1].content.contains("add the item to the cart"));
        assert!(req.messages[1].content.contains("<button id=\"1\">Buy</button>"));
    }

    #[test]
    fn test_prompt_without_history() {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let prompt = format_prompt("log in", &[], "<body/>", now);
        assert!(prompt.starts_with("The user requested the following task:\n\nlog in\n\n"));
        assert!(!prompt.contains("already performed"));
        assert!(prompt.contains("Current time: 2024-03-01 09:30:00"));
        assert!(prompt.ends_with("Current page contents:\n<body/>"));
    }

    #[test]
    fn test_prompt_transcript_normalizes_quotes_and_skips_errors() {
        let prior = vec![
            ParsedResponse::Success {
                thought: "type the \"name\"".into(),
                action: Action::SetValue {
                    element_id: ElementId(4),
                    value: "Ada".into(),
                },
            },
            ParsedResponse::Error {
                raw: "garbage".into(),
                reason: "Thought not found in the model response".into(),
            },
            ParsedResponse::Success {
                thought: "submit".into(),
                action: Action::Click {
                    element_id: ElementId(5),
                },
            },
        ];
        let prompt = format_prompt("sign up", &prior, "", Local::now());
        assert!(prompt.contains(
            "You already performed the following actions:\n<Thought>type the 'name'</Thought>\n<Action>setValue(4, 'Ada')</Action>\n\n<Thought>submit</Thought>\n<Action>click(5)</Action>\n\n"
        ));
        assert!(!prompt.contains("garbage"));
    }

    #[test]
    fn test_transcript_echo_reparses_to_same_action() {
        let action = Action::SetValue {
            element_id: ElementId(9),
            value: "42 Main St, Springfield".into(),
        };
        let prior = vec![ParsedResponse::Success {
            thought: "fill the address".into(),
            action: action.clone(),
        }];
        let prompt = format_prompt("ship it", &prior, "", Local::now());
        let start = prompt.find("<Thought>").unwrap();
        let end = prompt.find("</Action>").unwrap() + "</Action>".len();

        let echoed = parse_response(&prompt[start..end]);
        assert_eq!(echoed.action(), Some(&action));
    }

    #[test]
    fn test_shared_settings_latest_value_wins() {
        let shared = SharedSettings::new(Settings {
            model: "gpt-3.5-turbo".into(),
            api_key: Some("sk-one".into()),
        });
        let planner_view = shared.clone();
        shared.set_model("gpt-4");
        shared.set_api_key(Some("sk-two".into()));
        let snap = planner_view.snapshot();
        assert_eq!(snap.model, "gpt-4");
        assert_eq!(snap.api_key.as_deref(), Some("sk-two"));
    }

    #[test]
    fn test_transcript_quotes_inside_values_read_back_single() {
        let prior = vec![ParsedResponse::Success {
            thought: "greet".into(),
            action: Action::SetValue {
                element_id: ElementId(1),
                value: "say \"hi\"".into(),
            },
        }];
        let prompt = format_prompt("greet them", &prior, "", Local::now());
        assert!(prompt.contains("<Action>setValue(1, 'say 'hi'')</Action>"));

        let echoed = parse_response("<Thought>greet</Thought><Action>setValue(1, 'say 'hi'')</Action>");
        assert_eq!(
            echoed.action(),
            Some(&Action::SetValue {
                element_id: ElementId(1),
                value: "say 'hi'".into(),
            })
        );
    }
}
