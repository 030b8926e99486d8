//! # autoflow
//!
//! LLM-driven browser task runner. Each instruction line is handled by one
//! observe → plan → parse → act step against a live page.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use autoflow::{
//!     BrowserSession, Config, NoopReporter, OpenAiClient, Planner, SharedSettings,
//!     TaskController,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> autoflow::Result<()> {
//! let config = Config::load("task.yaml")?;
//! let session = Arc::new(BrowserSession::launch(&config.browser).await?);
//! session.goto(&config.target.url).await?;
//!
//! let settings = SharedSettings::new(config.settings());
//! let planner = Planner::new(OpenAiClient::new(&config.model.api_base), settings);
//! let controller = TaskController::builder(planner)
//!     .transport(session.clone())
//!     .driver(session.clone())
//!     .target(session.clone())
//!     .reporter(Arc::new(NoopReporter))
//!     .build()?;
//!
//! let status = controller
//!     .run_task(&config.instructions, &|msg: &str| eprintln!("{msg}"))
//!     .await;
//! println!("finished: {status}");
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod annotate;
pub mod bridge;
pub mod browser;
mod config;
pub mod executor;
pub mod model;
pub mod parse;
pub mod planner;
pub mod report;
pub mod task;

pub use action::{Action, ElementId};
pub use annotate::{Annotator, PageSnapshot};
pub use bridge::{Bridge, Endpoint, Transport};
pub use browser::BrowserSession;
pub use config::{
    BridgeConfig, BrowserConfig, Config, LimitsConfig, ModelConfig, ReportConfig, TargetUrl,
    TimingConfig, Viewport,
};
pub use executor::{Executor, InputDriver, KeyEventKind, Timing};
pub use model::{ModelClient, OpenAiClient, Usage};
pub use parse::{parse_response, ParsedResponse};
pub use planner::{PlanOutcome, Planner, Settings, SettingsSource, SharedSettings};
pub use report::{HttpReporter, NoopReporter, ReportArtifact, Reporter};
pub use task::{
    ActionStatus, ExecutionTarget, HistoryEntry, TaskController, TaskHandle, TaskStatus,
};

/// Result type for autoflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading a run or executing a task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// No credential available for the model boundary.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid model response: {reason}")]
    Parse { raw: String, reason: String },

    #[error("could not resolve element: {0}")]
    Resolution(String),

    #[error("input command rejected: {0}")]
    Command(String),

    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("model request failed: {0}")]
    Upstream(String),

    #[error("failed to complete query after {attempts} attempts, please try again later")]
    AttemptsExhausted { attempts: u32 },

    /// The page never answered a bridge call.
    #[error("channel timeout: {0}")]
    ChannelTimeout(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("step limit of {0} reached")]
    StepLimit(usize),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("report error: {0}")]
    Report(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_exhausted_message() {
        let err = Error::AttemptsExhausted { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "failed to complete query after 3 attempts, please try again later"
        );
    }

    #[test]
    fn test_parse_error_keeps_raw_text() {
        let err = Error::Parse {
            raw: "<Thought>x</Thought>".into(),
            reason: "action not found".into(),
        };
        assert_eq!(err.to_string(), "invalid model response: action not found");
        if let Error::Parse { raw, .. } = err {
            assert_eq!(raw, "<Thought>x</Thought>");
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
name: "Test"
target:
  url: "https://example.com"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.name, "Test");
        assert_eq!(config.target.url, "https://example.com");
        assert!(config.instruction_lines().is_empty());
        assert!(!config.browser.headless);
        assert_eq!(config.model.name, "gpt-3.5-turbo");
        assert_eq!(config.model.api_base, "https://api.openai.com/v1");
        assert_eq!(config.model.max_tokens, 500);
        assert_eq!(config.model.max_attempts, 3);
        assert_eq!(config.limits.max_steps, 50);
        assert_eq!(config.bridge.max_tries, 2);
        assert_eq!(config.timing(), Timing::default());
        assert!(config.report.reporter_url.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
name: "Checkout"
browser:
  headless: true
  proxy: "http://localhost:8080"
  viewport:
    width: 1440
    height: 900
target:
  url: "https://shop.example.com"
model:
  name: "gpt-4"
  api_key: "sk-test"
  api_base: "http://localhost:8000/v1"
  max_attempts: 5
instructions: |
  Search for a red t-shirt

  Add the first result to the cart
timing:
  action_cooldown_ms: 500
  checkbox_offset: [1, 8]
limits:
  max_steps: 10
bridge:
  max_tries: 1
  backoff_ms: 250
report:
  reporter_url: "http://localhost:3000"
  generator_url: "http://localhost:4000"
"#;
        let config = Config::parse(yaml).unwrap();
        assert!(config.browser.headless);
        assert_eq!(config.browser.viewport.as_ref().map(|v| v.width), Some(1440));
        assert_eq!(
            config.instruction_lines(),
            vec!["Search for a red t-shirt", "Add the first result to the cart"]
        );

        let settings = config.settings();
        assert_eq!(settings.model, "gpt-4");
        assert_eq!(settings.api_key.as_deref(), Some("sk-test"));

        let timing = config.timing();
        assert_eq!(timing.action_cooldown, std::time::Duration::from_millis(500));
        assert_eq!(timing.scroll_settle, std::time::Duration::from_millis(1000));
        assert_eq!(timing.checkbox_offset, (1.0, 8.0));

        assert_eq!(config.limits.max_steps, 10);
        assert_eq!(config.bridge.backoff(), std::time::Duration::from_millis(250));
        assert_eq!(
            config.report.generator_url.as_deref(),
            Some("http://localhost:4000")
        );
    }

    #[test]
    fn test_config_validation() {
        let cases = [
            (
                "name: \"\"\ntarget:\n  url: \"https://example.com\"\n",
                "name is required",
            ),
            ("name: \"T\"\ntarget:\n  url: \"\"\n", "target.url is required"),
            (
                "name: \"T\"\ntarget:\n  url: \"https://e.com\"\nlimits:\n  max_steps: 0\n",
                "max_steps",
            ),
            (
                "name: \"T\"\ntarget:\n  url: \"https://e.com\"\nmodel:\n  max_attempts: 0\n",
                "max_attempts",
            ),
            (
                "name: \"T\"\ntarget:\n  url: \"https://e.com\"\nbridge:\n  max_tries: 0\n",
                "max_tries",
            ),
            (
                "name: \"T\"\ntarget:\n  url: \"https://e.com\"\nreport:\n  reporter_url: \" \"\n",
                "report.reporter_url",
            ),
        ];
        for (yaml, expected) in cases {
            match Config::parse(yaml) {
                Err(Error::Config(msg)) => assert!(msg.contains(expected), "{msg}"),
                other => panic!("expected config error for {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_missing_target_is_yaml_error() {
        assert!(matches!(Config::parse("name: \"T\"\n"), Err(Error::Yaml(_))));
    }
}
