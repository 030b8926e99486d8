pub mod schema;

pub use schema::{
    BridgeConfig, BrowserConfig, Config, LimitsConfig, ModelConfig, ReportConfig, TargetUrl,
    TimingConfig, Viewport,
};
