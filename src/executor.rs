//! Action execution: turns a typed [`Action`] into pointer and keyboard
//! primitives against a resolved element.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::action::{Action, ElementId};
use crate::annotate::Annotator;
use crate::bridge::{Ripple, Transport};
use crate::{Error, Result};

/// A point in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Element geometry in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }
}

/// Tag and flattened attribute list (`[name, value, name, value, ...]`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub node_name: String,
    pub attributes: Vec<String>,
}

impl NodeInfo {
    pub fn is_checkbox(&self) -> bool {
        self.node_name.eq_ignore_ascii_case("input")
            && self
                .attributes
                .iter()
                .any(|a| a.eq_ignore_ascii_case("checkbox"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEventKind {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    Down,
    Up,
}

/// Low-level input primitives against the live page.
///
/// Selectors passed in always come from [`crate::annotate::Descriptor`].
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn scroll_into_view(&self, selector: &str) -> Result<()>;

    async fn bounding_box(&self, selector: &str) -> Result<Rect>;

    async fn describe(&self, selector: &str) -> Result<NodeInfo>;

    async fn mouse(&self, kind: MouseEventKind, at: Point, click_count: u32) -> Result<()>;

    /// A key-down or key-up event for `ch`. Only key-down carries text.
    async fn key(&self, kind: KeyEventKind, ch: char) -> Result<()>;

    /// Blur whatever element holds focus so change handlers fire.
    async fn blur_active(&self) -> Result<()>;

    /// Diagnostic dot at a click point.
    async fn draw_marker(&self, at: Point) -> Result<()>;

    async fn screenshot(&self) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: InputDriver + ?Sized> InputDriver for Arc<T> {
    async fn scroll_into_view(&self, selector: &str) -> Result<()> {
        (**self).scroll_into_view(selector).await
    }

    async fn bounding_box(&self, selector: &str) -> Result<Rect> {
        (**self).bounding_box(selector).await
    }

    async fn describe(&self, selector: &str) -> Result<NodeInfo> {
        (**self).describe(selector).await
    }

    async fn mouse(&self, kind: MouseEventKind, at: Point, click_count: u32) -> Result<()> {
        (**self).mouse(kind, at, click_count).await
    }

    async fn key(&self, kind: KeyEventKind, ch: char) -> Result<()> {
        (**self).key(kind, ch).await
    }

    async fn blur_active(&self) -> Result<()> {
        (**self).blur_active().await
    }

    async fn draw_marker(&self, at: Point) -> Result<()> {
        (**self).draw_marker(at).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        (**self).screenshot().await
    }
}

/// Where to click an element: its center, shifted by `checkbox_offset` for
/// checkbox inputs so the toggle is hit rather than the label area.
pub fn click_point(rect: Rect, node: &NodeInfo, checkbox_offset: (f64, f64)) -> Point {
    let center = rect.center();
    if node.is_checkbox() {
        Point {
            x: center.x + checkbox_offset.0,
            y: center.y + checkbox_offset.1,
        }
    } else {
        center
    }
}

/// Pauses used while acting on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub scroll_settle: Duration,
    pub click_settle: Duration,
    /// Interval between keystrokes, split evenly around key-down and key-up.
    pub keystroke: Duration,
    /// Pause after every executed action.
    pub action_cooldown: Duration,
    /// Pause between steps.
    pub step_wait: Duration,
    pub checkbox_offset: (f64, f64),
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            scroll_settle: Duration::from_millis(1000),
            click_settle: Duration::from_millis(1000),
            keystroke: Duration::from_millis(100),
            action_cooldown: Duration::from_millis(3000),
            step_wait: Duration::from_millis(2000),
            checkbox_offset: (2.0, 12.0),
        }
    }
}

impl Timing {
    /// No pauses at all; geometry unchanged.
    pub fn immediate() -> Self {
        Self {
            scroll_settle: Duration::ZERO,
            click_settle: Duration::ZERO,
            keystroke: Duration::ZERO,
            action_cooldown: Duration::ZERO,
            step_wait: Duration::ZERO,
            ..Self::default()
        }
    }
}

pub(crate) async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}

/// Input-layer failures become [`Error::Command`]; resolution failures stay as they are.
fn rejected(err: Error) -> Error {
    match err {
        Error::Resolution(_) | Error::Command(_) => err,
        other => Error::Command(other.to_string()),
    }
}

pub struct Executor<D> {
    driver: D,
    timing: Timing,
}

impl<D: InputDriver> Executor<D> {
    pub fn new(driver: D, timing: Timing) -> Self {
        Self { driver, timing }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Execute one action and wait out the post-action cooldown.
    /// Terminal actions touch nothing.
    pub async fn execute<T: Transport>(&self, action: &Action, annotator: &Annotator<T>) -> Result<()> {
        match action {
            Action::Click { element_id } => self.click(*element_id, annotator).await?,
            Action::SetValue { element_id, value } => {
                self.set_value(*element_id, value, annotator).await?
            }
            Action::Finish | Action::Fail => return Ok(()),
        }
        pause(self.timing.action_cooldown).await;
        Ok(())
    }

    async fn click<T: Transport>(&self, id: ElementId, annotator: &Annotator<T>) -> Result<()> {
        let (rect, node) = self.locate(id, annotator).await?;
        let at = click_point(rect, &node, self.timing.checkbox_offset);
        info!("click: element {} at ({:.0}, {:.0})", id, at.x, at.y);

        self.driver.draw_marker(at).await.map_err(rejected)?;
        if let Err(e) = annotator.bridge().call(&Ripple { x: at.x, y: at.y }).await {
            warn!("click: ripple failed: {}", e);
        }
        self.press(at, 1).await
    }

    async fn set_value<T: Transport>(
        &self,
        id: ElementId,
        value: &str,
        annotator: &Annotator<T>,
    ) -> Result<()> {
        let (rect, _) = self.locate(id, annotator).await?;
        let at = rect.center();
        info!("set_value: element {} ({} chars)", id, value.chars().count());

        // Triple click selects existing content so typing replaces it.
        self.press(at, 3).await?;
        let half = self.timing.keystroke / 2;
        for ch in value.chars() {
            self.driver.key(KeyEventKind::Down, ch).await.map_err(rejected)?;
            pause(half).await;
            self.driver.key(KeyEventKind::Up, ch).await.map_err(rejected)?;
            pause(half).await;
        }
        self.driver.blur_active().await.map_err(rejected)
    }

    async fn locate<T: Transport>(
        &self,
        id: ElementId,
        annotator: &Annotator<T>,
    ) -> Result<(Rect, NodeInfo)> {
        let descriptor = annotator.resolve(id).await?;
        let selector = descriptor.selector();
        debug!("locate: element {} -> {}", id, selector);

        self.driver
            .scroll_into_view(&selector)
            .await
            .map_err(rejected)?;
        pause(self.timing.scroll_settle).await;

        let rect = self.driver.bounding_box(&selector).await.map_err(rejected)?;
        let node = self.driver.describe(&selector).await.map_err(rejected)?;
        Ok((rect, node))
    }

    async fn press(&self, at: Point, clicks: u32) -> Result<()> {
        self.driver
            .mouse(MouseEventKind::Pressed, at, clicks)
            .await
            .map_err(rejected)?;
        self.driver
            .mouse(MouseEventKind::Released, at, clicks)
            .await
            .map_err(rejected)?;
        pause(self.timing.click_settle).await;
        Ok(())
    }
}
