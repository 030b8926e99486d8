//! Closed action vocabulary shared by the prompt and the parser.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the annotator assigned to an element of the current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u32);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An action the planner may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum Action {
    Click {
        #[serde(rename = "elementId")]
        element_id: ElementId,
    },
    SetValue {
        #[serde(rename = "elementId")]
        element_id: ElementId,
        value: String,
    },
    Finish,
    Fail,
}

impl Action {
    /// Name as it appears in the action call text.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::SetValue { .. } => "setValue",
            Self::Finish => "finish",
            Self::Fail => "fail",
        }
    }

    /// `finish` and `fail` end the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Fail)
    }

    /// Element this action operates on, if any.
    pub fn element(&self) -> Option<ElementId> {
        match self {
            Self::Click { element_id } | Self::SetValue { element_id, .. } => Some(*element_id),
            Self::Finish | Self::Fail => None,
        }
    }
}

/// Renders the call text, e.g. `click(42)` or `setValue(3, "hello")`.
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Click { element_id } => write!(f, "click({})", element_id),
            Self::SetValue { element_id, value } => {
                write!(f, "setValue({}, \"{}\")", element_id, value)
            }
            Self::Finish => f.write_str("finish()"),
            Self::Fail => f.write_str("fail()"),
        }
    }
}

/// Argument type in the textual schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Number,
    String,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgKind::Number => "number",
            ArgKind::String => "string",
        }
    }
}

/// One argument of an action signature.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
}

/// Signature and description of an action, as shown to the model.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub args: &'static [ArgSpec],
}

/// The closed action set. Order is the order the model sees.
pub const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "click",
        description: "Click on an element",
        args: &[ArgSpec {
            name: "elementId",
            kind: ArgKind::Number,
        }],
    },
    ActionSpec {
        name: "setValue",
        description: "Focus on and set the value of an input element",
        args: &[
            ArgSpec {
                name: "elementId",
                kind: ArgKind::Number,
            },
            ArgSpec {
                name: "value",
                kind: ArgKind::String,
            },
        ],
    },
    ActionSpec {
        name: "finish",
        description: "Indicate that the task is complete",
        args: &[],
    },
    ActionSpec {
        name: "fail",
        description: "Indicate that you are unable to complete the task",
        args: &[],
    },
];

/// Look up an action signature by name.
pub fn spec(name: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|a| a.name == name)
}

/// Numbered vocabulary for the system prompt:
/// `1. click(elementId: number): Click on an element`
pub fn vocabulary() -> String {
    ACTIONS
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let args = a
                .args
                .iter()
                .map(|arg| format!("{}: {}", arg.name, arg.kind.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}. {}({}): {}", i + 1, a.name, args, a.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
