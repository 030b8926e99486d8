//! DOM annotation: marks interactable elements with numeric ids and reduces
//! the document to compact markup for the planner.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::ElementId;
use crate::bridge::{Annotate, Bridge, ResolveMarker, Transport};
use crate::{Error, Result};

/// Attribute holding the numeric id the planner refers to.
pub const ID_ATTR: &str = "data-autoflow-id";
/// Attribute holding the unique marker assigned on first resolution.
pub const MARKER_ATTR: &str = "data-autoflow-marker";

/// Page runtime installed into every document. It owns id and marker
/// assignment and answers bridge envelopes through `window.__autoflow.dispatch`.
pub const PAGE_RUNTIME_JS: &str = r#"
(() => {
    if (window.__autoflow) return true;

    const ID_ATTR = 'data-autoflow-id';
    const MARKER_ATTR = 'data-autoflow-marker';
    const INTERACTIVE = 'a, button, input, select, textarea, summary, [role="button"], [role="link"], [role="checkbox"], [role="radio"], [role="tab"], [role="menuitem"], [role="option"], [onclick], [contenteditable="true"]';
    const KEEP = ['aria-label', 'name', 'type', 'placeholder', 'role', 'title', 'alt', 'href', 'for'];
    const SKIP = new Set(['script', 'style', 'noscript', 'template', 'svg', 'canvas', 'head', 'meta', 'link', 'iframe']);
    const state = {
        docId: Date.now().toString(36) + Math.random().toString(36).slice(2, 8),
        nextId: 0,
        nextMarker: 0,
    };

    function clip(s, n) {
        return s.length > n ? s.slice(0, n - 3) + '...' : s;
    }

    function squash(s) {
        return (s || '').replace(/\s+/g, ' ').trim();
    }

    function visible(el) {
        const style = getComputedStyle(el);
        return style.display !== 'none' && style.visibility !== 'hidden' && parseFloat(style.opacity) >= 0.1;
    }

    function interactive(el) {
        if (!el.matches(INTERACTIVE)) return false;
        if (el.disabled || el.getAttribute('aria-disabled') === 'true') return false;
        if (el.tagName === 'INPUT' && el.type === 'hidden') return false;
        const rect = el.getBoundingClientRect();
        return rect.width >= 1 && rect.height >= 1;
    }

    function walk(el) {
        const tag = el.tagName.toLowerCase();
        if (SKIP.has(tag) || !visible(el)) return null;

        const children = [];
        const kids = el.shadowRoot ? [...el.shadowRoot.childNodes, ...el.childNodes] : el.childNodes;
        for (const child of kids) {
            if (child.nodeType === Node.TEXT_NODE) {
                const t = squash(child.textContent);
                if (t) children.push({ text: clip(t, 200) });
            } else if (child.nodeType === Node.ELEMENT_NODE) {
                const node = walk(child);
                if (node) children.push(node);
            }
        }

        const attrs = [];
        for (const name of KEEP) {
            const v = el.getAttribute(name);
            if (v) attrs.push([name, clip(v, 100)]);
        }

        if (interactive(el)) {
            // Existing ids are kept so repeated annotation is a no-op.
            if (!el.hasAttribute(ID_ATTR)) el.setAttribute(ID_ATTR, String(state.nextId++));
            const id = parseInt(el.getAttribute(ID_ATTR), 10);
            const formEl = tag === 'input' || tag === 'textarea' || tag === 'select';
            if (formEl && el.type !== 'password' && el.value) attrs.push(['value', clip(String(el.value), 100)]);
            if (el.checked) attrs.push(['checked', 'true']);
            return { tag, id, attrs, children };
        }

        if (children.length === 0) return null;
        if (attrs.length === 0 && children.length === 1) return children[0];
        return { tag, attrs, children };
    }

    const handlers = {
        annotate() {
            return { doc_id: state.docId, root: document.body ? walk(document.body) : null };
        },
        resolveMarker(args) {
            const el = document.querySelector('[' + ID_ATTR + '="' + Number(args.element_id) + '"]');
            if (!el) return null;
            if (!el.hasAttribute(MARKER_ATTR)) {
                el.setAttribute(MARKER_ATTR, state.docId + '-' + (state.nextMarker++));
            }
            return el.getAttribute(MARKER_ATTR);
        },
        ripple(args) {
            const dot = document.createElement('div');
            dot.style.cssText = 'position:fixed;z-index:2147483647;pointer-events:none;border-radius:50%;'
                + 'width:40px;height:40px;margin:-20px 0 0 -20px;background:rgba(59,130,246,0.4);'
                + 'transition:transform 0.5s ease-out, opacity 0.5s ease-out;';
            dot.style.left = args.x + 'px';
            dot.style.top = args.y + 'px';
            document.documentElement.appendChild(dot);
            requestAnimationFrame(() => {
                dot.style.transform = 'scale(2)';
                dot.style.opacity = '0';
            });
            setTimeout(() => dot.remove(), 600);
            return null;
        },
        copyToClipboard(args) {
            const ta = document.createElement('textarea');
            ta.value = String(args.text);
            ta.style.cssText = 'position:fixed;opacity:0;';
            document.documentElement.appendChild(ta);
            ta.select();
            let ok = false;
            try { ok = document.execCommand('copy'); } catch (e) { ok = false; }
            ta.remove();
            return ok;
        },
    };

    window.__autoflow = {
        dispatch(envelope) {
            const known = Object.prototype.hasOwnProperty.call(handlers, envelope.method);
            if (!known) return JSON.stringify({ replied: false });
            try {
                const value = handlers[envelope.method](envelope.args || {});
                return JSON.stringify({ replied: true, value: value === undefined ? null : value });
            } catch (e) {
                return JSON.stringify({ replied: true, error: String((e && e.message) || e) });
            }
        },
    };
    return true;
})()
"#;

/// One node of the reduced document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotNode {
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ElementId>,
        #[serde(default)]
        attrs: Vec<(String, String)>,
        #[serde(default)]
        children: Vec<SnapshotNode>,
    },
    Text {
        text: String,
    },
}

/// Reply of the `annotate` page method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub doc_id: String,
    pub root: Option<SnapshotNode>,
}

/// Simplified capture of the page taken at the start of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    /// Identity of the document the ids belong to. Changes on navigation.
    pub doc_id: String,
    pub markup: String,
    /// Every id present in `markup`, in document order.
    pub ids: Vec<ElementId>,
}

impl PageSnapshot {
    pub fn from_payload(payload: &SnapshotPayload) -> Self {
        let mut markup = String::new();
        let mut ids = Vec::new();
        if let Some(root) = &payload.root {
            render(root, &mut markup, &mut ids);
        }
        Self {
            doc_id: payload.doc_id.clone(),
            markup,
            ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.markup.is_empty()
    }
}

impl fmt::Display for PageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.markup)
    }
}

fn render(node: &SnapshotNode, out: &mut String, ids: &mut Vec<ElementId>) {
    match node {
        SnapshotNode::Text { text } => out.push_str(text),
        SnapshotNode::Element {
            tag,
            id,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(tag);
            if let Some(id) = id {
                out.push_str(&format!(" id=\"{}\"", id));
                ids.push(*id);
            }
            for (name, value) in attrs {
                out.push_str(&format!(" {}=\"{}\"", name, value.replace('"', "'")));
            }
            if children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in children {
                render(child, out, ids);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
    }
}

/// Regenerable handle to a concrete element of the live document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub id: ElementId,
    pub marker: String,
}

impl Descriptor {
    /// CSS selector matching exactly this element.
    pub fn selector(&self) -> String {
        format!("[{}=\"{}\"]", MARKER_ATTR, self.marker)
    }
}

/// Descriptors keyed by element id, valid for one document.
#[derive(Debug, Default)]
pub struct ElementArena {
    doc_id: Option<String>,
    observed: HashSet<ElementId>,
    descriptors: HashMap<ElementId, Descriptor>,
}

impl ElementArena {
    /// Record a fresh snapshot. Descriptors are dropped when the document
    /// changed; returns `true` in that case.
    pub fn observe(&mut self, snapshot: &PageSnapshot) -> bool {
        let navigated = self.doc_id.as_deref() != Some(snapshot.doc_id.as_str());
        if navigated {
            self.descriptors.clear();
            self.doc_id = Some(snapshot.doc_id.clone());
        }
        self.observed = snapshot.ids.iter().copied().collect();
        navigated
    }

    /// Whether `id` appeared in the most recent snapshot.
    pub fn is_observed(&self, id: ElementId) -> bool {
        self.observed.contains(&id)
    }

    pub fn get(&self, id: ElementId) -> Option<&Descriptor> {
        self.descriptors.get(&id)
    }

    pub fn insert(&mut self, descriptor: Descriptor) {
        self.descriptors.insert(descriptor.id, descriptor);
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Observes the page and dereferences element ids through the arena.
pub struct Annotator<T> {
    bridge: Bridge<T>,
    arena: Mutex<ElementArena>,
}

impl<T: Transport> Annotator<T> {
    pub fn new(bridge: Bridge<T>) -> Self {
        Self {
            bridge,
            arena: Mutex::new(ElementArena::default()),
        }
    }

    pub fn bridge(&self) -> &Bridge<T> {
        &self.bridge
    }

    /// Annotate the live document and return its snapshot. Never cached.
    pub async fn observe(&self) -> Result<PageSnapshot> {
        let payload = self.bridge.call(&Annotate {}).await?;
        let snapshot = PageSnapshot::from_payload(&payload);
        let navigated = self.arena().observe(&snapshot);
        debug!(
            "annotate: {} element(s), {} bytes{}",
            snapshot.ids.len(),
            snapshot.markup.len(),
            if navigated { ", new document" } else { "" }
        );
        Ok(snapshot)
    }

    /// Resolve an id from the latest snapshot to a live element.
    ///
    /// Fails with [`Error::Resolution`] when the id was not in that snapshot
    /// or its element is gone from the document.
    pub async fn resolve(&self, id: ElementId) -> Result<Descriptor> {
        if !self.arena().is_observed(id) {
            return Err(Error::Resolution(format!(
                "element {} is not in the current snapshot",
                id
            )));
        }
        let marker = self
            .bridge
            .call(&ResolveMarker { element_id: id })
            .await?
            .ok_or_else(|| Error::Resolution(format!("element {} not found in the page", id)))?;
        let descriptor = Descriptor { id, marker };
        self.arena().insert(descriptor.clone());
        Ok(descriptor)
    }

    fn arena(&self) -> std::sync::MutexGuard<'_, ElementArena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }
}
