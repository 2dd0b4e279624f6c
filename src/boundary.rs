//! Isolation boundary around one mounted artifact.
//!
//! Renders the wrapped implementation inside an instance-scoped container,
//! places the instance's scoped style next to it, and converts any fault,
//! whether raised before rendering (materialization) or during it, into
//! the same error-state view. Nothing rendered here can disturb output
//! outside the container.

use crate::error::PreviewError;
use crate::identity::InstanceId;
use crate::materializer::ModuleHandle;
use crate::props::validate_props;
use crate::runtime::{CallError, PreviewRuntime};
use crate::style::ScopedStyle;
use serde::Deserialize;
use serde_json::Value;

const LOADING_VIEW: &str = "<div class=\"preview-loading\">loading</div>";

/// Externally visible render state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Idle,
    Loading,
    Ready,
    Faulted,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Loading,
    Ready {
        handle: ModuleHandle,
        style: Option<ScopedStyle>,
    },
    Faulted(PreviewError),
}

#[derive(Debug)]
pub struct IsolationBoundary {
    identity: InstanceId,
    /// Name shown for faults that happen before an implementation exists.
    name: String,
    phase: Phase,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum RenderReply {
    Ok { html: String },
    Fault { message: String },
}

impl IsolationBoundary {
    pub fn new(identity: InstanceId, name: impl Into<String>) -> Self {
        Self {
            identity,
            name: name.into(),
            phase: Phase::Idle,
        }
    }

    pub fn identity(&self) -> &InstanceId {
        &self.identity
    }

    pub fn state(&self) -> RenderState {
        match self.phase {
            Phase::Idle => RenderState::Idle,
            Phase::Loading => RenderState::Loading,
            Phase::Ready { .. } => RenderState::Ready,
            Phase::Faulted(_) => RenderState::Faulted,
        }
    }

    pub fn fault(&self) -> Option<&PreviewError> {
        match &self.phase {
            Phase::Faulted(err) => Some(err),
            _ => None,
        }
    }

    /// A new (code, css) pair is being prepared.
    ///
    /// Each transition returns the module handle it displaced, which the
    /// caller must release.
    #[must_use]
    pub fn begin(&mut self) -> Option<ModuleHandle> {
        self.transition(Phase::Loading)
    }

    #[must_use]
    pub fn succeed(&mut self, handle: ModuleHandle, style: Option<ScopedStyle>) -> Option<ModuleHandle> {
        self.transition(Phase::Ready { handle, style })
    }

    #[must_use]
    pub fn fail(&mut self, error: PreviewError) -> Option<ModuleHandle> {
        self.transition(Phase::Faulted(error))
    }

    /// Leave the boundary empty (unmount).
    #[must_use]
    pub fn clear(&mut self) -> Option<ModuleHandle> {
        self.transition(Phase::Idle)
    }

    fn transition(&mut self, next: Phase) -> Option<ModuleHandle> {
        match std::mem::replace(&mut self.phase, next) {
            Phase::Ready { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Render the container and its contents.
    ///
    /// A render fault moves the boundary to `Faulted`; it stays there until
    /// the next [`begin`](Self::begin).
    pub fn render(&mut self, runtime: &mut PreviewRuntime, props: &Value) -> String {
        let outcome = match &self.phase {
            Phase::Idle => return String::new(),
            Phase::Loading => return self.container(None, LOADING_VIEW),
            Phase::Faulted(err) => return self.container(None, &error_view(&self.name, err)),
            Phase::Ready { handle, style } => (render_handle(runtime, handle, props), style.clone()),
        };

        match outcome {
            (Ok(html), style) => self.container(style.as_ref(), &html),
            (Err(err), _) => {
                log::warn!("instance {} faulted while rendering: {}", self.identity, err);
                let view = error_view(&self.name, &err);
                if let Some(handle) = self.fail(err) {
                    crate::materializer::release(runtime, handle);
                }
                self.container(None, &view)
            }
        }
    }

    fn container(&self, style: Option<&ScopedStyle>, body: &str) -> String {
        let mut out = String::new();
        if let Some(style) = style.filter(|s| !s.css().trim().is_empty()) {
            out.push_str(&format!(
                "<style data-preview-style=\"{}\">\n{}</style>\n",
                self.identity,
                style.css().replace("</style", "<\\/style")
            ));
        }
        out.push_str(&format!("<div {}>{}</div>", self.identity.attribute(), body));
        out
    }
}

fn render_handle(runtime: &mut PreviewRuntime, handle: &ModuleHandle, props: &Value) -> Result<String, PreviewError> {
    validate_props(props)?;

    let props_json = serde_json::to_string(props).map_err(anyhow::Error::from)?;
    let expression = format!(
        "globalThis.__preview_internal__.render({}, {})",
        handle.id(),
        props_json
    );

    let reply = runtime.call::<RenderReply>("<render>", expression);
    runtime.forward_console();

    match reply {
        Ok(RenderReply::Ok { html }) => Ok(html),
        Ok(RenderReply::Fault { message }) => Err(PreviewError::Render {
            component: handle.name().to_string(),
            message,
        }),
        Err(CallError::TimedOut(ms)) => Err(PreviewError::Render {
            component: handle.name().to_string(),
            message: format!("render did not finish within {}ms", ms),
        }),
        Err(CallError::Engine(e)) => Err(PreviewError::Engine(e)),
    }
}

/// The error-state view shared by pre-render and render-time faults.
fn error_view(fallback_name: &str, err: &PreviewError) -> String {
    let name = match err {
        PreviewError::Render { component, .. } if !component.is_empty() => component.as_str(),
        _ => fallback_name,
    };
    format!(
        "<div class=\"preview-error\" role=\"alert\">Remote component {} failed: {}</div>",
        escape_html(name),
        escape_html(&err.to_string())
    )
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
