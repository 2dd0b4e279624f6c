//! Per-instance lifecycle: edits in, (code, css) pairs out.
//!
//! A host holds everything one mounted artifact needs between the editor
//! and its isolation boundary: the debounced edits, the ordering gate for
//! compile results, the last good compiled pair, and the editor-side
//! errors. It never talks to the worker itself; the
//! [`Playground`](crate::playground::Playground) routes jobs and
//! completions.

use crate::boundary::{IsolationBoundary, RenderState};
use crate::debounce::Debouncer;
use crate::error::PreviewError;
use crate::identity::InstanceId;
use crate::materializer::{materialize, release};
use crate::runtime::PreviewRuntime;
use crate::sequence::{SequenceGate, Ticket};
use crate::style::StyleScoper;
use crate::transform::{CompilationJob, CompilationResult, LanguageVariant};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

pub struct ComponentHost {
    boundary: IsolationBoundary,
    props: Value,
    language: LanguageVariant,
    /// Last source text handed to the compiler.
    source: String,
    code_gate: SequenceGate,
    source_edits: Debouncer<String>,
    stylesheet_edits: Debouncer<String>,
    compiled_code: Option<String>,
    compiled_css: Option<String>,
    transpile_error: Option<PreviewError>,
    stylesheet_error: Option<PreviewError>,
}

impl ComponentHost {
    pub fn new(name: &str, props: Value, debounce: Duration) -> Self {
        Self {
            boundary: IsolationBoundary::new(InstanceId::mint(), name),
            props,
            language: LanguageVariant::default(),
            source: String::new(),
            code_gate: SequenceGate::new(),
            source_edits: Debouncer::new(debounce),
            stylesheet_edits: Debouncer::new(debounce),
            compiled_code: None,
            compiled_css: None,
            transpile_error: None,
            stylesheet_error: None,
        }
    }

    pub fn identity(&self) -> &InstanceId {
        self.boundary.identity()
    }

    pub fn state(&self) -> RenderState {
        self.boundary.state()
    }

    pub fn fault(&self) -> Option<&PreviewError> {
        self.boundary.fault()
    }

    pub fn transpile_error(&self) -> Option<&PreviewError> {
        self.transpile_error.as_ref()
    }

    pub fn stylesheet_error(&self) -> Option<&PreviewError> {
        self.stylesheet_error.as_ref()
    }

    pub fn compiled_code(&self) -> Option<&str> {
        self.compiled_code.as_deref()
    }

    pub fn compiled_css(&self) -> Option<&str> {
        self.compiled_css.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn language(&self) -> LanguageVariant {
        self.language
    }

    pub fn set_language(&mut self, language: LanguageVariant) {
        self.language = language;
    }

    /// Record source text without compiling it (compiler not ready).
    pub fn set_source(&mut self, text: String) {
        self.source = text;
    }

    pub fn set_props(&mut self, props: Value) {
        self.props = props;
    }

    pub fn edit_source(&mut self, text: String, now: Instant) {
        self.source_edits.push(text, now);
    }

    pub fn edit_stylesheet(&mut self, text: String, now: Instant) {
        self.stylesheet_edits.push(text, now);
    }

    pub fn take_due_source(&mut self, now: Instant) -> Option<String> {
        self.source_edits.take_due(now)
    }

    pub fn take_due_stylesheet(&mut self, now: Instant) -> Option<String> {
        self.stylesheet_edits.take_due(now)
    }

    /// Source and stylesheet edits still waiting, regardless of window.
    pub fn flush_edits(&mut self) -> (Option<String>, Option<String>) {
        (self.source_edits.flush(), self.stylesheet_edits.flush())
    }

    /// Earliest instant at which a waiting edit settles.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.source_edits.deadline(), self.stylesheet_edits.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Build the job for `text` and take a ticket for its result.
    ///
    /// Blank text clears the editor error and yields no job; the last
    /// compiled code stays mounted.
    pub fn prepare_job(
        &mut self,
        text: String,
        module_name: &str,
        dependency_overrides: BTreeMap<String, String>,
    ) -> Option<(Ticket, CompilationJob)> {
        self.transpile_error = None;
        self.source = text;
        if self.source.trim().is_empty() {
            return None;
        }

        let job = CompilationJob {
            source_text: self.source.clone(),
            language_variant: self.language,
            module_name: module_name.to_string(),
            dependency_overrides,
        };
        Some((self.code_gate.issue(), job))
    }

    /// Apply a compile result. Returns whether a new compiled text was
    /// accepted (and the pair must be remounted).
    pub fn accept_compilation(&mut self, ticket: Ticket, result: CompilationResult) -> bool {
        if !self.code_gate.is_current(ticket) {
            log::debug!("dropping stale compile #{} for {}", ticket.value(), self.identity());
            return false;
        }

        match result {
            CompilationResult::Success { compiled_text } => {
                self.transpile_error = None;
                self.compiled_code = Some(compiled_text);
                true
            }
            CompilationResult::Failure { message } => {
                log::debug!("compile #{} for {} rejected: {}", ticket.value(), self.identity(), message);
                self.transpile_error = Some(PreviewError::Transpile(message));
                false
            }
        }
    }

    /// Compile a stylesheet. Returns whether new CSS was accepted.
    ///
    /// Blank text clears the stylesheet error and keeps the last CSS.
    pub fn compile_stylesheet(&mut self, scoper: &StyleScoper, text: &str) -> bool {
        self.stylesheet_error = None;
        if text.trim().is_empty() {
            return false;
        }

        match scoper.compile(text) {
            Ok(css) => {
                self.compiled_css = Some(css);
                true
            }
            Err(diagnostic) => {
                self.stylesheet_error = Some(PreviewError::StyleCompile(diagnostic));
                false
            }
        }
    }

    /// Mount the current (code, css) pair as one unit.
    pub fn remount(&mut self, runtime: &mut PreviewRuntime, scoper: &StyleScoper) {
        let Some(code) = self.compiled_code.as_deref() else {
            return;
        };

        if let Some(displaced) = self.boundary.begin() {
            release(runtime, displaced);
        }

        let displaced = match materialize(runtime, code) {
            Ok(handle) => {
                let style = match self.compiled_css.as_deref() {
                    Some(css) => match scoper.scope(self.boundary.identity(), css) {
                        Ok(style) => Some(style),
                        Err(diagnostic) => {
                            self.stylesheet_error = Some(PreviewError::StyleCompile(diagnostic));
                            None
                        }
                    },
                    None => None,
                };
                log::info!("mounted {} for {}", handle.name(), self.identity());
                self.boundary.succeed(handle, style)
            }
            Err(err) => {
                log::warn!("materialization failed for {}: {}", self.identity(), err);
                self.boundary.fail(err)
            }
        };

        if let Some(handle) = displaced {
            release(runtime, handle);
        }
    }

    /// Rendered container for this instance.
    pub fn render(&mut self, runtime: &mut PreviewRuntime) -> String {
        self.boundary.render(runtime, &self.props)
    }

    /// Drop the mounted module and leave the boundary empty.
    pub fn unmount(mut self, runtime: &mut PreviewRuntime) {
        self.code_gate.invalidate();
        if let Some(handle) = self.boundary.clear() {
            release(runtime, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::css::NestingCompiler;
    use crate::materializer::fixtures;
    use crate::registry::DependencyRegistry;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_millis(500);

    fn runtime() -> PreviewRuntime {
        let mut rt = PreviewRuntime::new(&SandboxConfig::default()).unwrap();
        DependencyRegistry::builtin().install(&mut rt).unwrap();
        rt
    }

    fn compiled(text: String) -> CompilationResult {
        CompilationResult::Success { compiled_text: text }
    }

    #[test]
    fn test_blank_source_yields_no_job() {
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);
        assert!(host.prepare_job("   \n".into(), "index", BTreeMap::new()).is_none());
        assert_eq!(host.state(), RenderState::Idle);
    }

    #[test]
    fn test_pending_job_leaves_boundary_idle() {
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);
        let (ticket, job) = host.prepare_job("export default 1".into(), "index", BTreeMap::new()).unwrap();
        assert_eq!(job.module_name, "index");
        assert_eq!(job.language_variant, LanguageVariant::Javascript);
        assert_eq!(host.state(), RenderState::Idle);

        // A failed first compile has nothing to mount, so nothing to wait for
        let failure = CompilationResult::Failure {
            message: "Unexpected token (1:14)".into(),
        };
        assert!(!host.accept_compilation(ticket, failure));
        assert_eq!(host.state(), RenderState::Idle);
        assert!(host.transpile_error().is_some());
    }

    #[test]
    fn test_older_result_arriving_after_newer_is_dropped() {
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);
        let (a, _) = host.prepare_job("A".into(), "index", BTreeMap::new()).unwrap();
        let (b, _) = host.prepare_job("B".into(), "index", BTreeMap::new()).unwrap();

        assert!(host.accept_compilation(b, compiled("code B".into())));
        assert!(!host.accept_compilation(a, compiled("code A".into())));
        assert_eq!(host.compiled_code(), Some("code B"));
    }

    #[test]
    fn test_transpile_failure_keeps_last_code() {
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);
        let (a, _) = host.prepare_job("A".into(), "index", BTreeMap::new()).unwrap();
        assert!(host.accept_compilation(a, compiled("code A".into())));

        let (b, _) = host.prepare_job("export default".into(), "index", BTreeMap::new()).unwrap();
        let applied = host.accept_compilation(
            b,
            CompilationResult::Failure { message: "Unexpected token (1:14)".into() },
        );

        assert!(!applied);
        assert_eq!(host.compiled_code(), Some("code A"));
        assert!(matches!(host.transpile_error(), Some(PreviewError::Transpile(m)) if !m.is_empty()));
    }

    #[test]
    fn test_stylesheet_error_is_independent_of_transpile_error() {
        let scoper = StyleScoper::new(NestingCompiler);
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);

        assert!(!host.compile_stylesheet(&scoper, "h1{color:"));
        match host.stylesheet_error() {
            Some(PreviewError::StyleCompile(diagnostic)) => {
                assert_eq!((diagnostic.line, diagnostic.column), (1, 0));
            }
            other => panic!("expected stylesheet error, got {other:?}"),
        }
        assert!(host.transpile_error().is_none());

        assert!(host.compile_stylesheet(&scoper, "h1 { color: red }"));
        assert!(host.stylesheet_error().is_none());
    }

    #[test]
    fn test_remount_mounts_pair_and_releases_previous() {
        let mut rt = runtime();
        let scoper = StyleScoper::new(NestingCompiler);
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);

        let (t, _) = host.prepare_job("A".into(), "index", BTreeMap::new()).unwrap();
        host.accept_compilation(t, compiled(fixtures::button_sum()));
        host.compile_stylesheet(&scoper, "button { color: red }");
        host.remount(&mut rt, &scoper);
        assert_eq!(host.state(), RenderState::Ready);

        let html = host.render(&mut rt);
        assert!(html.contains("<button>2</button>"));
        assert!(html.contains(&format!("{} button {{", host.identity().selector())));

        // Same pair again: the old module is released, output unchanged
        host.remount(&mut rt, &scoper);
        assert_eq!(host.render(&mut rt), html);
    }

    #[test]
    fn test_deadline_is_earliest_pending_edit() {
        let start = Instant::now();
        let mut host = ComponentHost::new("MyButton", json!({}), WINDOW);
        assert_eq!(host.deadline(), None);

        host.edit_stylesheet("h1{}".into(), start);
        host.edit_source("export".into(), start + Duration::from_millis(100));
        assert_eq!(host.deadline(), Some(start + WINDOW));

        assert_eq!(host.take_due_stylesheet(start + WINDOW), Some("h1{}".into()));
        assert_eq!(host.take_due_source(start + WINDOW), None);
        assert_eq!(host.deadline(), Some(start + WINDOW + Duration::from_millis(100)));
    }
}
