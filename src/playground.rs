//! The playground: mounted instances sharing one preview isolate, one
//! transform worker and one dependency registry.
//!
//! Everything here runs on the caller's task. The only suspension points
//! are waiting for worker completions and fetching dependency scripts;
//! materialization and mounting are synchronous once their inputs exist.

use crate::babel::BabelTranspiler;
use crate::boundary::escape_html;
use crate::config::SandboxConfig;
use crate::css::NestingCompiler;
use crate::error::PreviewError;
use crate::fetch::FetchConfig;
use crate::host::ComponentHost;
use crate::identity::InstanceId;
use crate::props::validate_props;
use crate::registry::{load_declared, DependencyDeclaration, DependencyRegistry};
use crate::runtime::PreviewRuntime;
use crate::style::{StyleCompiler, StyleScoper};
use crate::transform::{Completion, LanguageVariant, TransformRequestor, Transpiler};
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// State of the compiler runtime inside the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerStatus {
    Unloaded,
    Loading,
    Ready,
    /// Transforms are no-ops until the runtime is loaded again.
    Failed(String),
}

pub struct Playground {
    config: SandboxConfig,
    runtime: PreviewRuntime,
    scoper: StyleScoper,
    transforms: TransformRequestor,
    completions: mpsc::UnboundedReceiver<Completion>,
    registry: DependencyRegistry,
    fetch: FetchConfig,
    compiler: CompilerStatus,
    in_flight: usize,
    hosts: BTreeMap<InstanceId, ComponentHost>,
    dependency_errors: Vec<PreviewError>,
}

impl Playground {
    /// Create the preview isolate, install the built-in registry and start
    /// the transform worker. `transpiler` is invoked on the worker thread.
    pub fn new<F, T>(config: SandboxConfig, transpiler: F, style_compiler: impl StyleCompiler + 'static) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Transpiler,
    {
        let mut runtime = PreviewRuntime::new(&config)?;
        let registry = DependencyRegistry::builtin();
        registry.install(&mut runtime)?;

        let (tx, completions) = mpsc::unbounded_channel();
        let transforms = TransformRequestor::spawn(transpiler, tx)?;
        let fetch = FetchConfig::from(&config);

        Ok(Self {
            config,
            runtime,
            scoper: StyleScoper::new(style_compiler),
            transforms,
            completions,
            registry,
            fetch,
            compiler: CompilerStatus::Unloaded,
            in_flight: 0,
            hosts: BTreeMap::new(),
            dependency_errors: Vec::new(),
        })
    }

    /// Babel for component source, the nesting compiler for stylesheets.
    pub fn with_babel(config: SandboxConfig) -> Result<Self> {
        Self::new(config, BabelTranspiler::new, NestingCompiler::new())
    }

    /// Load the compiler runtime, then compile every instance's source.
    ///
    /// A failure is recorded and returned; the playground stays usable and
    /// transforms become no-ops.
    pub async fn bootstrap(&mut self) -> Result<(), PreviewError> {
        self.compiler = CompilerStatus::Loading;
        self.transforms
            .load_runtime(&self.config.compiler_runtime_url, self.fetch.clone())?;
        self.in_flight += 1;

        while self.compiler == CompilerStatus::Loading {
            if !self.recv_completion().await {
                break;
            }
        }

        match &self.compiler {
            CompilerStatus::Ready => Ok(()),
            CompilerStatus::Failed(reason) => Err(PreviewError::RuntimeBootstrap(reason.clone())),
            _ => Err(PreviewError::RuntimeBootstrap(
                "transform worker stopped".to_string(),
            )),
        }
    }

    pub fn mount(&mut self, name: &str, props: Value) -> Result<InstanceId, PreviewError> {
        validate_props(&props)?;
        let host = ComponentHost::new(name, props, Duration::from_millis(self.config.debounce_ms));
        let id = host.identity().clone();
        log::info!("mounted instance {} ({})", id, name);
        self.hosts.insert(id.clone(), host);
        Ok(id)
    }

    pub fn unmount(&mut self, id: &InstanceId) -> Result<(), PreviewError> {
        let host = self
            .hosts
            .remove(id)
            .ok_or_else(|| PreviewError::UnknownInstance(id.to_string()))?;
        host.unmount(&mut self.runtime);
        log::info!("unmounted instance {}", id);
        Ok(())
    }

    pub fn set_props(&mut self, id: &InstanceId, props: Value) -> Result<(), PreviewError> {
        validate_props(&props)?;
        host_in(&mut self.hosts, id)?.set_props(props);
        Ok(())
    }

    /// Record a source edit; it is compiled once the debounce window passes.
    pub fn edit_source(&mut self, id: &InstanceId, text: String, now: Instant) -> Result<(), PreviewError> {
        host_in(&mut self.hosts, id)?.edit_source(text, now);
        Ok(())
    }

    /// Record a stylesheet edit; it is compiled once the debounce window passes.
    pub fn edit_stylesheet(&mut self, id: &InstanceId, text: String, now: Instant) -> Result<(), PreviewError> {
        host_in(&mut self.hosts, id)?.edit_stylesheet(text, now);
        Ok(())
    }

    /// Submit every edit whose debounce window has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Result<(), PreviewError> {
        let ids: Vec<InstanceId> = self.hosts.keys().cloned().collect();
        for id in ids {
            let Some(host) = self.hosts.get_mut(&id) else {
                continue;
            };
            let stylesheet = host.take_due_stylesheet(now);
            let source = host.take_due_source(now);

            if let Some(text) = stylesheet {
                self.submit_stylesheet(&id, &text)?;
            }
            if let Some(text) = source {
                self.submit_source(&id, text)?;
            }
        }
        Ok(())
    }

    /// Submit every waiting edit without waiting for its window.
    pub fn flush_all(&mut self) -> Result<(), PreviewError> {
        let ids: Vec<InstanceId> = self.hosts.keys().cloned().collect();
        for id in ids {
            let (source, stylesheet) = host_in(&mut self.hosts, &id)?.flush_edits();
            if let Some(text) = stylesheet {
                self.submit_stylesheet(&id, &text)?;
            }
            if let Some(text) = source {
                self.submit_source(&id, text)?;
            }
        }
        Ok(())
    }

    /// When the driving loop should next call [`flush_due`](Self::flush_due).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.hosts.values().filter_map(ComponentHost::deadline).min()
    }

    /// Send source text to the compiler now.
    pub fn submit_source(&mut self, id: &InstanceId, text: String) -> Result<(), PreviewError> {
        let overrides = self.registry.overrides();
        let host = host_in(&mut self.hosts, id)?;

        match &self.compiler {
            CompilerStatus::Ready => {}
            CompilerStatus::Failed(reason) => {
                log::warn!("compile for {} skipped, compiler runtime unavailable: {}", id, reason);
                host.set_source(text);
                return Ok(());
            }
            CompilerStatus::Unloaded | CompilerStatus::Loading => {
                log::debug!("compile for {} deferred until the compiler runtime loads", id);
                host.set_source(text);
                return Ok(());
            }
        }

        if let Some((ticket, job)) = host.prepare_job(text, &self.config.module_name, overrides) {
            self.transforms.request(id.clone(), ticket, job)?;
            self.in_flight += 1;
        }
        Ok(())
    }

    /// Compile a stylesheet now and remount the instance with it.
    pub fn submit_stylesheet(&mut self, id: &InstanceId, text: &str) -> Result<(), PreviewError> {
        let host = host_in(&mut self.hosts, id)?;
        if host.compile_stylesheet(&self.scoper, text) && host.compiled_code().is_some() {
            host.remount(&mut self.runtime, &self.scoper);
        }
        Ok(())
    }

    /// Switch the language variant and recompile immediately.
    pub fn set_language(&mut self, id: &InstanceId, language: LanguageVariant) -> Result<(), PreviewError> {
        let host = host_in(&mut self.hosts, id)?;
        host.set_language(language);
        let source = host.source().to_string();
        self.submit_source(id, source)
    }

    /// Load declared dependency scripts and rebuild the registry from the
    /// built-ins plus every declaration that loaded, then re-materialize
    /// every instance against it.
    ///
    /// Returns the declarations that failed; they never block the others.
    pub async fn declare_dependencies(&mut self, declarations: &[DependencyDeclaration]) -> &[PreviewError] {
        let (loaded, failures) = load_declared(&mut self.runtime, declarations, &self.fetch).await;

        self.registry = DependencyRegistry::builtin().with_declared(&loaded);
        if let Err(e) = self.registry.install(&mut self.runtime) {
            log::error!("failed to install dependency registry: {}", e);
        }
        log::info!(
            "dependency registry rebuilt: {} entries, {} failed declarations",
            self.registry.len(),
            failures.len()
        );

        for host in self.hosts.values_mut() {
            host.remount(&mut self.runtime, &self.scoper);
        }

        self.dependency_errors = failures;
        &self.dependency_errors
    }

    /// Wait for one worker completion and apply it. Returns `false` once
    /// the worker is gone.
    pub async fn recv_completion(&mut self) -> bool {
        match self.next_completion().await {
            Some(completion) => {
                self.apply(completion);
                true
            }
            None => false,
        }
    }

    /// Wait for one worker completion without applying it.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.completions.recv().await
    }

    /// Apply completions until nothing is in flight.
    pub async fn settle(&mut self) {
        while self.in_flight > 0 {
            if !self.recv_completion().await {
                break;
            }
        }
    }

    pub fn apply(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match completion {
            Completion::RuntimeLoaded(Ok(())) => {
                self.compiler = CompilerStatus::Ready;
                let pending: Vec<(InstanceId, String)> = self
                    .hosts
                    .iter()
                    .filter(|(_, host)| !host.source().trim().is_empty())
                    .map(|(id, host)| (id.clone(), host.source().to_string()))
                    .collect();
                for (id, source) in pending {
                    if let Err(e) = self.submit_source(&id, source) {
                        log::error!("failed to submit source for {}: {}", id, e);
                    }
                }
            }
            Completion::RuntimeLoaded(Err(reason)) => {
                log::error!("compiler runtime unavailable, transforms disabled: {}", reason);
                self.compiler = CompilerStatus::Failed(reason);
            }
            Completion::Transformed { instance, ticket, result } => {
                let Some(host) = self.hosts.get_mut(&instance) else {
                    log::debug!("dropping compile #{} for unmounted {}", ticket.value(), instance);
                    return;
                };
                if host.accept_compilation(ticket, result) {
                    host.remount(&mut self.runtime, &self.scoper);
                }
            }
        }
    }

    /// Render one instance's container.
    pub fn render_instance(&mut self, id: &InstanceId) -> Result<String, PreviewError> {
        Ok(host_in(&mut self.hosts, id)?.render(&mut self.runtime))
    }

    /// Render every instance and its editor errors into a host document.
    pub fn render_page(&mut self) -> String {
        let mut body = String::new();

        if let CompilerStatus::Failed(reason) = &self.compiler {
            body.push_str(&format!(
                "<div class=\"preview-runtime-error\" role=\"alert\">{}</div>\n",
                escape_html(&PreviewError::RuntimeBootstrap(reason.clone()).to_string())
            ));
        }

        if !self.dependency_errors.is_empty() {
            body.push_str("<ul class=\"preview-dependency-errors\">\n");
            for err in &self.dependency_errors {
                body.push_str(&format!("<li>{}</li>\n", escape_html(&err.to_string())));
            }
            body.push_str("</ul>\n");
        }

        for (id, host) in self.hosts.iter_mut() {
            body.push_str(&format!("<section class=\"preview-instance\" data-instance=\"{}\">\n", id));
            if let Some(err) = host.transpile_error() {
                body.push_str(&format!(
                    "<pre class=\"preview-editor-error\">{}</pre>\n",
                    escape_html(&err.to_string())
                ));
            }
            if let Some(err) = host.stylesheet_error() {
                body.push_str(&format!(
                    "<pre class=\"preview-stylesheet-error\">{}</pre>\n",
                    escape_html(&err.to_string())
                ));
            }
            body.push_str(&host.render(&mut self.runtime));
            body.push_str("\n</section>\n");
        }

        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Preview</title>\n</head>\n<body>\n{}</body>\n</html>\n",
            body
        )
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&ComponentHost> {
        self.hosts.get(id)
    }

    /// Look an instance up by its displayed form (`p-N`).
    pub fn find_instance(&self, token: &str) -> Option<InstanceId> {
        self.hosts.keys().find(|id| id.to_string() == token).cloned()
    }

    pub fn compiler_status(&self) -> &CompilerStatus {
        &self.compiler
    }

    pub fn registry(&self) -> &DependencyRegistry {
        &self.registry
    }

    pub fn dependency_errors(&self) -> &[PreviewError] {
        &self.dependency_errors
    }

    /// Requests sent to the worker and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

fn host_in<'a>(
    hosts: &'a mut BTreeMap<InstanceId, ComponentHost>,
    id: &InstanceId,
) -> Result<&'a mut ComponentHost, PreviewError> {
    hosts
        .get_mut(id)
        .ok_or_else(|| PreviewError::UnknownInstance(id.to_string()))
}
