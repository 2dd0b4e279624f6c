//! Transform requests: compilation jobs served by an out-of-context worker.
//!
//! The worker is a dedicated thread owning its own [`Transpiler`] (and with
//! it its own isolate), so the compiler's workload and environment never
//! touch the preview isolate. Requests are never cancelled; every reply is
//! tagged with the instance and [`Ticket`] it was submitted with, and the
//! receiver drops replies whose ticket is no longer current.

use crate::fetch::{fetch_script, FetchConfig};
use crate::identity::InstanceId;
use crate::sequence::Ticket;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageVariant {
    /// JSX
    #[default]
    #[serde(alias = "base")]
    Javascript,
    /// JSX plus type annotations, stripped by an extra pass
    #[serde(alias = "extended-typed")]
    Typescript,
}

/// One compilation request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationJob {
    pub source_text: String,
    pub language_variant: LanguageVariant,
    pub module_name: String,
    /// import name -> global symbol name
    pub dependency_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationResult {
    Success { compiled_text: String },
    Failure { message: String },
}

/// Reply shape of the compiler bridge.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireResponse {
    Compiled {
        #[serde(rename = "compiledText")]
        compiled_text: String,
    },
    Rejected {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl From<WireResponse> for CompilationResult {
    fn from(response: WireResponse) -> Self {
        match response {
            WireResponse::Compiled { compiled_text } => Self::Success { compiled_text },
            WireResponse::Rejected { error_message } => Self::Failure {
                message: error_message,
            },
        }
    }
}

/// The off-the-shelf compiler, driven from the worker thread.
pub trait Transpiler {
    /// Evaluate the compiler runtime's source text.
    fn install(&mut self, runtime_source: &str) -> Result<()>;

    fn transform(&mut self, job: &CompilationJob) -> CompilationResult;
}

/// Messages delivered back from the worker.
#[derive(Debug)]
pub enum Completion {
    RuntimeLoaded(Result<(), String>),
    Transformed {
        instance: InstanceId,
        ticket: Ticket,
        result: CompilationResult,
    },
}

enum Request {
    LoadRuntime {
        url: String,
        fetch: FetchConfig,
    },
    Transform {
        instance: InstanceId,
        ticket: Ticket,
        job: CompilationJob,
    },
}

/// Handle to the transform worker.
pub struct TransformRequestor {
    requests: Option<mpsc::UnboundedSender<Request>>,
    thread: Option<JoinHandle<()>>,
}

impl TransformRequestor {
    /// Start the worker. `factory` runs on the worker thread, since the
    /// transpiler (and its isolate) cannot move between threads.
    pub fn spawn<F, T>(factory: F, completions: mpsc::UnboundedSender<Completion>) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Transpiler,
    {
        let (requests, receiver) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("transform-worker".into())
            .spawn(move || serve(factory, receiver, completions))
            .map_err(|e| anyhow!("Failed to spawn transform worker: {}", e))?;

        Ok(Self {
            requests: Some(requests),
            thread: Some(thread),
        })
    }

    /// Ask the worker to load the compiler runtime. Answered with
    /// [`Completion::RuntimeLoaded`].
    pub fn load_runtime(&self, url: &str, fetch: FetchConfig) -> Result<()> {
        self.send(Request::LoadRuntime {
            url: url.to_string(),
            fetch,
        })
    }

    /// Submit a job. Answered with [`Completion::Transformed`].
    pub fn request(&self, instance: InstanceId, ticket: Ticket, job: CompilationJob) -> Result<()> {
        log::debug!(
            "submitting {} compile #{} for {} ({} bytes)",
            match job.language_variant {
                LanguageVariant::Javascript => "javascript",
                LanguageVariant::Typescript => "typescript",
            },
            ticket.value(),
            instance,
            job.source_text.len()
        );
        self.send(Request::Transform { instance, ticket, job })
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or_else(|| anyhow!("transform worker is shut down"))?
            .send(request)
            .map_err(|_| anyhow!("transform worker has stopped"))
    }
}

impl Drop for TransformRequestor {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("transform worker panicked");
            }
        }
    }
}

fn serve<F, T>(
    factory: F,
    mut requests: mpsc::UnboundedReceiver<Request>,
    completions: mpsc::UnboundedSender<Completion>,
) where
    F: FnOnce() -> Result<T>,
    T: Transpiler,
{
    let io = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(io) => io,
        Err(e) => {
            log::error!("transform worker could not start its I/O runtime: {}", e);
            return;
        }
    };

    let mut transpiler = match factory() {
        Ok(transpiler) => Some(transpiler),
        Err(e) => {
            log::error!("transform worker could not create its compiler: {}", e);
            None
        }
    };
    let mut installed = false;

    while let Some(request) = requests.blocking_recv() {
        let completion = match request {
            Request::LoadRuntime { url, fetch } => {
                let outcome = match transpiler.as_mut() {
                    Some(transpiler) => io
                        .block_on(fetch_script(&url, &fetch))
                        .and_then(|source| transpiler.install(&source)),
                    None => Err(anyhow!("no compiler available")),
                };
                installed = outcome.is_ok();
                match &outcome {
                    Ok(()) => log::info!("compiler runtime loaded from {}", url),
                    Err(e) => log::error!("compiler runtime failed to load from {}: {}", url, e),
                }
                Completion::RuntimeLoaded(outcome.map_err(|e| e.to_string()))
            }
            Request::Transform { instance, ticket, job } => {
                let result = match transpiler.as_mut() {
                    Some(transpiler) if installed => transpiler.transform(&job),
                    _ => CompilationResult::Failure {
                        message: "compiler runtime is not loaded".to_string(),
                    },
                };
                Completion::Transformed { instance, ticket, result }
            }
        };

        if completions.send(completion).is_err() {
            // Receiver gone: nobody is listening any more
            break;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A transpiler double that maps source text to prepared output.

    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    pub struct TableTranspiler {
        pub outputs: HashMap<String, CompilationResult>,
        /// Per-source delay, to hold a request in flight.
        pub delays: HashMap<String, Duration>,
        pub runtime_marker: Option<String>,
    }

    impl Transpiler for TableTranspiler {
        fn install(&mut self, runtime_source: &str) -> Result<()> {
            match &self.runtime_marker {
                Some(marker) if !runtime_source.contains(marker.as_str()) => {
                    Err(anyhow!("unexpected compiler runtime"))
                }
                _ => Ok(()),
            }
        }

        fn transform(&mut self, job: &CompilationJob) -> CompilationResult {
            if let Some(delay) = self.delays.get(&job.source_text) {
                std::thread::sleep(*delay);
            }
            self.outputs
                .get(&job.source_text)
                .cloned()
                .unwrap_or_else(|| CompilationResult::Failure {
                    message: format!("Unexpected token (1:0) in {}", job.module_name),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TableTranspiler;
    use super::*;
    use crate::sequence::SequenceGate;
    use std::fs;
    use tempfile::tempdir;
    use url::Url;

    fn job(source: &str) -> CompilationJob {
        CompilationJob {
            source_text: source.into(),
            language_variant: LanguageVariant::Javascript,
            module_name: "index".into(),
            dependency_overrides: BTreeMap::new(),
        }
    }

    fn local_runtime() -> (tempfile::TempDir, String, FetchConfig) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compiler.js");
        fs::write(&path, "// compiler runtime").unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();
        let fetch = FetchConfig {
            allowed_origins: vec![],
            local_dir: Some(dir.path().to_path_buf()),
        };
        (dir, url, fetch)
    }

    #[test]
    fn test_job_wire_format() {
        let mut job = job("export default 1");
        job.language_variant = LanguageVariant::Typescript;
        job.dependency_overrides.insert("react".into(), "React".into());

        let wire = serde_json::to_value(&job).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "sourceText": "export default 1",
                "languageVariant": "typescript",
                "moduleName": "index",
                "dependencyOverrides": { "react": "React" }
            })
        );
    }

    #[test]
    fn test_variant_aliases() {
        let typed: LanguageVariant = serde_json::from_str("\"extended-typed\"").unwrap();
        let base: LanguageVariant = serde_json::from_str("\"base\"").unwrap();
        assert_eq!(typed, LanguageVariant::Typescript);
        assert_eq!(base, LanguageVariant::Javascript);
    }

    #[test]
    fn test_wire_response_decoding() {
        let ok: WireResponse = serde_json::from_str(r#"{"compiledText":"x"}"#).unwrap();
        let err: WireResponse = serde_json::from_str(r#"{"errorMessage":"bad"}"#).unwrap();
        assert_eq!(
            CompilationResult::from(ok),
            CompilationResult::Success { compiled_text: "x".into() }
        );
        assert_eq!(
            CompilationResult::from(err),
            CompilationResult::Failure { message: "bad".into() }
        );
    }

    #[tokio::test]
    async fn test_transform_before_runtime_is_refused() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = TransformRequestor::spawn(|| Ok(TableTranspiler::default()), tx).unwrap();
        let mut gate = SequenceGate::new();
        let instance = InstanceId::mint();

        worker.request(instance.clone(), gate.issue(), job("a")).unwrap();
        match rx.recv().await.unwrap() {
            Completion::Transformed { instance: got, result, .. } => {
                assert_eq!(got, instance);
                assert_eq!(
                    result,
                    CompilationResult::Failure { message: "compiler runtime is not loaded".into() }
                );
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_loads_runtime_then_transforms() {
        let (_dir, url, fetch) = local_runtime();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = TransformRequestor::spawn(
            || {
                let mut transpiler = TableTranspiler::default();
                transpiler.runtime_marker = Some("compiler runtime".into());
                transpiler.outputs.insert(
                    "source".into(),
                    CompilationResult::Success { compiled_text: "compiled".into() },
                );
                Ok(transpiler)
            },
            tx,
        )
        .unwrap();

        worker.load_runtime(&url, fetch).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Completion::RuntimeLoaded(Ok(()))));

        let mut gate = SequenceGate::new();
        let ticket = gate.issue();
        worker.request(InstanceId::mint(), ticket, job("source")).unwrap();
        match rx.recv().await.unwrap() {
            Completion::Transformed { ticket: got, result, .. } => {
                assert_eq!(got, ticket);
                assert_eq!(result, CompilationResult::Success { compiled_text: "compiled".into() });
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runtime_load_failure_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = TransformRequestor::spawn(|| Ok(TableTranspiler::default()), tx).unwrap();

        worker
            .load_runtime("https://blocked.example/babel.js", FetchConfig::default())
            .unwrap();
        match rx.recv().await.unwrap() {
            Completion::RuntimeLoaded(Err(message)) => assert!(message.contains("allowlist")),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_factory_still_answers() {
        let (_dir, url, fetch) = local_runtime();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker =
            TransformRequestor::spawn(|| Err::<TableTranspiler, _>(anyhow!("no engine")), tx).unwrap();

        worker.load_runtime(&url, fetch).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Completion::RuntimeLoaded(Err(_))));
    }
}
