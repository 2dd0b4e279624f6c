//! # Preview Sandbox
//!
//! A live component playground built on deno_core: component source and
//! stylesheet source go in, isolated rendered previews come out.
//!
//! ## Pipeline
//!
//! - **Transform requests**: component source is compiled by Babel on a
//!   dedicated worker thread with its own isolate
//! - **Style scoping**: stylesheets are flattened by an in-process nesting
//!   compiler and nested under a per-instance attribute selector
//! - **Module materialization**: compiled commonjs text runs as a
//!   `function (require, exports)` body against a fixed dependency registry
//! - **Isolation boundary**: each instance renders inside its own container;
//!   any fault becomes an error view in that container only
//!
//! ## Isolation
//!
//! The isolation is cooperative, not a security boundary:
//!
//! - **Private side tables**: writes through `window`/`self`/`globalThis`
//!   land in a per-module table, never on the shared platform view
//! - **No system access**: no fs, env, module loader or network in the
//!   preview isolate
//! - **Bounded execution**: heap limit and per-call timeout
//!
//! ## Usage
//!
//! ```rust,ignore
//! use preview_sandbox::{Playground, SandboxConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut playground = Playground::with_babel(SandboxConfig::default())?;
//!     playground.bootstrap().await?;
//!
//!     let id = playground.mount("MyButton", serde_json::json!({}))?;
//!     playground.submit_source(&id, "export default () => <button>{1+1}</button>".into())?;
//!     playground.submit_stylesheet(&id, "button { color: red; }")?;
//!     playground.settle().await;
//!
//!     println!("{}", playground.render_page());
//!     Ok(())
//! }
//! ```

mod babel;
mod boundary;
mod config;
mod css;
mod debounce;
mod error;
mod fetch;
mod host;
mod identity;
mod materializer;
mod ops;
mod playground;
mod props;
mod registry;
mod runtime;
mod sequence;
mod style;
mod transform;

pub use babel::BabelTranspiler;
pub use boundary::{IsolationBoundary, RenderState};
pub use config::SandboxConfig;
pub use css::NestingCompiler;
pub use debounce::Debouncer;
pub use error::{ErrorSlot, PreviewError};
pub use fetch::{fetch_script, FetchConfig};
pub use host::ComponentHost;
pub use identity::{InstanceId, SCOPE_ATTRIBUTE};
pub use materializer::{materialize, release, side_table_keys, ModuleHandle};
pub use ops::ConsoleOutput;
pub use playground::{CompilerStatus, Playground};
pub use props::validate_props;
pub use registry::{load_declared, Dependency, DependencyDeclaration, DependencyRegistry, DependencySource};
pub use runtime::{CallError, PreviewRuntime};
pub use sequence::{SequenceGate, Ticket};
pub use style::{ScopedStyle, StyleCompiler, StyleDiagnostic, StyleScoper};
pub use transform::{CompilationJob, CompilationResult, Completion, LanguageVariant, TransformRequestor, Transpiler};
