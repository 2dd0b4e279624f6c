//! Module materialization: compiled module text -> live implementation.
//!
//! The compiled text is executed as a procedure with exactly two bound
//! parameters, a `require` resolver backed by the installed
//! [`DependencyRegistry`](crate::registry::DependencyRegistry) and a fresh
//! export record. The procedure sees a two-tier environment through
//! `window`/`self`/`globalThis`: a read-only view of the real globals
//! underneath a private side table that receives every write the module makes.
//!
//! Expected compiled module format (commonjs):
//! ```js
//! "use strict";
//! Object.defineProperty(exports, "__esModule", { value: true });
//! exports.default = void 0;
//! var _react = _interopRequireDefault(require("react"));
//! ...
//! exports.default = MyComponent;
//! ```

use crate::error::PreviewError;
use crate::runtime::{CallError, PreviewRuntime};
use serde::Deserialize;

/// A materialized module's default export, held inside the isolate.
#[derive(Debug, PartialEq, Eq)]
pub struct ModuleHandle {
    id: u64,
    name: String,
}

impl ModuleHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The implementation's declared name (`displayName`, then function name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle not backed by any module, for state-machine tests.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum MaterializeReply {
    Ok { handle: u64, name: String },
    Fault { message: String },
    MissingDefault,
}

/// Turn compiled text into a module handle.
///
/// Faults thrown while the body runs are reported as
/// [`PreviewError::Materialization`]; a body that leaves `exports.default`
/// unset is [`PreviewError::MissingDefaultExport`].
pub fn materialize(runtime: &mut PreviewRuntime, compiled_text: &str) -> Result<ModuleHandle, PreviewError> {
    let literal = serde_json::to_string(compiled_text).map_err(anyhow::Error::from)?;
    let expression = format!("globalThis.__preview_internal__.materialize({})", literal);

    let reply = match runtime.call::<MaterializeReply>("<materialize>", expression) {
        Ok(reply) => reply,
        Err(CallError::TimedOut(ms)) => {
            return Err(PreviewError::Materialization {
                message: format!("module body did not finish within {}ms", ms),
            })
        }
        Err(CallError::Engine(e)) => return Err(PreviewError::Engine(e)),
    };
    runtime.forward_console();

    match reply {
        MaterializeReply::Ok { handle, name } => {
            log::debug!("materialized module #{} ({})", handle, name);
            Ok(ModuleHandle { id: handle, name })
        }
        MaterializeReply::Fault { message } => Err(PreviewError::Materialization { message }),
        MaterializeReply::MissingDefault => Err(PreviewError::MissingDefaultExport),
    }
}

/// Drop the isolate's reference to a module.
pub fn release(runtime: &mut PreviewRuntime, handle: ModuleHandle) {
    #[derive(Deserialize)]
    struct Released {
        released: bool,
    }

    let expression = format!("globalThis.__preview_internal__.release({})", handle.id);
    match runtime.call::<Released>("<release>", expression) {
        Ok(Released { released: true }) => log::debug!("released module #{}", handle.id),
        Ok(Released { released: false }) => log::warn!("module #{} was already released", handle.id),
        Err(e) => log::warn!("failed to release module #{}: {}", handle.id, e),
    }
}

/// Names the module wrote onto its private side table.
pub fn side_table_keys(runtime: &mut PreviewRuntime, handle: &ModuleHandle) -> Result<Vec<String>, CallError> {
    runtime.call(
        "<side-table>",
        format!("globalThis.__preview_internal__.sideTableKeys({})", handle.id),
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::registry::DependencyRegistry;

    fn runtime() -> PreviewRuntime {
        let mut rt = PreviewRuntime::new(&SandboxConfig::default()).unwrap();
        DependencyRegistry::builtin().install(&mut rt).unwrap();
        rt
    }

    #[test]
    fn test_materializes_default_export() {
        let mut rt = runtime();
        let handle = materialize(&mut rt, &fixtures::counter()).unwrap();
        assert_eq!(handle.name(), "MyApp");
    }

    #[test]
    fn test_missing_default_export() {
        let mut rt = runtime();
        let code = "\"use strict\";\nObject.defineProperty(exports, \"__esModule\", { value: true });\nexports.named = 1;";
        let err = materialize(&mut rt, code).unwrap_err();
        assert!(matches!(err, PreviewError::MissingDefaultExport));
    }

    #[test]
    fn test_top_level_throw_is_materialization_fault() {
        let mut rt = runtime();
        let err = materialize(&mut rt, "throw new TypeError('top level');").unwrap_err();
        match err {
            PreviewError::Materialization { message } => assert_eq!(message, "top level"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_surfaces_at_materialization() {
        let mut rt = runtime();
        let err = materialize(&mut rt, "exports.default = ;").unwrap_err();
        assert!(matches!(err, PreviewError::Materialization { .. }));
    }

    #[test]
    fn test_unknown_import_resolves_to_undefined() {
        let mut rt = runtime();
        let code = "if (require('antd') !== undefined) throw new Error('resolved');\nexports.default = function Lookup() { return null; };";
        let handle = materialize(&mut rt, code).unwrap();
        assert_eq!(handle.name(), "Lookup");
    }

    #[test]
    fn test_window_writes_stay_in_side_table() {
        let mut rt = runtime();
        let code = "window.aaa = 111; self.bbb = window.aaa + 1;\nexports.default = function App() { return null; };";
        let handle = materialize(&mut rt, code).unwrap();

        let mut keys = side_table_keys(&mut rt, &handle).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["aaa".to_string(), "bbb".to_string()]);

        let leaked: bool = rt
            .call("<test>", "JSON.stringify('aaa' in globalThis || 'bbb' in globalThis)".into())
            .unwrap();
        assert!(!leaked);
    }

    #[test]
    fn test_platform_names_are_shadowed_in_side_table() {
        let mut rt = runtime();
        let code = "\"use strict\";\n\
                    window.console = null;\n\
                    self.crypto = 'mine';\n\
                    if (window.console !== null || globalThis.crypto !== 'mine') throw new Error('not shadowed');\n\
                    exports.default = function App() { return null; };";
        let handle = materialize(&mut rt, code).unwrap();

        let mut keys = side_table_keys(&mut rt, &handle).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["console".to_string(), "crypto".to_string()]);

        let untouched: bool = rt
            .call(
                "<test>",
                "JSON.stringify(typeof globalThis.console.log === 'function' && typeof globalThis.crypto.randomUUID === 'function')"
                    .into(),
            )
            .unwrap();
        assert!(untouched);
    }

    #[test]
    fn test_platform_view_reads_through_to_real_globals() {
        let mut rt = runtime();
        let code = "\"use strict\";\n\
                    if (window.JSON.stringify(1) !== '1') throw new Error('JSON');\n\
                    if (typeof globalThis.Math !== 'object') throw new Error('Math');\n\
                    if (self.React === undefined || window.Promise === undefined) throw new Error('globals');\n\
                    if (window.__preview_internal__ !== undefined) throw new Error('entry points visible');\n\
                    if (Object.getPrototypeOf(Object.getPrototypeOf(window)) !== null) throw new Error('global reachable');\n\
                    exports.default = function App() { return window.JSON.stringify(1); };";
        let handle = materialize(&mut rt, code).unwrap();
        assert!(side_table_keys(&mut rt, &handle).unwrap().is_empty());
    }

    #[test]
    fn test_non_writable_global_is_shadowed_not_rejected() {
        let mut rt = runtime();
        let code = "\"use strict\";\n\
                    window.undefined = 1;\n\
                    window.__preview_internal__ = 'mine';\n\
                    exports.default = function App() { return null; };";
        let handle = materialize(&mut rt, code).unwrap();

        let mut keys = side_table_keys(&mut rt, &handle).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["__preview_internal__".to_string(), "undefined".to_string()]);

        let intact: bool = rt
            .call("<test>", "JSON.stringify(typeof globalThis.__preview_internal__.render === 'function')".into())
            .unwrap();
        assert!(intact);
    }

    #[test]
    fn test_runaway_module_body_is_materialization_fault() {
        let config = SandboxConfig {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let mut rt = PreviewRuntime::new(&config).unwrap();
        DependencyRegistry::builtin().install(&mut rt).unwrap();

        let err = materialize(&mut rt, "while (true) {}\nexports.default = function Spin() { return null; };").unwrap_err();
        match err {
            PreviewError::Materialization { message } => assert!(message.contains("100ms")),
            other => panic!("unexpected error: {other:?}"),
        }

        let handle = materialize(&mut rt, &fixtures::button_sum()).unwrap();
        assert_eq!(handle.name(), "_default");
    }

    #[test]
    fn test_side_tables_are_private_per_materialization() {
        let mut rt = runtime();
        let writer = "window.shared = 'first'; exports.default = function A() { return null; };";
        let reader = "if (window.shared !== undefined) throw new Error('leaked'); exports.default = function B() { return null; };";

        materialize(&mut rt, writer).unwrap();
        assert!(materialize(&mut rt, reader).is_ok());
    }

    #[test]
    fn test_release_forgets_handle() {
        let mut rt = runtime();
        let handle = materialize(&mut rt, &fixtures::button_sum()).unwrap();
        let id = handle.id();
        release(&mut rt, handle);

        let keys: Vec<String> = rt
            .call("<test>", format!("globalThis.__preview_internal__.sideTableKeys({})", id))
            .unwrap();
        assert!(keys.is_empty());
    }
}
