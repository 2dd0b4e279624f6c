//! Babel-standalone driven from a dedicated, bare isolate.

use crate::transform::{CompilationJob, CompilationResult, Transpiler, WireResponse};
use anyhow::{anyhow, Context, Result};
use deno_core::{v8, JsRuntime, RuntimeOptions};

const BRIDGE: &str = include_str!("transform_bridge.js");

pub struct BabelTranspiler {
    js: JsRuntime,
}

impl BabelTranspiler {
    pub fn new() -> Result<Self> {
        // No extensions: the compiler needs nothing beyond the language
        let js = JsRuntime::new(RuntimeOptions::default());
        Ok(Self { js })
    }

    fn call_bridge(&mut self, job: &CompilationJob) -> Result<WireResponse> {
        let request = serde_json::to_string(job)?;
        let value = self
            .js
            .execute_script("<transform>", format!("globalThis.__preview_transform__({})", request))?;

        let scope = &mut self.js.handle_scope();
        let local = v8::Local::new(scope, value);
        if !local.is_string() {
            return Err(anyhow!("transform bridge returned a non-string value"));
        }
        let text = local.to_rust_string_lossy(scope);
        serde_json::from_str(&text).context("Malformed transform reply")
    }
}

impl Transpiler for BabelTranspiler {
    fn install(&mut self, runtime_source: &str) -> Result<()> {
        self.js
            .execute_script("<compiler-runtime>", runtime_source.to_string())
            .context("Failed to evaluate compiler runtime")?;
        self.js
            .execute_script("<transform-bridge>", BRIDGE.to_string())
            .context("Failed to install transform bridge")?;
        Ok(())
    }

    fn transform(&mut self, job: &CompilationJob) -> CompilationResult {
        match self.call_bridge(job) {
            Ok(reply) => reply.into(),
            Err(e) => CompilationResult::Failure {
                message: e.to_string(),
            },
        }
    }
}
