//! Shared ops module - used by both build.rs (snapshot) and runtime.rs
//!
//! Holds the `preview_runtime` extension: the platform ops visible to
//! materialized components and the ESM bootstrap that installs the UI
//! runtime and the materialize/render entry points.
//! It must be importable by both the main crate and the build script.

use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};

// ============================================================================
// Console Output Capture
// ============================================================================

/// Console output captured from the isolate since the last drain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[buffer]
pub fn op_crypto_subtle_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    let digest = match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Sha256::digest(data).to_vec(),
        "SHA384" => Sha384::digest(data).to_vec(),
        "SHA512" => Sha512::digest(data).to_vec(),
        _ => return Err(anyhow!("Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512", algorithm)),
    };

    Ok(digest)
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    preview_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_crypto_subtle_digest,
        op_btoa,
        op_atob,
    ],
    esm_entry_point = "ext:preview_runtime/bootstrap.js",
    esm = ["ext:preview_runtime/bootstrap.js" = "src/bootstrap.js"],
);
