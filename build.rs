//! Build script to create the V8 snapshot for the preview isolate.
//!
//! The bootstrap module (UI runtime, platform view, materialize/render
//! entry points) is evaluated at build time, so creating a preview
//! runtime only deserializes the snapshot.

use std::env;
use std::path::PathBuf;

// Include the shared ops module using #[path] attribute
// This ensures ops are IDENTICAL between build.rs and runtime
#[path = "src/ops.rs"]
mod ops;

fn main() {
    println!("cargo:rerun-if-changed=src/bootstrap.js");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/ops.rs");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
    let snapshot_path = out_dir.join("PREVIEW_SNAPSHOT.bin");

    let snapshot = deno_core::snapshot::create_snapshot(
        deno_core::snapshot::CreateSnapshotOptions {
            cargo_manifest_dir: env!("CARGO_MANIFEST_DIR"),
            startup_snapshot: None,
            skip_op_registration: false,
            extensions: vec![ops::preview_runtime::init_ops_and_esm()],
            with_runtime_cb: None,
            extension_transpiler: None,
        },
        None, // No warmup script
    )
    .expect("Failed to create snapshot");

    std::fs::write(&snapshot_path, snapshot.output).expect("Failed to write snapshot");

    println!(
        "cargo:warning=Snapshot created at {:?} ({} bytes)",
        snapshot_path,
        std::fs::metadata(&snapshot_path).unwrap().len()
    );
}
