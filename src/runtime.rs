//! Preview runtime - the V8 isolate that hosts materialized components.
//!
//! Provides only what previews need:
//! - console.log/warn/error (captured, forwarded to the log)
//! - atob, btoa
//! - crypto.randomUUID, crypto.getRandomValues, crypto.subtle.digest
//! - the built-in UI runtime (`React`, `ReactDOM`)
//! - no fs, net, env, module loader or other system access

use crate::config::SandboxConfig;
use crate::ops::{preview_runtime, ConsoleOutput};
use anyhow::{anyhow, Error};
use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static PREVIEW_SNAPSHOT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/PREVIEW_SNAPSHOT.bin"));

/// Failure of a single call into the isolate.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("execution timed out after {0}ms")]
    TimedOut(u64),
    #[error(transparent)]
    Engine(#[from] Error),
}

/// The sandboxed isolate shared by every mounted instance.
pub struct PreviewRuntime {
    js: JsRuntime,
    watchdog: Option<Watchdog>,
}

impl PreviewRuntime {
    /// Create a preview isolate from the build-time snapshot
    pub fn new(config: &SandboxConfig) -> Result<Self, Error> {
        // Configure V8 heap limits if specified
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut js = JsRuntime::new(RuntimeOptions {
            startup_snapshot: Some(PREVIEW_SNAPSHOT),
            extensions: vec![preview_runtime::init_ops()],
            create_params,
            ..Default::default()
        });

        if config.max_heap_size.is_some() {
            let isolate_handle = js.v8_isolate().thread_safe_handle();
            js.add_near_heap_limit_callback(move |current, initial| {
                // Abort the running script and grant headroom so V8 can unwind
                log::warn!(
                    "near heap limit: current={}MB, initial={}MB, terminating execution",
                    current / (1024 * 1024),
                    initial / (1024 * 1024)
                );
                isolate_handle.terminate_execution();
                current * 2
            });
        }

        js.op_state().borrow_mut().put(ConsoleOutput::default());

        let watchdog = match config.timeout_ms {
            Some(ms) => Some(Watchdog::spawn(js.v8_isolate().thread_safe_handle(), ms)?),
            None => None,
        };

        Ok(Self { js, watchdog })
    }

    /// Evaluate a classic script in the global scope (dependency bundles).
    pub fn evaluate_script(&mut self, name: &str, source: &str) -> Result<(), CallError> {
        let script = format!("{}\n//# sourceURL={}\n", source, name);
        self.execute("<dependency>", script).map(|_| ())
    }

    /// Run an expression that evaluates to a JSON string and decode it.
    pub(crate) fn call<T: DeserializeOwned>(
        &mut self,
        name: &'static str,
        expression: String,
    ) -> Result<T, CallError> {
        let value = self.execute(name, expression)?;

        let text = {
            let scope = &mut self.js.handle_scope();
            let local = v8::Local::new(scope, &value);
            if !local.is_string() {
                return Err(anyhow!("{} returned a non-string value", name).into());
            }
            local.to_rust_string_lossy(scope)
        };

        serde_json::from_str(&text)
            .map_err(|e| CallError::Engine(anyhow!("Malformed reply from {}: {}", name, e)))
    }

    fn execute(&mut self, name: &'static str, script: String) -> Result<v8::Global<v8::Value>, CallError> {
        let generation = self.watchdog.as_mut().map(Watchdog::arm);

        let result = self.js.execute_script(name, script);

        let timed_out = match (&self.watchdog, generation) {
            (Some(watchdog), Some(generation)) => watchdog.disarm(generation),
            _ => false,
        };
        if timed_out || result.is_err() {
            // Termination is sticky on the isolate; clear it so it stays usable
            self.js.v8_isolate().cancel_terminate_execution();
        }

        match (result, &self.watchdog) {
            (Ok(value), _) => Ok(value),
            (Err(_), Some(watchdog)) if timed_out => Err(CallError::TimedOut(watchdog.budget_ms)),
            (Err(e), _) => Err(CallError::Engine(e)),
        }
    }

    /// Take the console output captured since the last drain.
    pub fn take_console(&mut self) -> ConsoleOutput {
        let state = self.js.op_state();
        let mut state = state.borrow_mut();
        let output = std::mem::take(state.borrow_mut::<ConsoleOutput>());
        output
    }

    /// Drain captured console output into the log.
    pub fn forward_console(&mut self) {
        let output = self.take_console();
        for line in &output.logs {
            log::info!("[console] {}", line);
        }
        for line in &output.warns {
            log::warn!("[console] {}", line);
        }
        for line in &output.errors {
            log::error!("[console] {}", line);
        }
    }
}

/// One long-lived thread per isolate that terminates any call outliving
/// its budget. Calls arm and disarm it under a shared lock, so a call that
/// returns has either been terminated in full or never will be.
struct Watchdog {
    shared: Arc<(Mutex<WatchState>, Condvar)>,
    thread: Option<JoinHandle<()>>,
    budget_ms: u64,
    generation: u64,
}

#[derive(Default)]
struct WatchState {
    armed: Option<(u64, Instant)>,
    fired: Option<u64>,
    shutdown: bool,
}

impl Watchdog {
    fn spawn(handle: v8::IsolateHandle, budget_ms: u64) -> Result<Self, Error> {
        let shared = Arc::new((Mutex::new(WatchState::default()), Condvar::new()));
        let watched = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("preview-watchdog".into())
            .spawn(move || watch(handle, &watched))?;
        Ok(Self {
            shared,
            thread: Some(thread),
            budget_ms,
            generation: 0,
        })
    }

    /// Start the clock for one call; returns the call's generation.
    fn arm(&mut self) -> u64 {
        self.generation += 1;
        let (lock, signal) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            let deadline = Instant::now() + Duration::from_millis(self.budget_ms);
            state.armed = Some((self.generation, deadline));
            state.fired = None;
        }
        signal.notify_one();
        self.generation
    }

    /// Stop the clock; returns whether it fired for this generation.
    fn disarm(&self, generation: u64) -> bool {
        let (lock, _) = &*self.shared;
        match lock.lock() {
            Ok(mut state) => {
                state.armed = None;
                state.fired.take() == Some(generation)
            }
            Err(_) => false,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let (lock, signal) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.shutdown = true;
        }
        signal.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(handle: v8::IsolateHandle, shared: &(Mutex<WatchState>, Condvar)) {
    let (lock, signal) = shared;
    let Ok(mut state) = lock.lock() else {
        return;
    };
    while !state.shutdown {
        state = match state.armed {
            None => match signal.wait(state) {
                Ok(state) => state,
                Err(_) => return,
            },
            Some((generation, deadline)) => {
                let now = Instant::now();
                if now >= deadline {
                    handle.terminate_execution();
                    state.fired = Some(generation);
                    state.armed = None;
                    continue;
                }
                match signal.wait_timeout(state, deadline - now) {
                    Ok((state, _)) => state,
                    Err(_) => return,
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> PreviewRuntime {
        PreviewRuntime::new(&SandboxConfig::default()).unwrap()
    }

    #[test]
    fn test_call_decodes_json_reply() {
        let mut rt = runtime();
        let value: Vec<u32> = rt.call("<test>", "JSON.stringify([1, 2, 3])".into()).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn test_non_string_reply_is_rejected() {
        let mut rt = runtime();
        let err = rt.call::<u32>("<test>", "42".into()).unwrap_err();
        assert!(err.to_string().contains("non-string"));
    }

    #[test]
    fn test_console_is_captured() {
        let mut rt = runtime();
        rt.evaluate_script("console.js", "console.log('hello', 1); console.warn({a: 1}); console.error('bad')")
            .unwrap();

        let output = rt.take_console();
        assert_eq!(output.logs, vec!["hello 1".to_string()]);
        assert_eq!(output.warns, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(output.errors, vec!["bad".to_string()]);
        assert!(rt.take_console().is_empty());
    }

    #[test]
    fn test_platform_globals() {
        let mut rt = runtime();
        let value: serde_json::Value = rt
            .call(
                "<test>",
                "JSON.stringify({ b: btoa('hi'), a: atob('aGk='), uuid: crypto.randomUUID().length })".into(),
            )
            .unwrap();
        assert_eq!(value["b"], "aGk=");
        assert_eq!(value["a"], "hi");
        assert_eq!(value["uuid"], 36);
    }

    #[test]
    fn test_runaway_script_times_out_and_runtime_recovers() {
        let config = SandboxConfig {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let mut rt = PreviewRuntime::new(&config).unwrap();

        let err = rt.evaluate_script("spin.js", "while (true) {}").unwrap_err();
        assert!(matches!(err, CallError::TimedOut(100)));

        let value: String = rt.call("<test>", "JSON.stringify('alive')".into()).unwrap();
        assert_eq!(value, "alive");
    }

    #[test]
    fn test_watchdog_is_reused_across_calls() {
        let config = SandboxConfig {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let mut rt = PreviewRuntime::new(&config).unwrap();

        for i in 0..200u32 {
            let value: u32 = rt.call("<test>", format!("JSON.stringify({})", i)).unwrap();
            assert_eq!(value, i);
        }

        for _ in 0..2 {
            let err = rt.evaluate_script("spin.js", "while (true) {}").unwrap_err();
            assert!(matches!(err, CallError::TimedOut(100)));
            let value: String = rt.call("<test>", "JSON.stringify('alive')".into()).unwrap();
            assert_eq!(value, "alive");
        }
    }

    #[test]
    fn test_disarmed_watchdog_never_fires_late() {
        let config = SandboxConfig {
            timeout_ms: Some(50),
            ..Default::default()
        };
        let mut rt = PreviewRuntime::new(&config).unwrap();
        rt.evaluate_script("quick.js", "1 + 1").unwrap();

        // Well past the budget of the finished call, the isolate is still usable
        std::thread::sleep(Duration::from_millis(150));
        let value: String = rt.call("<test>", "JSON.stringify('alive')".into()).unwrap();
        assert_eq!(value, "alive");
    }

    #[test]
    fn test_thrown_script_is_engine_error() {
        let mut rt = runtime();
        let err = rt.evaluate_script("throw.js", "throw new Error('boom')").unwrap_err();
        assert!(matches!(err, CallError::Engine(_)));
        assert!(err.to_string().contains("boom"));
    }
}
