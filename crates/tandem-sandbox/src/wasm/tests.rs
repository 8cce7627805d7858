//! Tests for the sandbox runtime and its configuration.

use super::*;
use crate::error::{Result, SandboxError};

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const ARITH_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (data (i32.const 16) "tandem")
  (func (export "add") (param i32 i32) (result i32)
    local.get 0 local.get 1 i32.add)
  (func (export "widen") (param i32) (result i64)
    local.get 0 i64.extend_i32_s)
  (func (export "halve") (param f64) (result f64)
    local.get 0 f64.const 2 f64.div)
  (func (export "boom") unreachable)
  (func (export "spin") (loop br 0)))
"#;

fn arith_instance() -> WasmInstance<()> {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox.load_module_bytes("arith", ARITH_WAT.as_bytes()).unwrap();
    sandbox.instantiate(&module).unwrap()
}

#[test]
fn test_wasm_config_default() {
    let config = WasmConfig::default();
    assert_eq!(config.max_memory, 64 * 1024 * 1024);
    assert!(config.epoch_interruption);
    assert!(config.fuel_limit.is_none());
    assert!(config.capabilities.stdout);
    assert!(!config.capabilities.stdin);
}

#[test]
fn test_wasm_config_minimal() {
    let config = WasmConfig::minimal();
    assert_eq!(config.max_memory, 16 * 1024 * 1024);
    assert!(config.fuel_limit.is_some());
    assert!(!config.capabilities.stdout);
}

#[test]
fn test_wasm_config_builder_chain() {
    let config = WasmConfig::default()
        .max_memory(128 * 1024 * 1024)
        .fuel_limit(500_000_000)
        .epoch_interruption(false)
        .optimize(9);

    assert_eq!(config.max_memory, 128 * 1024 * 1024);
    assert_eq!(config.fuel_limit, Some(500_000_000));
    assert!(!config.epoch_interruption);
    assert_eq!(config.optimization_level, 3);
}

#[test]
fn test_wasm_config_cache_path() {
    let config = WasmConfig::default().cache("/tmp/tandem-cache.toml");
    assert_eq!(
        config.cache_path.as_deref(),
        Some(std::path::Path::new("/tmp/tandem-cache.toml"))
    );

    // An unreadable cache config is logged and skipped
    assert!(WasmSandbox::new(config).is_ok());
}

#[test]
fn test_wasm_config_partial_json() {
    let config: WasmConfig = serde_json::from_str(r#"{"fuel_limit": 1000}"#).unwrap();
    assert_eq!(config.fuel_limit, Some(1000));
    assert_eq!(config.max_memory, WasmConfig::default().max_memory);
}

#[test]
fn test_wasi_capabilities_builder() {
    let caps = WasiCapabilities::none()
        .stdout(true)
        .stderr(true)
        .env("DEBUG", "1")
        .arg("--verbose");

    assert!(!caps.stdin);
    assert!(caps.stdout);
    assert!(caps.stderr);
    assert_eq!(caps.env_vars.len(), 1);
    assert_eq!(caps.args.len(), 1);
}

#[test]
fn test_preopened_dir_reaches_instance() {
    let dir = std::env::temp_dir();
    let caps = WasiCapabilities::guest().preopened_dir_ro(&dir);
    assert_eq!(caps.preopened_dirs_ro, vec![dir]);

    let sandbox = WasmSandbox::new(WasmConfig::default().capabilities(caps)).unwrap();
    let module = sandbox.load_module_bytes("arith", ARITH_WAT.as_bytes()).unwrap();
    assert!(sandbox.instantiate(&module).is_ok());

    let missing = WasiCapabilities::none().preopened_dir_ro("/nonexistent/tandem");
    let sandbox = WasmSandbox::new(WasmConfig::default().capabilities(missing)).unwrap();
    assert!(matches!(
        sandbox.instantiate(&module),
        Err(SandboxError::WasmError(_))
    ));
}

#[test]
fn test_guest_config_styles() {
    let exported = GuestConfig::exported("add.wasm");
    assert_eq!(exported.init_export.as_deref(), Some(DEFAULT_INIT_EXPORT));
    assert_eq!(exported.namespace, DEFAULT_NAMESPACE);

    let imported = GuestConfig::imported("cube.wasm").namespace("conduit");
    assert!(imported.init_export.is_none());
    assert_eq!(imported.entry_export, DEFAULT_ENTRY_EXPORT);
    assert_eq!(imported.namespace, "conduit");
}

#[test]
fn test_guest_config_deadlines() {
    let config = GuestConfig::imported("cube.wasm");
    assert!(config.submit_deadline().is_none());
    assert_eq!(config.close_deadline(), Duration::from_secs(5));

    let config = config.submit_timeout(Duration::from_millis(250));
    assert_eq!(config.submit_deadline(), Some(Duration::from_millis(250)));
}

#[test]
fn test_sub_millisecond_deadlines_round_up() {
    let config = GuestConfig::imported("cube.wasm")
        .submit_timeout(Duration::from_micros(500))
        .close_timeout(Duration::from_nanos(1));
    assert_eq!(config.submit_deadline(), Some(Duration::from_millis(1)));
    assert_eq!(config.close_deadline(), Duration::from_millis(1));

    let config = config.submit_timeout(Duration::from_micros(1500));
    assert_eq!(config.submit_deadline(), Some(Duration::from_millis(2)));
}

#[test]
fn test_guest_config_json_without_deadline() {
    let config: GuestConfig =
        serde_json::from_str(r#"{"module_path": "cube.wasm", "submit_timeout_ms": null}"#)
            .unwrap();
    assert!(config.submit_deadline().is_none());

    let text = serde_json::to_string(&GuestConfig::imported("cube.wasm")).unwrap();
    assert!(text.contains(r#""submit_timeout_ms":null"#));
}

#[test]
fn test_guest_config_from_json_file() {
    let path = std::env::temp_dir().join(format!("tandem-guest-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{"module_path": "guests/add.wasm", "submit_timeout_ms": 100}"#,
    )
    .unwrap();

    let config = GuestConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.module_path, std::path::PathBuf::from("guests/add.wasm"));
    assert_eq!(config.submit_deadline(), Some(Duration::from_millis(100)));
    assert_eq!(config.entry_export, DEFAULT_ENTRY_EXPORT);
}

#[test]
fn test_sandbox_creation() {
    assert!(WasmSandbox::new(WasmConfig::default()).is_ok());
    assert!(WasmSandbox::new(WasmConfig::minimal()).is_ok());
}

#[test]
fn test_load_missing_module() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let err = sandbox.load_module("/nonexistent/guest.wasm").err().unwrap();
    assert!(matches!(err, SandboxError::ReadModule { .. }));
}

#[test]
fn test_load_invalid_module() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let err = sandbox
        .load_module_bytes("junk", b"\0asm\x02\0\0\0")
        .err()
        .unwrap();
    assert!(matches!(err, SandboxError::Compile(_)));
}

#[test]
fn test_module_exports() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox.load_module_bytes("arith", ARITH_WAT.as_bytes()).unwrap();

    let exports: Vec<_> = module.exports().collect();
    assert!(exports.contains(&"add"));
    assert!(!exports.contains(&"memory"));
    assert_eq!(module.imports().count(), 0);

    let mut instance = sandbox.instantiate(&module).unwrap();
    let mut functions = instance.exported_functions();
    functions.sort();
    assert_eq!(functions, vec!["add", "boom", "halve", "spin", "widen"]);
}

#[test]
fn test_typed_call() {
    let mut instance = arith_instance();

    let result = instance.call::<(i32, i32), i32>("add", (1, 2)).unwrap();
    assert_eq!(result.value, 3);
    assert!(result.fuel_consumed.is_none());

    let wrapped = instance.call::<(i32, i32), i32>("add", (i32::MAX, 1)).unwrap();
    assert_eq!(wrapped.value, i32::MIN);
}

#[test]
fn test_call_export_slots() {
    let mut instance = arith_instance();

    let out = instance.call_export("add", &[encode(2i32), encode(3i32)]).unwrap();
    assert_eq!(out, vec![encode(5i32)]);

    let out = instance.call_export("widen", &[encode(-1i32)]).unwrap();
    assert_eq!(decode::<i64>(out[0]), -1);

    let out = instance.call_export("halve", &[encode(5.0f64)]).unwrap();
    assert_eq!(decode::<f64>(out[0]), 2.5);
}

#[test]
fn test_call_export_errors() {
    let mut instance = arith_instance();

    assert!(matches!(
        instance.call_export("missing", &[]),
        Err(SandboxError::ExportNotFound { .. })
    ));
    assert!(matches!(
        instance.call_export("add", &[encode(1i32)]),
        Err(SandboxError::SlotCount { expected: 2, actual: 1 })
    ));
    match instance.call_export("boom", &[]) {
        Err(SandboxError::Call { export, .. }) => assert_eq!(export, "boom"),
        other => panic!("expected Call error, got {:?}", other),
    }
}

const EXIT_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "quit") i32.const 5 call $exit))
"#;

#[test]
fn test_proc_exit_during_call_reports_exit_code() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox.load_module_bytes("exit", EXIT_WAT.as_bytes()).unwrap();

    let mut instance = sandbox.instantiate(&module).unwrap();
    assert!(matches!(
        instance.call::<(), ()>("quit", ()),
        Err(SandboxError::Exit(5))
    ));

    let mut instance = sandbox.instantiate(&module).unwrap();
    assert!(matches!(
        instance.call_export("quit", &[]),
        Err(SandboxError::Exit(5))
    ));
}

#[test]
fn test_wrong_typed_signature() {
    let mut instance = arith_instance();
    let err = instance.typed_func::<i32, i32>("add").err().unwrap();
    assert!(matches!(err, SandboxError::ExportNotFound { .. }));
}

#[test]
fn test_memory_access() {
    let mut instance = arith_instance();

    assert_eq!(instance.read_memory(16, 6).unwrap(), b"tandem");

    instance.write_memory(64, b"guest").unwrap();
    assert_eq!(instance.read_memory(64, 5).unwrap(), b"guest");

    let page = 64 * 1024;
    assert!(matches!(
        instance.read_memory(page - 2, 4),
        Err(SandboxError::OutOfBounds { .. })
    ));
    assert!(instance.write_memory(page, b"x").is_err());
}

#[test]
fn test_fuel_metering() {
    let sandbox = WasmSandbox::new(WasmConfig::default().fuel_limit(10_000)).unwrap();
    let module = sandbox.load_module_bytes("arith", ARITH_WAT.as_bytes()).unwrap();
    let mut instance = sandbox.instantiate(&module).unwrap();

    let result = instance.call::<(i32, i32), i32>("add", (4, 5)).unwrap();
    assert_eq!(result.value, 9);
    assert!(result.fuel_consumed.unwrap() > 0);

    // An endless loop runs out of fuel instead of hanging
    assert!(instance.call::<(), ()>("spin", ()).is_err());
    assert!(instance.remaining_fuel().unwrap() < 10_000);
}

#[test]
fn test_interrupt_stops_spinning_guest() {
    let mut instance = arith_instance();
    let handle = instance.interrupt_handle();
    let (done_tx, done_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let result = instance.call::<(), ()>("spin", ());
        done_tx.send(result.map(|r| r.value)).unwrap();
    });

    thread::sleep(Duration::from_millis(20));
    assert!(!handle.is_requested());
    handle.interrupt();

    let result = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("guest still spinning after interrupt");
    assert!(matches!(result, Err(SandboxError::Call { .. })));
    worker.join().unwrap();
}

#[test]
fn test_interrupt_is_per_instance() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox.load_module_bytes("arith", ARITH_WAT.as_bytes()).unwrap();
    let first = sandbox.instantiate(&module).unwrap();
    let mut second = sandbox.instantiate(&module).unwrap();

    // Bumps the shared epoch; the second instance keeps running
    first.interrupt_handle().interrupt();
    assert_eq!(second.call::<(i32, i32), i32>("add", (1, 1)).unwrap().value, 2);
}

#[test]
fn test_host_state_reachable_from_import() {
    #[derive(Default)]
    struct Seen {
        values: Vec<i32>,
    }

    const WAT: &str = r#"
    (module
      (import "probe" "record" (func $record (param i32)))
      (memory (export "memory") 1)
      (func (export "run")
        i32.const 7 call $record
        i32.const 9 call $record))
    "#;

    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let mut host = HostModule::<Seen>::new("probe");
    host.register("record", |state: &mut Seen, value: i32| -> Result<()> {
        state.values.push(value);
        Ok(())
    })
    .unwrap();
    let imports = host.compile(sandbox.engine()).unwrap();

    let module = sandbox.load_module_bytes("probe", WAT.as_bytes()).unwrap();
    let state = imports.instantiate(Vec::new()).unwrap();
    let mut instance = sandbox.instantiate_with(&module, &imports, state).unwrap();

    instance.call::<(), ()>("run", ()).unwrap();
    assert_eq!(instance.state().values, vec![7, 9]);
}

#[test]
fn test_missing_import_fails_instantiation() {
    const WAT: &str = r#"
    (module (import "probe" "absent" (func)))
    "#;
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox.load_module_bytes("absent", WAT.as_bytes()).unwrap();
    assert!(matches!(
        sandbox.instantiate(&module),
        Err(SandboxError::Instantiate(_))
    ));
}

#[test]
fn test_benchmark_empty() {
    let bench = WasmBenchmark::new("empty");
    assert_eq!(bench.count(), 0);
    assert_eq!(bench.mean(), Duration::ZERO);
    assert_eq!(bench.percentile(99), Duration::ZERO);
}

#[test]
fn test_benchmark_percentiles() {
    let mut bench = WasmBenchmark::new("direct");
    for i in 1..=100 {
        bench.record(Duration::from_micros(i));
    }

    assert_eq!(bench.count(), 100);
    assert_eq!(bench.min(), Duration::from_micros(1));
    assert_eq!(bench.max(), Duration::from_micros(100));
    // Nearest rank: index 50 of 1..=100 is 51
    assert_eq!(bench.percentile(50), Duration::from_micros(51));
    assert_eq!(bench.percentile(99), Duration::from_micros(100));
    assert_eq!(bench.percentile(250), Duration::from_micros(100));
}

#[test]
fn test_benchmark_time_passes_output_through() {
    let mut bench = WasmBenchmark::new("bridged");
    assert_eq!(bench.label(), "bridged");
    let value = bench.time(|| 125);

    assert_eq!(value, 125);
    assert_eq!(bench.count(), 1);
    assert!(bench.summary().starts_with("bridged: n=1"));
}
