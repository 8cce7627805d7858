//! Direct vs bridged call latency
//!
//! Run with: cargo run -p tandem-sandbox --example bridge_benchmark --release

use std::path::PathBuf;

use tandem_sandbox::guests::{AddModule, CubeModule, ExportedModule};
use tandem_sandbox::{GuestConfig, WasmBenchmark, WasmConfig, WasmSandbox};

const ITERATIONS: i32 = 10_000;

fn guest(name: &str) -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/guests")).join(name)
}

fn main() {
    println!("=== Direct vs Bridged Calls ===\n");

    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();

    bench_startup(&sandbox);
    bench_cube(&sandbox);
    bench_add(&sandbox);

    println!("\n=== Benchmark Complete ===");
}

fn bench_startup(sandbox: &WasmSandbox) {
    println!("## Startup");

    let mut exported = WasmBenchmark::new("exported new");
    let mut bridged = WasmBenchmark::new("bridged new+close");
    for _ in 0..50 {
        exported.time(|| {
            ExportedModule::new(sandbox, &GuestConfig::exported(guest("exported.wat"))).unwrap()
        });
        bridged.time(|| {
            let cube = CubeModule::new(sandbox, &GuestConfig::imported(guest("cube.wat"))).unwrap();
            cube.close().unwrap()
        });
    }

    println!("  {}", exported.summary());
    println!("  {}", bridged.summary());
    println!();
}

fn bench_cube(sandbox: &WasmSandbox) {
    println!("## cube");

    let mut direct =
        ExportedModule::new(sandbox, &GuestConfig::exported(guest("exported.wat"))).unwrap();
    let bridged = CubeModule::new(sandbox, &GuestConfig::imported(guest("cube.wat"))).unwrap();

    // Warm up
    for i in 0..100 {
        direct.cube(i).unwrap();
        bridged.cube(i).unwrap();
    }

    let mut direct_stats = WasmBenchmark::new("direct");
    let mut bridged_stats = WasmBenchmark::new("bridged");
    for i in 0..ITERATIONS {
        let a = direct_stats.time(|| direct.cube(i).unwrap());
        let b = bridged_stats.time(|| bridged.cube(i).unwrap());
        assert_eq!(a, b);
    }

    println!("  {}", direct_stats.summary());
    println!("  {}", bridged_stats.summary());
    print_ratio(&direct_stats, &bridged_stats);
    bridged.close().unwrap();
    println!();
}

fn bench_add(sandbox: &WasmSandbox) {
    println!("## add (pointer results)");

    let mut direct =
        ExportedModule::new(sandbox, &GuestConfig::exported(guest("exported.wat"))).unwrap();
    let bridged = AddModule::new(sandbox, &GuestConfig::imported(guest("add.wat"))).unwrap();

    let mut direct_stats = WasmBenchmark::new("direct");
    let mut bridged_stats = WasmBenchmark::new("bridged");
    for i in 0..ITERATIONS {
        let a = direct_stats.time(|| direct.add(i, -i / 2).unwrap());
        let b = bridged_stats.time(|| bridged.add(i, -i / 2).unwrap());
        assert_eq!(a, b);
    }

    println!("  {}", direct_stats.summary());
    println!("  {}", bridged_stats.summary());
    print_ratio(&direct_stats, &bridged_stats);
    bridged.close().unwrap();
    println!();
}

fn print_ratio(direct: &WasmBenchmark, bridged: &WasmBenchmark) {
    let direct_ns = direct.mean().as_nanos().max(1) as f64;
    let bridged_ns = bridged.mean().as_nanos() as f64;
    println!("  bridge overhead: {:.1}x", bridged_ns / direct_ns);
}
