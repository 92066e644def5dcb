#![allow(dead_code)]

use vasm::{
    backend::CompileOptions,
    build_source,
    middle::optimization::OptimizerFlags,
    vm::{CaptureHost, Machine, Strategy, VmConfig, VmError, VmExit},
};

pub const MAX_STEPS: u64 = 1_000_000;

/// Everything a program did that can be observed from outside
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    pub result: Result<VmExit, VmError>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Registers at every syscall
    pub syscalls: Vec<[i64; 32]>,
    pub steps: u64,
}

pub fn options(flags: OptimizerFlags) -> CompileOptions {
    CompileOptions {
        flags,
        ..CompileOptions::default()
    }
}

pub fn run_with(source: &str, flags: OptimizerFlags, strategy: Strategy) -> Outcome {
    let executable = build_source(source, &options(flags))
        .unwrap_or_else(|e| panic!("failed to build:\n{source}\n{e}"));

    let config = VmConfig {
        strategy,
        max_steps: Some(MAX_STEPS),
        ..VmConfig::default()
    };
    let mut machine = Machine::new(config, CaptureHost::default());
    machine.load(&executable).unwrap();

    let result = machine.run();
    let steps = machine.steps();
    let host = machine.into_host();

    Outcome {
        result,
        stdout: host.stdout,
        stderr: host.stderr,
        syscalls: host.syscalls,
        steps,
    }
}

/// Runs with default optimizations on both strategies and checks they agree
pub fn run(source: &str) -> Outcome {
    let direct = run_with(source, OptimizerFlags::default(), Strategy::Direct);
    let threaded = run_with(source, OptimizerFlags::default(), Strategy::Threaded);
    assert_eq!(direct, threaded, "strategies disagree on:\n{source}");
    direct
}

pub fn exit_code(source: &str) -> i64 {
    match run(source).result {
        Ok(VmExit::Exited(code)) => code,
        other => panic!("program didn't exit normally: {other:?}\n{source}"),
    }
}
