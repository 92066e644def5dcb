mod common;

use indoc::{formatdoc, indoc};
use proptest::prelude::*;
use vasm::{
    frontend::{SourceFile, parser::Parser},
    middle::{
        ir::builder::build_module,
        optimization::{OptimizationKind, OptimizerFlags, optimize_function},
    },
    vm::{Strategy, VmExit},
};

use common::{run, run_with};

const PROGRAMS: &[&str] = &[
    indoc! {"
        func main() -> long
            long total = 0
            for i in 0 to 10
                if i % 3 == 0
                    total += i * 8
                else
                    total -= i / 2
                end
            end
            return total
        end
    "},
    indoc! {"
        func collatz(long n) -> long
            long steps = 0
            while n != 1
                if n & 1
                    n = n * 3 + 1
                else
                    n = n / 2
                end
                steps += 1
            end
            return steps
        end

        func main() -> long
            return collatz(27)
        end
    "},
    indoc! {"
        func main() -> long
            long[4] values
            values[0] = 5
            values[1] = 7
            values[2] = values[0] * values[1]
            values[3] = values[2] << 2
            long sum = 0
            for v in values
                sum += v
            end
            return sum
        end
    "},
];

fn optimize_source(source: &str, flags: OptimizerFlags) -> Vec<bool> {
    let source = SourceFile::from_memory(source);
    let module = Parser::parse_module(&source).unwrap();
    let ir = build_module(&module, &source);
    assert!(ir.errors.is_empty(), "{:?}", ir.errors);

    ir.functions
        .into_iter()
        .map(|mut function| {
            optimize_function(&mut function, flags);
            optimize_function(&mut function, flags)
        })
        .collect()
}

#[test]
fn second_run_changes_nothing() {
    for program in PROGRAMS {
        for flags in [OptimizerFlags::default(), OptimizerFlags::all()] {
            let changed = optimize_source(program, flags);
            assert!(changed.iter().all(|changed| !changed), "{program}");
        }
    }
}

#[test]
fn optimizations_preserve_results() {
    for program in PROGRAMS {
        let reference = run_with(program, OptimizerFlags::none(), Strategy::Direct);
        assert!(matches!(reference.result, Ok(VmExit::Exited(_))));

        for flags in [OptimizerFlags::default(), OptimizerFlags::all()] {
            let optimized = run_with(program, flags, Strategy::Direct);
            assert_eq!(optimized.result, reference.result, "{program}");
            assert_eq!(optimized.stdout, reference.stdout);
        }
    }
}

#[test]
fn each_optimization_alone_is_sound() {
    let program = PROGRAMS[0];
    let reference = run_with(program, OptimizerFlags::none(), Strategy::Direct).result;

    for kind in OptimizerFlags::all().iter() {
        let flags = OptimizerFlags::none().with(kind);
        let outcome = run_with(program, flags, Strategy::Direct);
        assert_eq!(outcome.result, reference, "{kind}");
    }
}

#[test]
fn break_inside_if_survives_every_optimization() {
    let program = indoc! {"
        func f(long n) -> long
            long s = 0
            long i = 0
            long j = 0
            while i < n
                j = 0
                while j < n
                    if j == 3
                        break
                    end
                    s += j
                    j += 1
                end
                i += 1
            end
            return s
        end

        func main() -> long
            return f(7)
        end
    "};

    let mut flags = OptimizerFlags::all()
        .iter()
        .map(|kind| OptimizerFlags::none().with(kind))
        .collect::<Vec<_>>();
    flags.extend([OptimizerFlags::none(), OptimizerFlags::all()]);

    for flags in flags {
        for strategy in [Strategy::Direct, Strategy::Threaded] {
            let outcome = run_with(program, flags, strategy);
            assert_eq!(outcome.result, Ok(VmExit::Exited(7 * 3)), "{flags:?}");
        }
    }
}

fn mixing_program(a: i64, b: i64) -> String {
    formatdoc! {"
        func mix(long a, long b) -> long
            long acc = a
            for i in 0 to 8
                if i & 1
                    acc = acc * 3 + b
                else
                    acc = acc / 2 - i
                end
            end
            return acc % 1000
        end

        func main() -> long
            byte[1] out
            long r = mix({a}, {b})
            out[0] = 'a' + (r & 15)
            syscall(1, 1, out.ptr, 1)
            return r
        end
    "}
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn strategies_and_optimizations_agree(a in -100_000i64..100_000, b in -100_000i64..100_000) {
        let source = mixing_program(a, b);

        // checks the direct and threaded runs against each other
        let optimized = run(&source);
        let unoptimized = run_with(&source, OptimizerFlags::none(), Strategy::Threaded);
        let aggressive = run_with(
            &source,
            OptimizerFlags::default().with(OptimizationKind::EliminateNodepends),
            Strategy::Direct,
        );

        prop_assert!(matches!(optimized.result, Ok(VmExit::Exited(_))));
        prop_assert_eq!(&optimized.result, &unoptimized.result);
        prop_assert_eq!(&optimized.stdout, &unoptimized.stdout);
        prop_assert_eq!(&aggressive.result, &unoptimized.result);
        prop_assert_eq!(optimized.stdout.len(), 1);
    }
}
