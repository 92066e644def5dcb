mod common;

use indoc::indoc;
use vasm::{
    backend::{
        CompileOptions,
        assembler::{AsmItem, assemble, parse_assembly},
        isa::Opcode,
        object::{LinkError, link},
    },
    compile_source,
    frontend::intern::Symbol,
    middle::{
        ir::{Line, Operand},
        optimization::OptimizerFlags,
    },
    vm::{CaptureHost, Strategy, VmConfig, VmExit, run_executable},
};

use common::{exit_code, run, run_with};

fn opcodes(items: &[AsmItem]) -> Vec<Opcode> {
    items
        .iter()
        .filter_map(|item| match item {
            AsmItem::Instruction(instruction) => Some(instruction.opcode()),
            AsmItem::Label(_) => None,
        })
        .collect()
}

#[test]
fn loop_body_runs_five_times() {
    let source = indoc! {"
        func main() -> long
            long count = 0
            for i in 0 to 5
                count += 1
            end
            return count
        end
    "};

    assert_eq!(exit_code(source), 5);

    for strategy in [Strategy::Direct, Strategy::Threaded] {
        let outcome = run_with(source, OptimizerFlags::none(), strategy);
        assert_eq!(outcome.result, Ok(VmExit::Exited(5)));
    }
}

#[test]
fn while_else_and_break() {
    let source = indoc! {"
        func find(long limit) -> long
            long i = 0
            long found = -1
            while i < limit
                if i * i > 50
                    found = i
                    break
                end
                i += 1
            else
                found = 100
            end
            return found
        end

        func main() -> long
            return find(20) * 1000 + find(3)
        end
    "};

    assert_eq!(exit_code(source), 8 * 1000 + 100);
}

#[test]
fn division_by_a_power_of_two_is_a_shift() {
    let source = indoc! {"
        func quarter(long y) -> long
            return y / 4
        end

        func main() -> long
            return quarter(-7) * 100 + quarter(9)
        end
    "};

    let module = compile_source(source, &CompileOptions::default()).unwrap();
    let opcodes = opcodes(&module.items);
    assert!(opcodes.contains(&Opcode::RightShift));
    assert!(!opcodes.contains(&Opcode::Div));

    // division truncates towards zero
    assert_eq!(exit_code(source), -100 + 2);
}

#[test]
fn constant_condition_folds_away() {
    let source = indoc! {"
        func pick() -> long
            if 1 == 1
                return 10
            else
                return 20
            end
        end

        func main() -> long
            return pick()
        end
    "};

    let module = compile_source(source, &CompileOptions::default()).unwrap();
    let pick = module
        .functions
        .iter()
        .find(|f| f.name == Symbol::new("pick"))
        .unwrap();

    assert!(!pick.lines.iter().any(|line| matches!(line, Line::If { .. })));
    assert!(!pick.lines.contains(&Line::Return {
        value: Some(Operand::Literal(20))
    }));
    assert_eq!(exit_code(source), 10);
}

#[test]
fn compiled_code_links_with_assembly() {
    let main = compile_source(
        indoc! {"
            extern func seven() -> long

            func main() -> long
                return seven() * 6
            end
        "},
        &CompileOptions::default(),
    )
    .unwrap();
    let library = assemble(&parse_assembly("seven:\n setb r0, 7; ret").unwrap()).unwrap();

    let executable = link(&[main.object.clone(), library], false).unwrap();
    for strategy in [Strategy::Direct, Strategy::Threaded] {
        let config = VmConfig {
            strategy,
            ..VmConfig::default()
        };
        let (exit, _) = run_executable(&executable, config, CaptureHost::default()).unwrap();
        assert_eq!(exit, VmExit::Exited(42));
    }

    assert_eq!(
        link(&[main.object], false),
        Err(LinkError::UnresolvedSymbol(Symbol::new("seven")))
    );
}

#[test]
fn write_syscall_reaches_stdout() {
    let source = indoc! {"
        func main() -> long
            byte[2] text
            text[0] = 'h'
            text[1] = 'i'
            long written = syscall(1, 1, text.ptr, 2)
            return written
        end
    "};

    let outcome = run(source);
    assert_eq!(outcome.result, Ok(VmExit::Exited(2)));
    assert_eq!(outcome.stdout, b"hi");
    assert!(outcome.stderr.is_empty());
    // write, then exit from the entry stub
    assert_eq!(outcome.syscalls.len(), 2);
}

#[test]
fn arrays_are_passed_by_pointer() {
    let source = indoc! {"
        func fill(long[] values, long n)
            for i in 0 to n
                values[i] = i * i
            end
        end

        func main() -> long
            long[6] squares
            fill(squares, squares.length)
            long total = 0
            for square in squares
                total += square
            end
            return total
        end
    "};

    assert_eq!(exit_code(source), 1 + 4 + 9 + 16 + 25);
}

#[test]
fn inline_assembly_binds_variables() {
    let source = indoc! {"
        func main() -> long
            long x = 20
            long y = 0
            asm [x:r1] -> [y:r2] \"add r2, r1, r1; setb r3, 2; add r2, r2, r3\"
            return y
        end
    "};

    assert_eq!(exit_code(source), 42);
}

#[test]
fn sibling_scopes_redeclare_with_another_width() {
    let source = indoc! {"
        func f(long c) -> long
            long total = 0
            if c
                byte[2] buf
                buf[0] = 1
                total += buf[0]
            end
            if c
                long[2] buf
                buf[0] = 1000
                total += buf[0]
            end
            return total
        end

        func main() -> long
            return f(1)
        end
    "};

    for flags in [OptimizerFlags::none(), OptimizerFlags::default(), OptimizerFlags::all()] {
        for strategy in [Strategy::Direct, Strategy::Threaded] {
            let outcome = run_with(source, flags, strategy);
            assert_eq!(outcome.result, Ok(VmExit::Exited(1001)), "{flags:?}");
        }
    }
}
