use std::{env, fs, path::Path};

use svml::bytecode::Program;
use svml::bytecode::compile::compile;
use svml::bytecode::disasm::{print_program, print_stats};
use svml::lang::node::Node;
use svml::runtime::schedule::GcPolicy;
use svml::runtime::{Vm, VmConfig};

/// Flags that take a value.
const VALUE_FLAGS: [&str; 7] = [
    "--heap",
    "--gc",
    "--seed",
    "--max-ticks",
    "--demo",
    "--emit",
    "--trace",
];

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let disassemble = args.contains(&"--dis".to_string());
    let stats = args.contains(&"--stats".to_string());
    let trace = flag_value(&args, "--trace");
    let config = vm_config(&args);

    if let Some(name) = flag_value(&args, "--demo") {
        let Some((_, source)) = demos().into_iter().find(|(n, _)| *n == name) else {
            eprintln!("Error: unknown demo '{}'", name);
            std::process::exit(1);
        };
        let program = compile_or_exit(&source);
        if let Some(path) = flag_value(&args, "--emit") {
            write_program(&program, path);
            return;
        }
        run_program(program, config, disassemble, stats, trace);
        return;
    }

    match positional(&args) {
        Some(filename) => {
            ensure_extension(filename);
            match fs::read(filename) {
                Ok(bytes) => match Program::from_bytes(&bytes) {
                    Ok(program) => run_program(program, config, disassemble, stats, trace),
                    Err(e) => {
                        eprintln!("Failed to load '{}': {}", filename, e);
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("Failed to read '{}': {}", filename, e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            if args.len() == 1 {
                run_demos();
            } else {
                print_usage();
            }
        }
    }
}

fn print_usage() {
    println!("SVML - compiler and garbage-collected stack machine");
    println!();
    println!("Usage:");
    println!("  svml                          Run the built-in demos");
    println!("  svml <file.svmb>              Run an encoded program");
    println!("  svml --demo <name>            Run one demo ({})", demo_names());
    println!("  svml --demo <name> --emit <file.svmb>");
    println!("                                Write a demo's compiled program");
    println!();
    println!("Options:");
    println!("  --dis                         Print the disassembly before running");
    println!("  --stats                       Print bytecode and heap statistics");
    println!("  --heap N                      Heap size in nodes (default 4096)");
    println!("  --gc POLICY                   schedule:mc... | p:0.2 | off");
    println!("  --seed N                      Seed for the p: policy");
    println!("  --max-ticks N                 Stop after N ticks");
    println!("  --trace FILE                  Write 'P|GC <live nodes>' per tick to FILE");
    println!("  --help, -h                    Show this help");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// First argument that is neither a flag nor a flag's value.
fn positional(args: &[String]) -> Option<&String> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with('-') {
            return Some(arg);
        }
    }
    None
}

fn parse_number(args: &[String], flag: &str) -> Option<u64> {
    let value = flag_value(args, flag)?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            eprintln!("Error: {} expects a number, got '{}'", flag, value);
            std::process::exit(1);
        }
    }
}

fn vm_config(args: &[String]) -> VmConfig {
    let mut config = VmConfig::default();

    if let Some(heap) = parse_number(args, "--heap") {
        config.heap_nodes = heap as usize;
    }
    if let Some(policy) = flag_value(args, "--gc") {
        config.policy = match GcPolicy::parse(policy) {
            Ok(policy) => policy,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        };
    }
    if let Some(seed) = parse_number(args, "--seed") {
        config.policy = config.policy.with_seed(seed);
    }
    if let Some(limit) = parse_number(args, "--max-ticks") {
        config.max_ticks = Some(limit as usize);
    }
    config.record_trace = flag_value(args, "--trace").is_some();

    config
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("svmb") {
        eprintln!("Error: expected a .svmb file, got {}", filename);
        std::process::exit(1);
    }
}

fn compile_or_exit(source: &Node) -> Program {
    match compile(source) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            std::process::exit(1);
        }
    }
}

fn write_program(program: &Program, path: &str) {
    let bytes = match program.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = fs::write(path, &bytes) {
        eprintln!("Failed to write '{}': {}", path, e);
        std::process::exit(1);
    }
    println!("wrote {} ({} bytes, {} words)", path, bytes.len(), program.len());
}

fn write_trace(vm: &Vm, path: &str) {
    let mut out = String::new();
    for sample in vm.trace() {
        out.push_str(&sample.to_string());
        out.push('\n');
    }
    if let Err(e) = fs::write(path, out) {
        eprintln!("Failed to write '{}': {}", path, e);
        std::process::exit(1);
    }
}

fn run_program(
    program: Program,
    config: VmConfig,
    disassemble: bool,
    stats: bool,
    trace: Option<&str>,
) {
    if disassemble {
        print_program(&program);
        println!();
    }
    if stats {
        print_stats(&program);
        println!();
    }

    let mut vm = match Vm::new(program, config) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("Load error: {}", e);
            std::process::exit(1);
        }
    };

    let result = vm.run();

    if let Some(path) = trace {
        write_trace(&vm, path);
    }

    if stats {
        let heap = vm.heap().stats();
        let gc = vm.collector().stats();
        println!("=== MACHINE STATISTICS ===\n");
        println!("Ticks:          {}", vm.ticks());
        println!("Instructions:   {}", vm.instructions());
        println!("Heap:           {} live / {} free / {} total", heap.live, heap.free, heap.capacity);
        println!("GC cycles:      {}", gc.cycles);
        println!("Stop-the-world: {}", gc.stop_the_world);
        println!("Cells freed:    {}", gc.freed);
        println!();
    }

    match result {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
    }
}

// =============================================================================
// Demos
// =============================================================================

fn demos() -> Vec<(&'static str, Node)> {
    vec![
        ("add", Node::binary("+", Node::num(1.0), Node::num(2.0))),
        (
            "arrow",
            Node::apply(
                Node::arrow(&["x", "y"], Node::binary("+", Node::name("x"), Node::name("y"))),
                vec![Node::num(1.0), Node::num(2.0)],
            ),
        ),
        ("factorial", factorial(10.0)),
        ("divide", Node::binary("/", Node::num(1.0), Node::num(0.0))),
        ("loop", counting_loop(1000.0)),
    ]
}

fn demo_names() -> String {
    demos()
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn factorial(n: f64) -> Node {
    Node::seq(vec![
        Node::function(
            "fact",
            &["n"],
            Node::ret(Node::conditional(
                Node::binary("<=", Node::name("n"), Node::num(1.0)),
                Node::num(1.0),
                Node::binary(
                    "*",
                    Node::name("n"),
                    Node::apply(
                        Node::name("fact"),
                        vec![Node::binary("-", Node::name("n"), Node::num(1.0))],
                    ),
                ),
            )),
        ),
        Node::apply(Node::name("fact"), vec![Node::num(n)]),
    ])
}

/// Sum `0..n` in a loop, allocating a few short-lived numbers per turn.
fn counting_loop(n: f64) -> Node {
    let body = Node::seq(vec![
        Node::variable("i", Node::num(0.0)),
        Node::variable("sum", Node::num(0.0)),
        Node::while_loop(
            Node::binary("<", Node::name("i"), Node::num(n)),
            Node::block(Node::seq(vec![
                Node::assign("sum", Node::binary("+", Node::name("sum"), Node::name("i"))),
                Node::assign("i", Node::binary("+", Node::name("i"), Node::num(1.0))),
            ])),
        ),
        Node::ret(Node::name("sum")),
    ]);
    Node::apply(Node::lambda(&[], Node::block(body)), vec![])
}

fn run_demos() {
    println!("demo mode");
    println!();

    for (name, source) in demos() {
        let program = compile_or_exit(&source);
        let result = match Vm::new(program, VmConfig::default()) {
            Ok(mut vm) => vm.run().map(|v| v.to_string()).unwrap_or_else(|e| format!("error: {}", e)),
            Err(e) => format!("error: {}", e),
        };
        println!("  {:<10} {}", name, result);
    }
}
