use crate::bytecode::op::{LDF_ADDRESS_OFFSET, LDF_ENV_EXTENSION_COUNT_OFFSET, LDF_MAX_OS_SIZE_OFFSET};
use crate::bytecode::{Op, Program, Word};
use std::collections::{BTreeSet, HashMap};

/// Print disassembly of a bytecode program
pub fn print_program(program: &Program) {
    println!("=== BYTECODE PROGRAM ===\n");
    print!("{}", format_program(program));
}

/// Return disassembly as a String
///
/// One instruction per line, `AAAA  NAME operands`. Function entry points
/// get a banner, jump targets a `►` marker.
pub fn format_program(program: &Program) -> String {
    let mut output = String::new();
    let jump_targets = collect_jump_targets(program);
    let entries = collect_function_entries(program);

    for (pc, op, operands) in program.instructions() {
        if let Some(slots) = entries.get(&pc) {
            output.push_str("════════════════════════════════════════\n");
            output.push_str(&format!(" function @{:04} ({} slots)\n", pc, slots));
            output.push_str("════════════════════════════════════════\n");
        }
        if jump_targets.contains(&pc) {
            output.push_str("      ┌──────────────────────────────────\n");
        }

        output.push_str(&format!("{:04} ", pc));
        if jump_targets.contains(&pc) {
            output.push_str("► ");
        } else {
            output.push_str("  ");
        }

        output.push_str(&format_instruction(pc, op, operands));
        output.push('\n');
    }

    // Trailing words the walker could not decode
    let decoded: usize = program.instructions().map(|(_, op, _)| op.width()).sum();
    for (address, word) in program.words.iter().enumerate().skip(decoded) {
        output.push_str(&format!("{:04}   ??          {:?}\n", address, word));
    }

    output
}

fn collect_jump_targets(program: &Program) -> BTreeSet<usize> {
    program
        .instructions()
        .filter(|(_, op, _)| op.is_jump())
        .filter_map(|(_, _, operands)| match operands.first() {
            Some(Word::Index(target)) => Some(*target as usize),
            _ => None,
        })
        .collect()
}

/// Entry address of every LDF, mapped to its environment extension count.
fn collect_function_entries(program: &Program) -> HashMap<usize, u32> {
    let mut entries = HashMap::new();
    for (_, op, operands) in program.instructions() {
        if op != Op::Ldf {
            continue;
        }
        let entry = operands.get(LDF_ADDRESS_OFFSET - 1);
        let slots = operands.get(LDF_ENV_EXTENSION_COUNT_OFFSET - 1);
        if let (Some(Word::Index(entry)), Some(Word::Index(slots))) = (entry, slots) {
            entries.insert(*entry as usize, *slots);
        }
    }
    entries
}

fn format_instruction(pc: usize, op: Op, operands: &[Word]) -> String {
    match (op, operands) {
        (Op::Ldcn, [word]) => format!("LDCN        {}", format_word(word)),
        (Op::Ldcb, [word]) => format!("LDCB        {}", format_word(word)),
        (Op::Ld, [word]) => format!("LD          #{}", format_word(word)),
        (Op::Assign, [word]) => format!("ASSIGN      #{}", format_word(word)),
        (Op::Call, [word]) => format!("CALL        {} ; ( f args -- result )", format_word(word)),
        (Op::Jof | Op::Goto, [Word::Index(target)]) => {
            let direction = if (*target as usize) < pc { "↑" } else { "↓" };
            format!("{:<11} {} (→ {:04})", op.name(), direction, target)
        }
        (Op::Ldf, _) => {
            let max_stack = operands.get(LDF_MAX_OS_SIZE_OFFSET - 1);
            let entry = operands.get(LDF_ADDRESS_OFFSET - 1);
            let slots = operands.get(LDF_ENV_EXTENSION_COUNT_OFFSET - 1);
            match (max_stack, entry, slots) {
                (Some(m), Some(Word::Index(a)), Some(s)) => format!(
                    "LDF         @{:04} ; os {} env +{}",
                    a,
                    format_word(m),
                    format_word(s)
                ),
                _ => format!("LDF         {:?}", operands),
            }
        }
        (Op::Div, _) => "DIV         ; halts on zero divisor".to_string(),
        (other, []) => other.name().to_string(),
        (other, rest) => {
            let words: Vec<String> = rest.iter().map(format_word).collect();
            format!("{:<11} {}", other.name(), words.join(" "))
        }
    }
}

fn format_word(word: &Word) -> String {
    match word {
        Word::Op(op) => op.name().to_string(),
        Word::Number(n) => format!("{:?}", n),
        Word::Bool(b) => format!("{}", b),
        Word::Index(i) => format!("{}", i),
        Word::Hole => "<hole>".to_string(),
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Print bytecode statistics
pub fn print_stats(program: &Program) {
    println!("=== BYTECODE STATISTICS ===\n");

    let counts = count_ops(program);
    let total: usize = counts.iter().sum();
    let functions = collect_function_entries(program).len();

    println!("Words:        {}", program.len());
    println!("Instructions: {}", total);
    println!("Functions:    {}", functions);
    println!();

    println!("Op frequency:");
    let mut sorted: Vec<(Op, usize)> = counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .filter_map(|(code, count)| Some((Op::from_code(code as u8)?, *count)))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.code().cmp(&b.0.code())));

    for (op, count) in sorted.iter().take(10) {
        let pct = (*count as f64 / total as f64) * 100.0;
        println!("  {:<8} {:>4} ({:>5.1}%)", op.name(), count, pct);
    }
}

/// Instruction counts indexed by opcode.
fn count_ops(program: &Program) -> [usize; Op::ALL.len()] {
    let mut counts = [0; Op::ALL.len()];
    for (_, op, _) in program.instructions() {
        counts[op.code() as usize] += 1;
    }
    counts
}
