use crate::bytecode::compile_error::CompileError;
use crate::bytecode::index_table::IndexTable;
use crate::bytecode::verify::verify;
use crate::bytecode::{Op, Program, Word};
use crate::lang::node::{Literal, Node};

/// Compile a whole program.
pub fn compile(program: &Node) -> Result<Program, CompileError> {
    Compiler::new().compile(program)
}

/// A function body whose code has not been emitted yet.
///
/// `max_stack_site` and `address_site` are the LDF operand words to patch
/// once the body's depth and entry address are known.
struct CompileTask<'a> {
    body: &'a Node,
    max_stack_site: usize,
    address_site: usize,
    table: IndexTable,
}

/// Something the code generator can evaluate onto the operand stack.
///
/// Desugaring produces operands that have no node of their own (the literal
/// branches of `&&`/`||`, the lambda behind a function declaration); they
/// borrow their pieces from the source tree so deferred compile tasks can
/// keep pointing into it.
#[derive(Clone, Copy)]
enum Operand<'a> {
    Node(&'a Node),
    Bool(bool),
    Lambda {
        parameters: &'a [String],
        body: &'a Node,
    },
}

/// Single-pass code generator.
///
/// Instructions go straight into one growing buffer. Function bodies are
/// deferred: their LDF is emitted with two holes and a compile task is
/// pushed; tasks are drained last-in first-out after the enclosing body is
/// done, each one patching its own holes.
///
/// Every `compile_*` method returns the maximum operand-stack depth the code
/// it emitted can reach.
pub struct Compiler<'a> {
    code: Vec<Word>,
    tasks: Vec<CompileTask<'a>>,
    toplevel: bool,
}

impl<'a> Compiler<'a> {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            tasks: Vec::new(),
            toplevel: true,
        }
    }

    /// Compile `program` as the body of a nullary function that is called
    /// once by the entry sequence `START; LDF; CALL 0; DONE`.
    pub fn compile(mut self, program: &'a Node) -> Result<Program, CompileError> {
        let locals = scan_declarations(program);

        self.emit(Op::Start, &[]);
        let (max_stack_site, address_site) = self.emit_ldf(locals.len());
        self.emit(Op::Call, &[Word::Index(0)]);
        self.emit(Op::Done, &[]);

        self.tasks.push(CompileTask {
            body: program,
            max_stack_site,
            address_site,
            table: IndexTable::new().extend_all(locals),
        });
        self.continue_to_compile()?;

        let program = Program { words: self.code };
        verify(&program)?;
        Ok(program)
    }

    fn continue_to_compile(&mut self) -> Result<(), CompileError> {
        while let Some(task) = self.tasks.pop() {
            let entry = self.code.len();
            self.patch(task.address_site, entry);
            log::trace!(
                "compiling function body at {:04} ({} slots)",
                entry,
                task.table.len()
            );

            let max_stack = self.compile_node(task.body, &task.table, true)?;
            self.patch(task.max_stack_site, max_stack);
            self.toplevel = false;
        }
        Ok(())
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Append an instruction, returning its address.
    fn emit(&mut self, op: Op, operands: &[Word]) -> usize {
        debug_assert_eq!(operands.len(), op.arity());
        let address = self.code.len();
        self.code.push(Word::Op(op));
        self.code.extend_from_slice(operands);
        address
    }

    /// Append a jump with an unresolved target, returning the patch site.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op, &[Word::Hole]) + 1
    }

    /// Append `LDF <hole> <hole> extension`, returning the two patch sites.
    fn emit_ldf(&mut self, env_extension: usize) -> (usize, usize) {
        let address = self.emit(
            Op::Ldf,
            &[Word::Hole, Word::Hole, Word::Index(env_extension as u32)],
        );
        (address + 1, address + 2)
    }

    fn patch(&mut self, site: usize, value: usize) {
        self.code[site] = Word::Index(value as u32);
    }

    /// Point the jump at `site` to the next instruction to be emitted.
    fn patch_here(&mut self, site: usize) {
        let here = self.code.len();
        self.patch(site, here);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn compile_node(
        &mut self,
        node: &'a Node,
        table: &IndexTable,
        tail: bool,
    ) -> Result<usize, CompileError> {
        let mut tail = tail;

        let mut max_stack = match node {
            Node::Literal(literal) => self.compile_literal(literal)?,

            Node::Name(_) if node.is_undefined() => {
                self.emit(Op::Ldcu, &[]);
                1
            }

            Node::Name(name) => {
                let slot = lookup(table, name)?;
                self.emit(Op::Ld, &[Word::Index(slot as u32)]);
                1
            }

            Node::LogicalComposition {
                operator,
                left,
                right,
            } => self.compile_logical_composition(operator, left, right, table)?,

            Node::Conditional {
                predicate,
                consequent,
                alternative,
            } => {
                let max_stack = self.compile_conditional(
                    Operand::Node(predicate),
                    Operand::Node(consequent),
                    Operand::Node(alternative),
                    table,
                    tail,
                )?;
                tail = false;
                max_stack
            }

            Node::UnaryOperator { operator, operand } => {
                self.compile_unary(operator, operand, table)?
            }

            Node::BinaryOperator {
                operator,
                left,
                right,
            } => self.compile_binary(operator, left, right, table)?,

            Node::Application {
                function,
                arguments,
            } => self.compile_application(function, arguments, table)?,

            Node::Lambda { parameters, body } => self.compile_lambda(parameters, body, table),

            Node::Sequence(statements) => {
                let max_stack = self.compile_sequence(statements, table, tail)?;
                tail = false;
                max_stack
            }

            Node::Block(body) => {
                let max_stack = self.compile_node(body, table, tail)?;
                tail = false;
                max_stack
            }

            Node::ConstantDeclaration { name, value }
            | Node::VariableDeclaration { name, value }
            | Node::Assignment { name, value } => {
                self.compile_assignment(name, Operand::Node(value), table)?
            }

            Node::FunctionDeclaration {
                name,
                parameters,
                body,
            } => self.compile_assignment(name, Operand::Lambda { parameters, body }, table)?,

            Node::While { condition, body } => self.compile_while_loop(condition, body, table)?,

            Node::Return(expression) => {
                let max_stack = self.compile_node(expression, table, false)?;
                self.emit(Op::Rtn, &[]);
                return Ok(max_stack);
            }
        };

        if tail {
            max_stack = self.finish_tail(returns_value_at_top_level(node), max_stack);
        }
        Ok(max_stack)
    }

    /// Desugared operands never sit in tail position; only source nodes
    /// take `tail`.
    fn compile_operand(
        &mut self,
        operand: Operand<'a>,
        table: &IndexTable,
        tail: bool,
    ) -> Result<usize, CompileError> {
        match operand {
            Operand::Node(node) => self.compile_node(node, table, tail),
            Operand::Bool(value) => {
                debug_assert!(!tail);
                self.emit(Op::Ldcb, &[Word::Bool(value)]);
                Ok(1)
            }
            Operand::Lambda { parameters, body } => {
                debug_assert!(!tail);
                Ok(self.compile_lambda(parameters, body, table))
            }
        }
    }

    /// Emit the return at the end of a function body.
    ///
    /// At top level the value of a literal, `undefined`, an application or an
    /// operator combination is returned as is; every other form returns
    /// undefined instead of its own value.
    fn finish_tail(&mut self, returns_value: bool, max_stack: usize) -> usize {
        if self.toplevel && returns_value {
            self.emit(Op::Rtn, &[]);
            max_stack
        } else {
            self.emit(Op::Ldcu, &[]);
            self.emit(Op::Rtn, &[]);
            max_stack + 1
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_literal(&mut self, literal: &Literal) -> Result<usize, CompileError> {
        match literal {
            Literal::Number(n) => {
                self.emit(Op::Ldcn, &[Word::Number(*n)]);
            }
            Literal::Bool(b) => {
                self.emit(Op::Ldcb, &[Word::Bool(*b)]);
            }
            other => {
                return Err(CompileError::UnsupportedLiteral {
                    literal: format!("{:?}", other),
                });
            }
        }
        Ok(1)
    }

    /// `a && b` is `a ? b : false`, `a || b` is `a ? true : b`.
    fn compile_logical_composition(
        &mut self,
        operator: &str,
        left: &'a Node,
        right: &'a Node,
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        let (consequent, alternative) = match operator {
            "&&" => (Operand::Node(right), Operand::Bool(false)),
            "||" => (Operand::Bool(true), Operand::Node(right)),
            other => {
                return Err(CompileError::unknown_operator(other, "logical composition"));
            }
        };
        self.compile_conditional(Operand::Node(left), consequent, alternative, table, false)
    }

    /// In tail position both branches end in RTN, so no GOTO is needed.
    fn compile_conditional(
        &mut self,
        predicate: Operand<'a>,
        consequent: Operand<'a>,
        alternative: Operand<'a>,
        table: &IndexTable,
        tail: bool,
    ) -> Result<usize, CompileError> {
        let m1 = self.compile_operand(predicate, table, false)?;
        let jof_site = self.emit_jump(Op::Jof);

        let m2 = self.compile_operand(consequent, table, tail)?;
        let goto_site = if tail {
            None
        } else {
            Some(self.emit_jump(Op::Goto))
        };

        self.patch_here(jof_site);
        let m3 = self.compile_operand(alternative, table, tail)?;
        if let Some(site) = goto_site {
            self.patch_here(site);
        }

        Ok(m1.max(m2).max(m3))
    }

    fn compile_unary(
        &mut self,
        operator: &str,
        operand: &'a Node,
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        if operator != "!" {
            return Err(CompileError::unknown_operator(
                operator,
                "unary operator combination",
            ));
        }
        let max_stack = self.compile_node(operand, table, false)?;
        self.emit(Op::Not, &[]);
        Ok(max_stack)
    }

    /// The left operand stays on the stack while the right one is computed.
    fn compile_binary(
        &mut self,
        operator: &str,
        left: &'a Node,
        right: &'a Node,
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        let (op, negate) = match operator {
            "+" => (Op::Plus, false),
            "-" => (Op::Minus, false),
            "*" => (Op::Times, false),
            "/" => (Op::Div, false),
            "===" => (Op::Equal, false),
            "!==" => (Op::Equal, true),
            "<" => (Op::Less, false),
            "<=" => (Op::Leq, false),
            ">" => (Op::Greater, false),
            ">=" => (Op::Geq, false),
            other => {
                return Err(CompileError::unknown_operator(
                    other,
                    "binary operator combination",
                ));
            }
        };

        let m1 = self.compile_node(left, table, false)?;
        let m2 = self.compile_node(right, table, false)?;
        self.emit(op, &[]);
        if negate {
            self.emit(Op::Not, &[]);
        }
        Ok(m1.max(1 + m2))
    }

    fn compile_application(
        &mut self,
        function: &'a Node,
        arguments: &'a [Node],
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        let m_function = self.compile_node(function, table, false)?;
        let m_arguments = self.compile_arguments(arguments, table)?;
        self.emit(Op::Call, &[Word::Index(arguments.len() as u32)]);
        Ok(m_function.max(m_arguments + 1))
    }

    /// Evaluated arguments pile up on the stack, hence `i + depth_i`.
    fn compile_arguments(
        &mut self,
        arguments: &'a [Node],
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        let mut max_stack = 0;
        for (i, argument) in arguments.iter().enumerate() {
            max_stack = max_stack.max(i + self.compile_node(argument, table, false)?);
        }
        Ok(max_stack)
    }

    /// Emit the closure-building LDF and defer the body.
    ///
    /// The body's table extends the enclosing one with the parameters, then
    /// the hoisted locals, so locals win over parameters on lookup and both
    /// win over outer names. The closure value itself needs one stack slot.
    fn compile_lambda(&mut self, parameters: &'a [String], body: &'a Node, table: &IndexTable) -> usize {
        let body = match body {
            Node::Block(inner) => inner.as_ref(),
            other => other,
        };
        let locals = scan_declarations(body);
        let extended = table
            .extend_all(parameters.iter().map(String::as_str))
            .extend_all(locals.iter().copied());

        let (max_stack_site, address_site) = self.emit_ldf(parameters.len() + locals.len());
        self.tasks.push(CompileTask {
            body,
            max_stack_site,
            address_site,
            table: extended,
        });
        1
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_sequence(
        &mut self,
        statements: &'a [Node],
        table: &IndexTable,
        tail: bool,
    ) -> Result<usize, CompileError> {
        let Some((last, init)) = statements.split_last() else {
            // an empty sequence evaluates to undefined
            self.emit(Op::Ldcu, &[]);
            return Ok(if tail { self.finish_tail(true, 1) } else { 1 });
        };

        let mut max_stack = 0;
        for statement in init {
            max_stack = max_stack.max(self.compile_node(statement, table, false)?);
            self.emit(Op::Pop, &[]);
        }
        Ok(max_stack.max(self.compile_node(last, table, tail)?))
    }

    /// Declarations and assignments store into the hoisted slot and evaluate
    /// to undefined.
    fn compile_assignment(
        &mut self,
        name: &str,
        value: Operand<'a>,
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        let slot = lookup(table, name)?;
        let max_stack = self.compile_operand(value, table, false)?;
        self.emit(Op::Assign, &[Word::Index(slot as u32)]);
        self.emit(Op::Ldcu, &[]);
        Ok(max_stack)
    }

    /// ```text
    /// start: <condition>
    ///        JOF end
    ///        <body>
    ///        POP
    ///        GOTO start
    /// end:   LDCU
    /// ```
    fn compile_while_loop(
        &mut self,
        condition: &'a Node,
        body: &'a Node,
        table: &IndexTable,
    ) -> Result<usize, CompileError> {
        let start = self.code.len();
        let m_condition = self.compile_node(condition, table, false)?;
        let jof_site = self.emit_jump(Op::Jof);

        let m_body = self.compile_node(body, table, false)?;
        self.emit(Op::Pop, &[]);
        self.emit(Op::Goto, &[Word::Index(start as u32)]);

        self.patch_here(jof_site);
        self.emit(Op::Ldcu, &[]);
        Ok(m_condition.max(m_body).max(1))
    }
}

impl Default for Compiler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(table: &IndexTable, name: &str) -> Result<usize, CompileError> {
    table
        .index_of(name)
        .ok_or_else(|| CompileError::unbound(name))
}

/// Forms whose value a top-level tail position returns directly.
fn returns_value_at_top_level(node: &Node) -> bool {
    matches!(
        node,
        Node::Literal(_)
            | Node::Application { .. }
            | Node::UnaryOperator { .. }
            | Node::BinaryOperator { .. }
    ) || node.is_undefined()
}

/// Names declared directly in a function body, in source order.
///
/// Looks through sequences, blocks and loop bodies but never into nested
/// function bodies, which get their own scope.
fn scan_declarations(node: &Node) -> Vec<&str> {
    fn collect<'n>(node: &'n Node, names: &mut Vec<&'n str>) {
        match node {
            Node::Sequence(statements) => {
                for statement in statements {
                    collect(statement, names);
                }
            }
            Node::Block(body) | Node::While { body, .. } => collect(body, names),
            Node::ConstantDeclaration { name, .. }
            | Node::VariableDeclaration { name, .. }
            | Node::FunctionDeclaration { name, .. } => names.push(name),
            _ => {}
        }
    }

    let mut names = Vec::new();
    collect(node, &mut names);
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::LDF_MAX_OS_SIZE_OFFSET;

    fn ops(program: &Program) -> Vec<Op> {
        program.instructions().map(|(_, op, _)| op).collect()
    }

    /// `(address, max_stack, entry, env_extension)` of every LDF.
    fn closures(program: &Program) -> Vec<(usize, u32, u32, u32)> {
        program
            .instructions()
            .filter(|(_, op, _)| *op == Op::Ldf)
            .map(|(pc, _, operands)| match operands {
                [Word::Index(m), Word::Index(a), Word::Index(e)] => (pc, *m, *a, *e),
                other => panic!("unpatched LDF operands {:?}", other),
            })
            .collect()
    }

    fn toplevel_max_stack(program: &Program) -> u32 {
        match program.words[1 + LDF_MAX_OS_SIZE_OFFSET] {
            Word::Index(m) => m,
            other => panic!("expected patched max stack, got {:?}", other),
        }
    }

    // =========================================================================
    // Basic compilation tests
    // =========================================================================

    #[test]
    fn test_compile_addition_exact_words() {
        let program = compile(&Node::binary("+", Node::num(1.0), Node::num(2.0))).unwrap();

        assert_eq!(
            program.words,
            vec![
                Word::Op(Op::Start),
                Word::Op(Op::Ldf),
                Word::Index(2),
                Word::Index(8),
                Word::Index(0),
                Word::Op(Op::Call),
                Word::Index(0),
                Word::Op(Op::Done),
                Word::Op(Op::Ldcn),
                Word::Number(1.0),
                Word::Op(Op::Ldcn),
                Word::Number(2.0),
                Word::Op(Op::Plus),
                Word::Op(Op::Rtn),
            ]
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let source = Node::seq(vec![
            Node::function(
                "f",
                &["n"],
                Node::ret(Node::binary("*", Node::name("n"), Node::num(2.0))),
            ),
            Node::apply(Node::name("f"), vec![Node::num(21.0)]),
        ]);

        let a = compile(&source).unwrap().to_bytes().unwrap();
        let b = compile(&source).unwrap().to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_toplevel_declaration_count() {
        let source = Node::seq(vec![
            Node::constant("a", Node::num(1.0)),
            Node::variable("b", Node::num(2.0)),
            Node::function("c", &[], Node::ret(Node::num(3.0))),
            Node::name("a"),
        ]);
        let program = compile(&source).unwrap();
        let (_, _, _, extension) = closures(&program)[0];
        assert_eq!(extension, 3);
    }

    // =========================================================================
    // Top-level return rule
    // =========================================================================

    #[test]
    fn test_toplevel_literal_is_returned_directly() {
        let program = compile(&Node::seq(vec![Node::num(7.0)])).unwrap();
        let tail: Vec<Op> = ops(&program).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec![Op::Rtn, Op::Ldcn]);
    }

    #[test]
    fn test_toplevel_name_returns_undefined() {
        let source = Node::seq(vec![Node::constant("x", Node::num(1.0)), Node::name("x")]);
        let program = compile(&source).unwrap();
        let tail: Vec<Op> = ops(&program).into_iter().rev().take(3).collect();
        assert_eq!(tail, vec![Op::Rtn, Op::Ldcu, Op::Ld]);
    }

    #[test]
    fn test_toplevel_logical_composition_returns_undefined() {
        let program = compile(&Node::logical("&&", Node::bool(true), Node::bool(false))).unwrap();
        let tail: Vec<Op> = ops(&program).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec![Op::Rtn, Op::Ldcu]);
    }

    #[test]
    fn test_toplevel_conditional_returns_literal_branches() {
        // true ? 1 : 2
        let source = Node::conditional(Node::bool(true), Node::num(1.0), Node::num(2.0));
        let program = compile(&source).unwrap();
        let ops = ops(&program);
        let body: Vec<Op> = ops.iter().copied().skip_while(|op| *op != Op::Done).skip(1).collect();
        assert_eq!(
            body,
            vec![Op::Ldcb, Op::Jof, Op::Ldcn, Op::Rtn, Op::Ldcn, Op::Rtn]
        );
    }

    #[test]
    fn test_toplevel_conditional_name_branch_returns_undefined() {
        // const x = 1; true ? x : 2
        let source = Node::seq(vec![
            Node::constant("x", Node::num(1.0)),
            Node::conditional(Node::bool(true), Node::name("x"), Node::num(2.0)),
        ]);
        let ops = ops(&compile(&source).unwrap());
        assert!(ops.windows(3).any(|w| w == [Op::Ld, Op::Ldcu, Op::Rtn]));
        assert!(ops.ends_with(&[Op::Ldcn, Op::Rtn]));
        assert!(!ops.contains(&Op::Goto));
    }

    #[test]
    fn test_function_body_tail_expression_returns_undefined() {
        // (x) => { x + 1; }  -- no explicit return
        let source = Node::lambda(
            &["x"],
            Node::block(Node::seq(vec![Node::binary("+", Node::name("x"), Node::num(1.0))])),
        );
        let program = compile(&source).unwrap();
        let tail: Vec<Op> = ops(&program).into_iter().rev().take(3).collect();
        assert_eq!(tail, vec![Op::Rtn, Op::Ldcu, Op::Plus]);
    }

    // =========================================================================
    // Stack depth inference
    // =========================================================================

    #[test]
    fn test_right_nested_operators_need_deeper_stack() {
        // 1 + (2 + (3 + 4))
        let right = Node::binary(
            "+",
            Node::num(1.0),
            Node::binary("+", Node::num(2.0), Node::binary("+", Node::num(3.0), Node::num(4.0))),
        );
        assert_eq!(toplevel_max_stack(&compile(&right).unwrap()), 4);

        // ((1 + 2) + 3) + 4
        let left = Node::binary(
            "+",
            Node::binary("+", Node::binary("+", Node::num(1.0), Node::num(2.0)), Node::num(3.0)),
            Node::num(4.0),
        );
        assert_eq!(toplevel_max_stack(&compile(&left).unwrap()), 2);
    }

    #[test]
    fn test_arguments_accumulate_on_stack() {
        // f(1, 2 + 3) with f declared at top level
        let source = Node::seq(vec![
            Node::function("f", &["a", "b"], Node::ret(Node::name("a"))),
            Node::apply(
                Node::name("f"),
                vec![Node::num(1.0), Node::binary("+", Node::num(2.0), Node::num(3.0))],
            ),
        ]);
        assert_eq!(toplevel_max_stack(&compile(&source).unwrap()), 4);
    }

    #[test]
    fn test_lambda_reports_depth_one() {
        let body = Node::ret(Node::binary(
            "+",
            Node::num(1.0),
            Node::binary("+", Node::num(2.0), Node::num(3.0)),
        ));
        let program = compile(&Node::lambda(&[], body)).unwrap();

        let all = closures(&program);
        // top level: LDF (1) then LDCU for the non-value tail (+1)
        assert_eq!(all[0].1, 2);
        // the body itself needs 3
        assert_eq!(all[1].1, 3);
    }

    // =========================================================================
    // Deferred function bodies
    // =========================================================================

    #[test]
    fn test_function_bodies_follow_toplevel_code() {
        let source = Node::seq(vec![
            Node::constant("f", Node::arrow(&["x"], Node::name("x"))),
            Node::constant("g", Node::arrow(&["y"], Node::name("y"))),
            Node::apply(Node::name("f"), vec![Node::num(1.0)]),
        ]);
        let program = compile(&source).unwrap();
        let all = closures(&program);
        assert_eq!(all.len(), 3);

        let toplevel_entry = all[0].2;
        let (f_ldf, _, f_entry, _) = all[1];
        let (g_ldf, _, g_entry, _) = all[2];

        // both LDFs live in the contiguous top-level code
        assert!(f_ldf > toplevel_entry as usize && g_ldf > f_ldf);
        // bodies come after it, last queued first
        assert!(g_entry < f_entry);
        assert!(g_entry as usize > g_ldf);
    }

    #[test]
    fn test_every_hole_is_patched() {
        let source = Node::seq(vec![
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
            Node::apply(Node::name("fact"), vec![Node::num(5.0)]),
        ]);
        let program = compile(&source).unwrap();
        assert!(!program.words.contains(&Word::Hole));
        for (_, _, entry, _) in closures(&program) {
            assert!(matches!(program.words[entry as usize], Word::Op(_)));
        }
    }

    // =========================================================================
    // Lexical addressing
    // =========================================================================

    fn ld_slots(program: &Program) -> Vec<u32> {
        program
            .instructions()
            .filter_map(|(_, op, operands)| match (op, operands) {
                (Op::Ld, [Word::Index(slot)]) => Some(*slot),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_local_shadows_parameter() {
        // const f = (x) => { const x = 5; return x; };
        let source = Node::seq(vec![
            Node::constant(
                "f",
                Node::lambda(
                    &["x"],
                    Node::block(Node::seq(vec![
                        Node::constant("x", Node::num(5.0)),
                        Node::ret(Node::name("x")),
                    ])),
                ),
            ),
            Node::apply(Node::name("f"), vec![Node::num(1.0)]),
        ]);
        let program = compile(&source).unwrap();
        // top level: f is slot 0; inside: param x is 1, local x is 2
        assert_eq!(ld_slots(&program), vec![0, 2]);
    }

    #[test]
    fn test_parameter_shadows_outer_name() {
        let source = Node::seq(vec![
            Node::constant("x", Node::num(1.0)),
            Node::constant("f", Node::arrow(&["x"], Node::name("x"))),
            Node::apply(Node::name("f"), vec![Node::num(2.0)]),
        ]);
        let program = compile(&source).unwrap();
        assert_eq!(ld_slots(&program), vec![1, 2]);
    }

    // =========================================================================
    // Desugaring
    // =========================================================================

    #[test]
    fn test_and_becomes_conditional() {
        let program = compile(&Node::seq(vec![
            Node::logical("&&", Node::bool(true), Node::bool(true)),
            Node::num(0.0),
        ]))
        .unwrap();
        let body: Vec<Op> = ops(&program).into_iter().skip(4).collect();
        assert_eq!(
            body,
            vec![
                Op::Ldcb,
                Op::Jof,
                Op::Ldcb,
                Op::Goto,
                Op::Ldcb,
                Op::Pop,
                Op::Ldcn,
                Op::Rtn
            ]
        );
        assert!(program.words.contains(&Word::Bool(false)));
    }

    #[test]
    fn test_not_equal_is_negated_equal() {
        let program = compile(&Node::binary("!==", Node::num(1.0), Node::num(2.0))).unwrap();
        let body: Vec<Op> = ops(&program).into_iter().skip(4).collect();
        assert_eq!(body, vec![Op::Ldcn, Op::Ldcn, Op::Equal, Op::Not, Op::Rtn]);
    }

    #[test]
    fn test_while_loop_shape() {
        let source = Node::seq(vec![
            Node::variable("i", Node::num(0.0)),
            Node::while_loop(
                Node::binary("<", Node::name("i"), Node::num(3.0)),
                Node::block(Node::assign("i", Node::binary("+", Node::name("i"), Node::num(1.0)))),
            ),
        ]);
        let program = compile(&source).unwrap();

        let listing: Vec<(usize, Op, &[Word])> = program.instructions().collect();
        let (goto_pc, _, goto_operands) = *listing
            .iter()
            .find(|(_, op, _)| *op == Op::Goto)
            .expect("loop should jump back");
        let Word::Index(start) = goto_operands[0] else {
            panic!("unpatched GOTO");
        };
        assert!((start as usize) < goto_pc);
        // the loop starts by re-evaluating the condition
        assert_eq!(program.op_at(start as usize).unwrap(), Op::Ld);
    }

    #[test]
    fn test_conditional_in_tail_position_has_no_goto() {
        let source = Node::lambda(
            &["n"],
            Node::ret(Node::conditional(Node::name("n"), Node::num(1.0), Node::num(2.0))),
        );
        // with an explicit return the conditional is not in tail position
        assert!(ops(&compile(&source).unwrap()).contains(&Op::Goto));

        let source = Node::lambda(
            &["n"],
            Node::conditional(Node::name("n"), Node::ret(Node::num(1.0)), Node::ret(Node::num(2.0))),
        );
        assert!(!ops(&compile(&source).unwrap()).contains(&Op::Goto));
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn test_unbound_name() {
        let err = compile(&Node::name("nope")).unwrap_err();
        assert_eq!(err, CompileError::unbound("nope"));
    }

    #[test]
    fn test_unknown_binary_operator() {
        let err = compile(&Node::binary("%", Node::num(1.0), Node::num(2.0))).unwrap_err();
        assert!(matches!(err, CompileError::UnknownOperator { ref operator, .. } if operator == "%"));
    }

    #[test]
    fn test_unknown_unary_operator() {
        let err = compile(&Node::unary("-", Node::num(1.0))).unwrap_err();
        assert!(matches!(err, CompileError::UnknownOperator { .. }));
    }

    #[test]
    fn test_string_literal_is_rejected() {
        let err = compile(&Node::Literal(Literal::String("hi".to_string()))).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedLiteral { .. }));
    }

    #[test]
    fn test_unbound_name_inside_deferred_body() {
        let source = Node::arrow(&[], Node::name("missing"));
        assert_eq!(compile(&source).unwrap_err(), CompileError::unbound("missing"));
    }
}
