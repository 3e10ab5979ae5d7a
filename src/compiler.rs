use crate::{
    Bytecode, Expr, ExprKind, Opcode, Operator, Stmt, StmtKind, Value,
    PLACEHOLDER,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::mem;

/// Lowers the AST to flat bytecode. Structured control flow becomes
/// forward-patched jumps; loops additionally mark their frame with ANCHOR so
/// break/continue can RESCUE out of any scopes the body entered.
pub struct Compiler<'a> {
    statements: &'a [Stmt],
    bytecode: Bytecode,
    names: HashMap<String, u32>,
    break_targets: Vec<u32>,
    continue_targets: Vec<u32>,
    hidden_counter: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(statements: &'a [Stmt]) -> Self {
        Self {
            statements,
            bytecode: Bytecode::new(),
            names: HashMap::new(),
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
            hidden_counter: 0,
        }
    }

    pub fn compile(&mut self) -> Result<Bytecode> {
        let statements = self.statements;
        for stmt in statements {
            self.statement(stmt)?;
        }
        Ok(mem::take(&mut self.bytecode))
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Declare(name, expr) => {
                self.expression(expr)?;
                let id = self.name(name);
                self.bytecode.emit(Opcode::Declare, id);
            }
            StmtKind::Assign(Some(name), expr) => {
                self.expression(expr)?;
                let id = self.name(name);
                self.bytecode.emit(Opcode::Store, id);
            }
            // A targetless assignment is a bare expression statement; the
            // value is dropped.
            StmtKind::Assign(None, expr) => {
                self.expression(expr)?;
                self.bytecode.emit(Opcode::Pop, 0);
            }
            StmtKind::ArrayAssign {
                target,
                index,
                value,
            } => {
                self.expression(value)?;
                self.expression(target)?;
                self.expression(index)?;
                self.bytecode.emit(Opcode::ArrSet, 0);
            }
            StmtKind::Block(statements) => self.block(statements, true)?,
            StmtKind::Conditional { cond, then, alt } => {
                self.expression(cond)?;
                let jump_false =
                    self.bytecode.emit(Opcode::JumpF, PLACEHOLDER);
                self.statement(then)?;
                match alt {
                    Some(alt) => {
                        let jump_end =
                            self.bytecode.emit(Opcode::Jump, PLACEHOLDER);
                        self.patch_here(jump_false);
                        self.statement(alt)?;
                        self.patch_here(jump_end);
                    }
                    None => self.patch_here(jump_false),
                }
            }
            StmtKind::Return(exprs) => {
                // Only the first returned expression is honored.
                match exprs.first() {
                    Some(expr) => self.expression(expr)?,
                    None => {
                        let nil = self.constant(Value::Nil);
                        self.bytecode.emit(Opcode::Push, nil);
                    }
                }
                self.bytecode.emit(Opcode::Ret, 0);
            }
            StmtKind::For {
                init,
                cond,
                update,
                body,
            } => self.for_statement(
                init.as_deref(),
                cond.as_ref(),
                update.as_deref(),
                body,
            )?,
            StmtKind::Break => {
                let Some(&target) = self.break_targets.last() else {
                    bail!("break outside of a loop at offset {}", stmt.pos);
                };
                self.bytecode.emit(Opcode::Jump, target);
            }
            StmtKind::Continue => {
                let Some(&target) = self.continue_targets.last() else {
                    bail!(
                        "continue outside of a loop at offset {}",
                        stmt.pos
                    );
                };
                self.bytecode.emit(Opcode::Jump, target);
            }
        }
        Ok(())
    }

    fn block(&mut self, statements: &[Stmt], scoped: bool) -> Result<()> {
        if scoped {
            self.bytecode.emit(Opcode::Enter, 0);
        }
        for stmt in statements {
            self.statement(stmt)?;
        }
        if scoped {
            self.bytecode.emit(Opcode::Leave, 0);
        }
        Ok(())
    }

    /// Loop protocol: the loop scope is marked as an anchor, and both exit
    /// paths run RESCUE first so that leaving from arbitrarily nested scopes
    /// inside the body lands back on the loop frame.
    fn for_statement(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        update: Option<&Stmt>,
        body: &Stmt,
    ) -> Result<()> {
        self.bytecode.emit(Opcode::Enter, 0);
        if let Some(init) = init {
            self.statement(init)?;
        }
        self.bytecode.emit(Opcode::Anchor, 1);

        let skip_break = self.bytecode.emit(Opcode::Jump, PLACEHOLDER);
        let break_target = self.bytecode.len() as u32;
        self.bytecode.emit(Opcode::Rescue, 0);
        let exit_from_break = self.bytecode.emit(Opcode::Jump, PLACEHOLDER);
        self.patch_here(skip_break);

        let skip_continue = self.bytecode.emit(Opcode::Jump, PLACEHOLDER);
        let continue_target = self.bytecode.len() as u32;
        self.bytecode.emit(Opcode::Rescue, 0);
        if let Some(update) = update {
            self.statement(update)?;
        }
        self.patch_here(skip_continue);

        let cond_exit = match cond {
            Some(cond) => {
                self.expression(cond)?;
                Some(self.bytecode.emit(Opcode::JumpF, PLACEHOLDER))
            }
            None => None,
        };

        self.break_targets.push(break_target);
        self.continue_targets.push(continue_target);
        let compiled = self.statement(body);
        self.break_targets.pop();
        self.continue_targets.pop();
        compiled?;

        self.bytecode.emit(Opcode::Jump, continue_target);
        self.patch_here(exit_from_break);
        if let Some(jump) = cond_exit {
            self.patch_here(jump);
        }
        self.bytecode.emit(Opcode::Anchor, 0);
        self.bytecode.emit(Opcode::Leave, 0);
        Ok(())
    }

    fn expression(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Number(text) => {
                let value: f64 = text.parse().with_context(|| {
                    format!(
                        "invalid number literal '{}' at offset {}",
                        text, expr.pos
                    )
                })?;
                let id = self.constant(Value::Float(value));
                self.bytecode.emit(Opcode::Push, id);
            }
            ExprKind::Identifier(name) => {
                let id = self.name(name);
                self.bytecode.emit(Opcode::Load, id);
            }
            ExprKind::Unary(op, operand) => {
                self.expression(operand)?;
                match op {
                    Operator::Negate => {
                        self.bytecode.emit(Opcode::Neg, 0);
                    }
                    Operator::Not => {
                        self.bytecode.emit(Opcode::Not, 0);
                    }
                    Operator::Positive => {}
                    other => bail!(
                        "operator {:?} is not unary at offset {}",
                        other,
                        expr.pos
                    ),
                }
            }
            ExprKind::Binary(op, left, right) => {
                self.binary(*op, left, right, expr.pos)?;
            }
            // Elements are pushed in reverse so the first one ends up on top
            // of the stack, which ARR_CR makes index 0.
            ExprKind::Array(elements) => {
                for element in elements.iter().rev() {
                    self.expression(element)?;
                }
                let count = self.constant(Value::Int(elements.len() as i64));
                self.bytecode.emit(Opcode::Push, count);
                self.bytecode.emit(Opcode::ArrCreate, 0);
            }
            ExprKind::Subscript { array, index } => {
                self.expression(array)?;
                self.expression(index)?;
                self.bytecode.emit(Opcode::ArrIndex, 0);
            }
            ExprKind::Call { callee, args } => {
                for arg in args.iter().rev() {
                    self.expression(arg)?;
                }
                let count = self.constant(Value::Int(args.len() as i64));
                self.bytecode.emit(Opcode::Push, count);
                self.expression(callee)?;
                let frame = self.bytecode.emit(Opcode::Frame, PLACEHOLDER);
                self.bytecode.emit(Opcode::Call, 0);
                // The frame's end is the instruction after CALL, the return
                // site.
                self.patch_here(frame);
            }
            ExprKind::Function {
                params,
                variadic,
                body,
            } => self.function(params, *variadic, body, expr.pos)?,
        }
        Ok(())
    }

    fn binary(
        &mut self,
        op: Operator,
        left: &Expr,
        right: &Expr,
        pos: usize,
    ) -> Result<()> {
        if matches!(op, Operator::And | Operator::Or) {
            return self.logical(op, left, right);
        }
        self.expression(left)?;
        self.expression(right)?;
        match op {
            Operator::Add => self.bytecode.emit(Opcode::Add, 0),
            Operator::Subtract => self.bytecode.emit(Opcode::Sub, 0),
            Operator::Multiply => self.bytecode.emit(Opcode::Mul, 0),
            Operator::Divide => self.bytecode.emit(Opcode::Div, 0),
            Operator::Equal => self.bytecode.emit(Opcode::Cmp, 0),
            Operator::NotEqual => {
                self.bytecode.emit(Opcode::Cmp, 0);
                self.bytecode.emit(Opcode::Not, 0)
            }
            Operator::LessThan => self.bytecode.emit(Opcode::CmpLt, 0),
            Operator::GreaterThan => self.bytecode.emit(Opcode::CmpGt, 0),
            Operator::LessThanOrEqual => {
                self.bytecode.emit(Opcode::CmpLte, 0)
            }
            Operator::GreaterThanOrEqual => {
                self.bytecode.emit(Opcode::CmpGte, 0)
            }
            other => {
                bail!("operator {:?} is not binary at offset {}", other, pos)
            }
        };
        Ok(())
    }

    /// Jump-threaded short circuit: either operand being decisive jumps
    /// straight to the canonical result, so the right operand is only
    /// evaluated when the left one was not.
    fn logical(
        &mut self,
        op: Operator,
        left: &Expr,
        right: &Expr,
    ) -> Result<()> {
        let (short_jump, short_value) = match op {
            Operator::Or => (Opcode::JumpT, true),
            Operator::And => (Opcode::JumpF, false),
            _ => unreachable!(),
        };
        self.expression(left)?;
        let first = self.bytecode.emit(short_jump, PLACEHOLDER);
        self.expression(right)?;
        let second = self.bytecode.emit(short_jump, PLACEHOLDER);
        let fall_through = self.constant(Value::Bool(!short_value));
        self.bytecode.emit(Opcode::Push, fall_through);
        let done = self.bytecode.emit(Opcode::Jump, PLACEHOLDER);
        self.patch_here(first);
        self.patch_here(second);
        let short = self.constant(Value::Bool(short_value));
        self.bytecode.emit(Opcode::Push, short);
        self.patch_here(done);
        Ok(())
    }

    /// Function literals compile in place behind a skip-over jump. The body
    /// prologue validates the argument count the caller pushed and binds the
    /// parameters; a variadic tail gathers the surplus into an array.
    fn function(
        &mut self,
        params: &[String],
        variadic: bool,
        body: &Stmt,
        pos: usize,
    ) -> Result<()> {
        let skip = self.bytecode.emit(Opcode::Jump, PLACEHOLDER);
        let address = self.bytecode.len();
        self.bytecode.emit(Opcode::Enter, 0);
        let mismatch = self.name("arg count mismatch");
        let minus_one = self.constant(Value::Int(-1));
        if !variadic {
            let count = self.constant(Value::Int(params.len() as i64));
            self.bytecode.emit(Opcode::Push, count);
            self.bytecode.emit(Opcode::Cmp, 0);
            let ok = self.bytecode.emit(Opcode::JumpT, PLACEHOLDER);
            self.bytecode.emit(Opcode::Push, minus_one);
            self.bytecode.emit(Opcode::Panic, mismatch);
            self.patch_here(ok);
            for param in params {
                let id = self.name(param);
                self.bytecode.emit(Opcode::Declare, id);
            }
        } else {
            let fixed = params.len() - 1;
            let hidden = format!("_argcount{}", self.hidden_counter);
            self.hidden_counter += 1;
            let hidden_id = self.name(&hidden);
            self.bytecode.emit(Opcode::Declare, hidden_id);
            let fixed_count = self.constant(Value::Int(fixed as i64));
            self.bytecode.emit(Opcode::Load, hidden_id);
            self.bytecode.emit(Opcode::Push, fixed_count);
            self.bytecode.emit(Opcode::CmpGte, 0);
            let ok = self.bytecode.emit(Opcode::JumpT, PLACEHOLDER);
            self.bytecode.emit(Opcode::Push, minus_one);
            self.bytecode.emit(Opcode::Panic, mismatch);
            self.patch_here(ok);
            for param in &params[..fixed] {
                let id = self.name(param);
                self.bytecode.emit(Opcode::Declare, id);
            }
            // Gather the surplus arguments into the variadic tail.
            self.bytecode.emit(Opcode::Load, hidden_id);
            self.bytecode.emit(Opcode::Push, fixed_count);
            self.bytecode.emit(Opcode::Sub, 0);
            self.bytecode.emit(Opcode::ArrCreate, 0);
            let rest = self.name(&params[fixed]);
            self.bytecode.emit(Opcode::Declare, rest);
        }
        let StmtKind::Block(statements) = &body.kind else {
            bail!("function body must be a block at offset {}", pos);
        };
        self.block(statements, false)?;
        // Bodies that fall through without an explicit return yield nil.
        let nil = self.constant(Value::Nil);
        self.bytecode.emit(Opcode::Push, nil);
        self.bytecode.emit(Opcode::Ret, 0);
        self.bytecode.emit(Opcode::Leave, 0);
        self.patch_here(skip);
        let func = self.constant(Value::Func(address));
        self.bytecode.emit(Opcode::Push, func);
        Ok(())
    }

    fn name(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = self.bytecode.add_name(name);
        self.names.insert(name.to_string(), id);
        id
    }

    fn constant(&mut self, value: Value) -> u32 {
        self.bytecode.add_const(value)
    }

    /// Point a previously emitted jump/frame at the next instruction.
    fn patch_here(&mut self, index: usize) {
        let here = self.bytecode.len() as u32;
        self.bytecode.set_arg(index, here);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArgKind, Lexer, Parser};

    fn compile(input: &str) -> Result<Bytecode> {
        let tokens = Lexer::new(input).tokenize()?;
        let statements = Parser::new(&tokens).parse()?;
        let mut compiler = Compiler::new(&statements);
        compiler.compile()
    }

    fn ops(bytecode: &Bytecode) -> Vec<Opcode> {
        bytecode.instrs.iter().map(|i| i.op).collect()
    }

    #[test]
    fn test_declaration() -> Result<()> {
        let bc = compile("x := 1")?;
        assert_eq!(ops(&bc), vec![Opcode::Push, Opcode::Declare]);
        assert_eq!(bc.constant(bc.instrs[0].arg), &Value::Float(1.0));
        assert_eq!(bc.name(bc.instrs[1].arg), "x");
        Ok(())
    }

    #[test]
    fn test_not_equal_lowers_to_cmp_not() -> Result<()> {
        let bc = compile("x := 1 != 2")?;
        assert_eq!(
            ops(&bc),
            vec![
                Opcode::Push,
                Opcode::Push,
                Opcode::Cmp,
                Opcode::Not,
                Opcode::Declare
            ]
        );
        Ok(())
    }

    #[test]
    fn test_expression_statement_drops_value() -> Result<()> {
        let bc = compile("1 + 2")?;
        assert_eq!(
            ops(&bc),
            vec![Opcode::Push, Opcode::Push, Opcode::Add, Opcode::Pop]
        );
        Ok(())
    }

    #[test]
    fn test_if_else_patching() -> Result<()> {
        let bc = compile("if 1 { x = 1 } else { x = 2 }")?;
        assert_eq!(
            ops(&bc),
            vec![
                Opcode::Push,  // 0: condition
                Opcode::JumpF, // 1: -> else
                Opcode::Enter, // 2
                Opcode::Push,  // 3
                Opcode::Store, // 4
                Opcode::Leave, // 5
                Opcode::Jump,  // 6: -> end
                Opcode::Enter, // 7
                Opcode::Push,  // 8
                Opcode::Store, // 9
                Opcode::Leave, // 10
            ]
        );
        assert_eq!(bc.instrs[1].arg, 7);
        assert_eq!(bc.instrs[6].arg, 11);
        Ok(())
    }

    #[test]
    fn test_short_circuit_or() -> Result<()> {
        let bc = compile("x := a || b")?;
        assert_eq!(
            ops(&bc),
            vec![
                Opcode::Load,  // 0: a
                Opcode::JumpT, // 1: -> true
                Opcode::Load,  // 2: b
                Opcode::JumpT, // 3: -> true
                Opcode::Push,  // 4: false
                Opcode::Jump,  // 5: -> end
                Opcode::Push,  // 6: true
                Opcode::Declare,
            ]
        );
        assert_eq!(bc.instrs[1].arg, 6);
        assert_eq!(bc.instrs[3].arg, 6);
        assert_eq!(bc.instrs[5].arg, 7);
        assert_eq!(bc.constant(bc.instrs[4].arg), &Value::Bool(false));
        assert_eq!(bc.constant(bc.instrs[6].arg), &Value::Bool(true));
        Ok(())
    }

    #[test]
    fn test_short_circuit_and_uses_jump_f() -> Result<()> {
        let bc = compile("x := a && b")?;
        assert_eq!(bc.instrs[1].op, Opcode::JumpF);
        assert_eq!(bc.constant(bc.instrs[4].arg), &Value::Bool(true));
        assert_eq!(bc.constant(bc.instrs[6].arg), &Value::Bool(false));
        Ok(())
    }

    #[test]
    fn test_array_literal_pushes_in_reverse() -> Result<()> {
        let bc = compile("a := [10, 20]")?;
        assert_eq!(
            ops(&bc),
            vec![
                Opcode::Push, // 20
                Opcode::Push, // 10
                Opcode::Push, // element count
                Opcode::ArrCreate,
                Opcode::Declare,
            ]
        );
        assert_eq!(bc.constant(bc.instrs[0].arg), &Value::Float(20.0));
        assert_eq!(bc.constant(bc.instrs[1].arg), &Value::Float(10.0));
        assert_eq!(bc.constant(bc.instrs[2].arg), &Value::Int(2));
        Ok(())
    }

    #[test]
    fn test_call_frame_returns_past_call() -> Result<()> {
        let bc = compile("f(3, 4)")?;
        assert_eq!(
            ops(&bc),
            vec![
                Opcode::Push,  // 0: 4
                Opcode::Push,  // 1: 3
                Opcode::Push,  // 2: arg count
                Opcode::Load,  // 3: f
                Opcode::Frame, // 4
                Opcode::Call,  // 5
                Opcode::Pop,   // 6
            ]
        );
        assert_eq!(bc.instrs[4].arg, 6);
        assert_eq!(bc.constant(bc.instrs[2].arg), &Value::Int(2));
        Ok(())
    }

    #[test]
    fn test_function_literal_layout() -> Result<()> {
        let bc = compile("f := fn() { return 1 }")?;
        assert_eq!(
            ops(&bc),
            vec![
                Opcode::Jump,    // 0: skip body
                Opcode::Enter,   // 1
                Opcode::Push,    // 2: expected count
                Opcode::Cmp,     // 3
                Opcode::JumpT,   // 4
                Opcode::Push,    // 5: -1
                Opcode::Panic,   // 6
                Opcode::Push,    // 7: 1
                Opcode::Ret,     // 8
                Opcode::Push,    // 9: implicit nil
                Opcode::Ret,     // 10
                Opcode::Leave,   // 11
                Opcode::Push,    // 12: the function value
                Opcode::Declare, // 13
            ]
        );
        assert_eq!(bc.instrs[0].arg, 12);
        assert_eq!(bc.instrs[4].arg, 7);
        assert_eq!(bc.constant(bc.instrs[12].arg), &Value::Func(1));
        assert_eq!(bc.name(bc.instrs[6].arg), "arg count mismatch");
        Ok(())
    }

    #[test]
    fn test_variadic_prologue_gathers_tail() -> Result<()> {
        let bc = compile("f := fn(a, rest...) { return rest }")?;
        let ops = ops(&bc);
        assert_eq!(ops[1], Opcode::Enter);
        assert_eq!(ops[2], Opcode::Declare); // hidden arg count
        assert_eq!(bc.name(bc.instrs[2].arg), "_argcount0");
        assert_eq!(ops[5], Opcode::CmpGte);
        let gather = &ops[9..14];
        assert_eq!(
            gather,
            [
                Opcode::Declare, // a
                Opcode::Load,    // hidden count
                Opcode::Push,    // fixed count
                Opcode::Sub,
                Opcode::ArrCreate,
            ]
        );
        assert_eq!(ops[14], Opcode::Declare);
        assert_eq!(bc.name(bc.instrs[14].arg), "rest");
        Ok(())
    }

    #[test]
    fn test_for_loop_anchor_protocol() -> Result<()> {
        let bc = compile("for i := 0; i < 3; i = i + 1 { x = i }")?;
        let ops = ops(&bc);
        assert_eq!(
            &ops[..6],
            [
                Opcode::Enter,
                Opcode::Push,    // 0.0
                Opcode::Declare, // i
                Opcode::Anchor,
                Opcode::Jump,   // skip break handler
                Opcode::Rescue, // break target
            ]
        );
        assert_eq!(ops[ops.len() - 2], Opcode::Anchor);
        assert_eq!(bc.instrs[ops.len() - 2].arg, 0);
        assert_eq!(*ops.last().unwrap(), Opcode::Leave);
        // Both RESCUE handlers sit behind unconditional skips.
        assert_eq!(bc.instrs[4].arg, 7);
        assert_eq!(ops[6], Opcode::Jump); // break handler exits
        Ok(())
    }

    #[test]
    fn test_break_and_continue_jump_to_their_handlers() -> Result<()> {
        let bc = compile("for { break }")?;
        // The break handler is the RESCUE directly after the skip jump.
        let rescue = bc
            .instrs
            .iter()
            .position(|i| i.op == Opcode::Rescue)
            .unwrap();
        let break_jump = bc.instrs[..bc.len() - 3]
            .iter()
            .rposition(|i| i.op == Opcode::Jump)
            .unwrap();
        assert_eq!(bc.instrs[break_jump].arg as usize, rescue);
        Ok(())
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        let err = compile("break").unwrap_err();
        assert!(err.to_string().contains("break outside of a loop"));
        let err = compile("continue").unwrap_err();
        assert!(err.to_string().contains("continue outside of a loop"));
        let err = compile("if 1 { break }").unwrap_err();
        assert!(err.to_string().contains("break outside of a loop"));
    }

    #[test]
    fn test_no_placeholder_survives_patching() -> Result<()> {
        let bc = compile(
            r"
            fact := fn(n) {
                if n < 1 { return 1 }
                return n * fact(n - 1)
            }
            total := 0
            for i := 0; i < 5 || 0 == 1; i = i + 1 {
                if i == 2 && 1 == 1 { continue }
                total = total + fact(i)
            }
            ",
        )?;
        for (index, instr) in bc.instrs.iter().enumerate() {
            if instr.op.arg_kind() == ArgKind::Address {
                assert_ne!(
                    instr.arg, PLACEHOLDER,
                    "unpatched jump at {}",
                    index
                );
                assert!(
                    (instr.arg as usize) <= bc.len(),
                    "jump target {} out of range at {}",
                    instr.arg,
                    index
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_nested_loops_use_innermost_targets() -> Result<()> {
        let bc = compile(
            r"
            for i := 0; i < 3; i = i + 1 {
                for j := 0; j < 3; j = j + 1 {
                    if j == 1 { break }
                }
            }
            ",
        )?;
        // Two loops mean two break handlers; the inner break must target the
        // second RESCUE, which lives at a higher address than the first.
        let rescues: Vec<usize> = bc
            .instrs
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Opcode::Rescue)
            .map(|(index, _)| index)
            .collect();
        assert_eq!(rescues.len(), 4);
        let inner_break = bc
            .instrs
            .iter()
            .any(|i| i.op == Opcode::Jump && i.arg as usize == rescues[2]);
        assert!(inner_break, "inner break should target the inner handler");
        Ok(())
    }
}
