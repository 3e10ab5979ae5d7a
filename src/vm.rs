use crate::value::{self, TypeError};
use crate::{
    flatten, ArrayRef, Bytecode, CmpOp, ExternalFn, Frames, Opcode, Stack,
    TypeId, Value,
};
use anyhow::{bail, Result};

/// Stack machine over a frame tree. Arithmetic/comparison operand errors are
/// recoverable (nil is pushed); everything else that goes wrong halts with
/// the offending instruction index.
#[derive(Debug)]
pub struct VirtualMachine {
    stack: Stack,
    frames: Frames,
    externals: Vec<ExternalFn>,
}

impl VirtualMachine {
    /// A fresh VM with the type constants bound in the root frame. External
    /// functions are registered separately, before execution.
    pub fn new() -> Self {
        let mut frames = Frames::new();
        frames.declare("int", Value::Type(TypeId::Int));
        frames.declare("float", Value::Type(TypeId::Float));
        frames.declare("bool", Value::Type(TypeId::Bool));
        Self {
            stack: Stack::new(),
            frames,
            externals: Vec::new(),
        }
    }

    /// Register a host function and bind its name in the root frame.
    pub fn register_external(&mut self, external: ExternalFn) {
        let index = self.externals.len() as u32;
        let name = external.name.clone();
        self.externals.push(external);
        self.frames.declare(&name, Value::External(index));
    }

    /// Read a binding off the root frame, for host-side inspection.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.frames.root().declared.get(name).cloned()
    }

    pub fn at_global_scope(&self) -> bool {
        self.frames.is_root()
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn dump(&self) -> String {
        let mut globals: Vec<String> = self
            .frames
            .root()
            .declared
            .iter()
            .map(|(name, value)| format!("{} = {}", name, value))
            .collect();
        globals.sort();
        format!(
            "## STACK ##\n[{}]\n## GLOBAL ##\n{}\n",
            flatten(self.stack.values(), ", "),
            globals.join("\n")
        )
    }

    pub fn execute(&mut self, bytecode: &Bytecode) -> Result<()> {
        let mut pc = 0;
        while pc < bytecode.len() {
            let instr = bytecode.instrs[pc];
            let at = pc;
            pc += 1;
            let arg = instr.arg;
            match instr.op {
                Opcode::Push => {
                    self.stack.push(bytecode.constant(arg).clone())?;
                }
                Opcode::Pop => {
                    self.stack.pop();
                }
                Opcode::Add => self.arithmetic(value::add)?,
                Opcode::Sub => self.arithmetic(value::sub)?,
                Opcode::Mul => self.arithmetic(value::mul)?,
                Opcode::Div => self.arithmetic(value::div)?,
                Opcode::Neg => {
                    let operand = self.stack.pop();
                    let result =
                        value::neg(&operand).unwrap_or(Value::Nil);
                    self.stack.push(result)?;
                }
                Opcode::Not => {
                    let operand = self.stack.pop();
                    self.stack.push(Value::Bool(!operand.is_truthy()))?;
                }
                Opcode::Cmp => self.comparison(CmpOp::Eq)?,
                Opcode::CmpLt => self.comparison(CmpOp::Lt)?,
                Opcode::CmpGt => self.comparison(CmpOp::Gt)?,
                Opcode::CmpLte => self.comparison(CmpOp::Lte)?,
                Opcode::CmpGte => self.comparison(CmpOp::Gte)?,
                Opcode::Declare => {
                    let value = self.stack.pop();
                    self.frames.declare(bytecode.name(arg), value);
                }
                Opcode::Store => {
                    let value = self.stack.pop();
                    self.frames.assign(bytecode.name(arg), value);
                }
                Opcode::Load => {
                    let value = self.frames.get(bytecode.name(arg));
                    self.stack.push(value)?;
                }
                Opcode::Jump => pc = arg as usize,
                Opcode::JumpT => {
                    if self.stack.pop().is_truthy() {
                        pc = arg as usize;
                    }
                }
                Opcode::JumpF => {
                    if !self.stack.pop().is_truthy() {
                        pc = arg as usize;
                    }
                }
                Opcode::Enter => self.frames.enter(),
                Opcode::Leave => {
                    if !self.frames.leave() {
                        bail!(
                            "cannot leave global scope at instruction {}",
                            at
                        );
                    }
                }
                Opcode::Frame => {
                    self.frames.enter_framed(at, arg as usize);
                }
                Opcode::Call => pc = self.call(at)?,
                Opcode::Ret => pc = self.ret(at)?,
                Opcode::JumpB => {
                    let Some(framed) = self.frames.framed_ancestor() else {
                        bail!(
                            "cannot jump back without a frame at instruction {}",
                            at
                        );
                    };
                    pc = self
                        .frames
                        .frame(framed)
                        .start
                        .expect("framed ancestor has a start");
                }
                Opcode::Anchor => self.frames.set_anchor(arg != 0),
                Opcode::Rescue => {
                    let Some(anchor) = self.frames.anchored_ancestor()
                    else {
                        bail!(
                            "cannot rescue without an anchor at instruction {}",
                            at
                        );
                    };
                    self.frames.unwind_to(anchor);
                }
                Opcode::ArrCreate => {
                    let size = self.count(at)?;
                    let mut values = Vec::with_capacity(size);
                    for _ in 0..size {
                        values.push(self.stack.pop());
                    }
                    self.stack.push(Value::array(values))?;
                }
                Opcode::ArrInit => {
                    let size = self.count(at)?;
                    self.stack.push(Value::array(vec![Value::Nil; size]))?;
                }
                Opcode::ArrIndex => {
                    let index = self.index(at)?;
                    let array = self.array(at)?;
                    let values = array.borrow();
                    let len = values.len() as i64;
                    // Negative subscripts count from the end.
                    let index = if index < 0 { index + len } else { index };
                    let result = if index < 0 || index >= len {
                        Value::Nil
                    } else {
                        values[index as usize].clone()
                    };
                    drop(values);
                    self.stack.push(result)?;
                }
                Opcode::ArrSet => {
                    let index = self.index(at)?;
                    let array = self.array(at)?;
                    let value = self.stack.pop();
                    let mut values = array.borrow_mut();
                    if index >= 0 && (index as usize) < values.len() {
                        values[index as usize] = value;
                    }
                }
                Opcode::Panic => {
                    bail!(
                        "panic at instruction {}: {}",
                        at,
                        bytecode.name(arg)
                    );
                }
            }
        }
        if !self.stack.is_empty() {
            bail!("memory leak: stack size = {}", self.stack.len());
        }
        Ok(())
    }

    fn arithmetic(
        &mut self,
        op: fn(&Value, &Value) -> Result<Value, TypeError>,
    ) -> Result<()> {
        let right = self.stack.pop();
        let left = self.stack.pop();
        let result = op(&left, &right).unwrap_or(Value::Nil);
        self.stack.push(result)
    }

    fn comparison(&mut self, op: CmpOp) -> Result<()> {
        let right = self.stack.pop();
        let left = self.stack.pop();
        let result = match value::compare(op, &left, &right) {
            Ok(outcome) => Value::Bool(outcome),
            Err(_) => Value::Nil,
        };
        self.stack.push(result)
    }

    /// Dispatch for CALL. Script functions continue at their body; type
    /// casts and external functions complete the whole call inline and
    /// return to the frame's recorded end.
    fn call(&mut self, at: usize) -> Result<usize> {
        let callee = self.stack.pop();
        match callee {
            Value::Func(address) => Ok(address),
            Value::Type(target) => {
                // The caller's argument count; the cast takes one operand.
                self.stack.pop();
                let operand = self.stack.pop();
                let result = match operand.cast(target) {
                    Ok(value) => value,
                    Err(error) => {
                        bail!("{} at instruction {}", error, at)
                    }
                };
                let next = self.ret(at)?;
                self.stack.push(result)?;
                Ok(next)
            }
            Value::External(index) => {
                let count = self.count(at)?;
                let external = &self.externals[index as usize];
                if !external.variadic && count != external.arity {
                    bail!(
                        "{} expects {} arguments, got {} at instruction {}",
                        external.name,
                        external.arity,
                        count,
                        at
                    );
                }
                // Arguments were pushed in reverse, so popping restores
                // source order.
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(self.stack.pop());
                }
                let result = (self.externals[index as usize].func)(&args)?;
                let next = self.ret(at)?;
                self.stack.push(result.unwrap_or(Value::Nil))?;
                Ok(next)
            }
            other => {
                bail!(
                    "cannot call non-function {} at instruction {}",
                    other,
                    at
                )
            }
        }
    }

    /// Unwind to the nearest framed ancestor and resume at its recorded
    /// return site, discarding any block scopes entered since the call.
    fn ret(&mut self, at: usize) -> Result<usize> {
        let Some(framed) = self.frames.framed_ancestor() else {
            bail!("cannot return without a frame at instruction {}", at);
        };
        let end = self
            .frames
            .frame(framed)
            .end
            .expect("framed ancestor has an end");
        self.frames.unwind_past(framed);
        Ok(end)
    }

    fn count(&mut self, at: usize) -> Result<usize> {
        match self.stack.pop() {
            Value::Int(count) if count >= 0 => Ok(count as usize),
            other => bail!(
                "malformed stack: expected a count, got {} at instruction {}",
                other,
                at
            ),
        }
    }

    fn index(&mut self, at: usize) -> Result<i64> {
        match self.stack.pop() {
            Value::Int(index) => Ok(index),
            Value::Float(index) => Ok(index as i64),
            other => bail!(
                "malformed stack: expected an index, got {} at instruction {}",
                other,
                at
            ),
        }
    }

    fn array(&mut self, at: usize) -> Result<ArrayRef> {
        match self.stack.pop() {
            Value::Array(array) => Ok(array),
            other => bail!(
                "malformed stack: expected an array, got {} at instruction {}",
                other,
                at
            ),
        }
    }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}
