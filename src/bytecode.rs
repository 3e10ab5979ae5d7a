use crate::Value;
use std::fmt::{self, Display, Formatter};

/// Arg value emitted for jump/frame targets that are not yet known; the
/// compiler must overwrite every one of these before it finishes.
pub const PLACEHOLDER: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Push,
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Not,
    Cmp,
    CmpLt,
    CmpGt,
    CmpLte,
    CmpGte,
    Declare,
    Store,
    Load,
    Jump,
    JumpT,
    JumpF,
    Enter,
    Leave,
    Frame,
    Call,
    Ret,
    JumpB,
    Anchor,
    Rescue,
    ArrCreate,
    ArrInit,
    ArrIndex,
    ArrSet,
    Panic,
}

/// How an instruction's arg slot is interpreted, both by the VM and by the
/// textual dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    Address,
    Constant,
    Name,
    Flag,
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Push => "PUSH",
            Opcode::Pop => "POP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Neg => "NEG",
            Opcode::Not => "NOT",
            Opcode::Cmp => "CMP",
            Opcode::CmpLt => "CMP_LT",
            Opcode::CmpGt => "CMP_GT",
            Opcode::CmpLte => "CMP_LTE",
            Opcode::CmpGte => "CMP_GTE",
            Opcode::Declare => "DECLARE",
            Opcode::Store => "STORE",
            Opcode::Load => "LOAD",
            Opcode::Jump => "JUMP",
            Opcode::JumpT => "JUMP_T",
            Opcode::JumpF => "JUMP_F",
            Opcode::Enter => "ENTER",
            Opcode::Leave => "LEAVE",
            Opcode::Frame => "FRAME",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::JumpB => "JUMP_B",
            Opcode::Anchor => "ANCHOR",
            Opcode::Rescue => "RESCUE",
            Opcode::ArrCreate => "ARR_CR",
            Opcode::ArrInit => "ARR_INIT",
            Opcode::ArrIndex => "ARR_ID",
            Opcode::ArrSet => "ARR_V",
            Opcode::Panic => "PANIC",
        }
    }

    pub fn arg_kind(&self) -> ArgKind {
        match self {
            Opcode::Push => ArgKind::Constant,
            Opcode::Declare | Opcode::Store | Opcode::Load | Opcode::Panic => {
                ArgKind::Name
            }
            Opcode::Jump | Opcode::JumpT | Opcode::JumpF | Opcode::Frame => {
                ArgKind::Address
            }
            Opcode::Anchor => ArgKind::Flag,
            _ => ArgKind::None,
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub arg: u32,
}

/// Append-only instruction buffer with forward patching, plus the side
/// tables the fixed-width args index into: constants (PUSH) and names
/// (DECLARE/STORE/LOAD and panic messages).
#[derive(Debug, Default)]
pub struct Bytecode {
    pub instrs: Vec<Instr>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the next instruction to be emitted.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Append an instruction, returning its index for later patching.
    pub fn emit(&mut self, op: Opcode, arg: u32) -> usize {
        self.instrs.push(Instr { op, arg });
        self.instrs.len() - 1
    }

    /// Overwrite the arg of a previously emitted instruction.
    pub fn set_arg(&mut self, index: usize, arg: u32) {
        self.instrs[index].arg = arg;
    }

    pub fn add_const(&mut self, value: Value) -> u32 {
        if let Some(index) = self.consts.iter().position(|c| c == &value) {
            return index as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    pub fn add_name(&mut self, name: &str) -> u32 {
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    pub fn name(&self, id: u32) -> &str {
        &self.names[id as usize]
    }

    pub fn constant(&self, id: u32) -> &Value {
        &self.consts[id as usize]
    }
}

/// Stable textual dump: one line per instruction with its index, mnemonic,
/// and stringified argument (empty when the instruction takes none).
impl Display for Bytecode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (index, instr) in self.instrs.iter().enumerate() {
            let arg = match instr.op.arg_kind() {
                ArgKind::None => String::new(),
                ArgKind::Address => instr.arg.to_string(),
                ArgKind::Constant => self.constant(instr.arg).to_string(),
                ArgKind::Name => self.name(instr.arg).to_string(),
                ArgKind::Flag => (instr.arg != 0).to_string(),
            };
            writeln!(f, "{:3}\t{}\t{}", index, instr.op, arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_is_next_address() {
        let mut bc = Bytecode::new();
        assert_eq!(bc.len(), 0);
        bc.emit(Opcode::Enter, 0);
        bc.emit(Opcode::Leave, 0);
        assert_eq!(bc.len(), 2);
    }

    #[test]
    fn test_forward_patch() {
        let mut bc = Bytecode::new();
        let jump = bc.emit(Opcode::Jump, PLACEHOLDER);
        bc.emit(Opcode::Enter, 0);
        bc.emit(Opcode::Leave, 0);
        bc.set_arg(jump, bc.len() as u32);
        assert_eq!(bc.instrs[jump].arg, 3);
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut bc = Bytecode::new();
        let a = bc.add_const(Value::Float(1.0));
        let b = bc.add_const(Value::Float(1.0));
        let c = bc.add_const(Value::Float(2.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_dump_format() {
        let mut bc = Bytecode::new();
        let one = bc.add_const(Value::Float(1.5));
        let x = bc.add_name("x");
        bc.emit(Opcode::Push, one);
        bc.emit(Opcode::Declare, x);
        bc.emit(Opcode::Pop, 0);
        let dump = bc.to_string();
        assert_eq!(dump, "  0\tPUSH\t1.5\n  1\tDECLARE\tx\n  2\tPOP\t\n");
    }

    #[test]
    fn test_dump_renders_anchor_flag() {
        let mut bc = Bytecode::new();
        bc.emit(Opcode::Anchor, 1);
        bc.emit(Opcode::Anchor, 0);
        assert_eq!(bc.to_string(), "  0\tANCHOR\ttrue\n  1\tANCHOR\tfalse\n");
    }
}
