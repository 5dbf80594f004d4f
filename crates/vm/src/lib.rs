//! Register-based bytecode interpreter.
//!
//! The (external) compiler hands the VM a flat instruction vector; execution
//! is a plain fetch-dispatch loop over a fixed register bank and a table of
//! open cursors. Cursors wrap one of the three storage shapes (persistent
//! B+tree, ephemeral tree, blob chain) behind a single surface, so the
//! opcode handlers never care where rows live. Mutation opcodes reach the
//! pager through the cursors; transaction opcodes drive it directly.
//!
//! Jump targets are built symbolically and resolved to program-counter
//! indices by [`ProgramBuilder::resolve`] before execution, keeping the
//! bytecode free of address dependencies while it is being constructed.

mod builder;
pub mod builtins;
mod cursor;


pub use builder::{IfGuard, ProgramBuilder, WhileLoop};
pub use cursor::{CursorPlan, Layout};

use common::{ArithOp, CompareOp, DbError, DbResult, LogicOp};
use cursor::VmCursor;
use pager::Pager;
use types::{DataType, TypedValue};

/// Size of the register bank.
pub const REGISTERS: usize = 40;

/// Open-cursor table size.
pub const MAX_CURSORS: usize = 10;

/// Built-in function shape: arguments in, one value out. Implementations
/// must not retain the argument slice past the call.
pub type VmFunction = fn(&[TypedValue]) -> DbResult<TypedValue>;

/// Result row sink. The VM retains no ownership of the slice across calls.
pub type ResultCallback<'a> = dyn FnMut(&[TypedValue]) + 'a;

/// A jump destination: symbolic while a program is being built, a concrete
/// pc index after label resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Label(String),
    Pc(usize),
}

impl Target {
    fn pc(&self) -> DbResult<usize> {
        match self {
            Target::Pc(pc) => Ok(*pc),
            Target::Label(name) => Err(DbError::Vm(format!("unresolved label '{name}'"))),
        }
    }
}

/// One VM instruction. Cursor and register operands are indices into the
/// VM's fixed tables.
#[derive(Clone, Debug)]
pub enum Instruction {
    Goto { target: Target },
    Halt { code: i32 },
    Begin,
    Commit,
    Rollback,
    Open { cursor: usize, plan: CursorPlan },
    Close { cursor: usize },
    Rewind { cursor: usize, result: usize, to_end: bool },
    Step { cursor: usize, result: usize, forward: bool },
    Seek { cursor: usize, key: usize, result: usize, op: CompareOp },
    Column { cursor: usize, column: usize, dest: usize },
    Insert { cursor: usize, start: usize, count: usize },
    Update { cursor: usize, start: usize, count: usize },
    Delete { cursor: usize, valid: usize, occurred: usize },
    Load { dest: usize, value: TypedValue },
    Move { dest: usize, src: usize },
    Arith { dest: usize, left: usize, right: usize, op: ArithOp },
    Logic { dest: usize, left: usize, right: usize, op: LogicOp },
    Test { dest: usize, left: usize, right: usize, op: CompareOp },
    Pack2 { dest: usize, left: usize, right: usize },
    Unpack2 { dest: usize, src: usize },
    Result { first: usize, count: usize },
    Function { dest: usize, first_arg: usize, argc: usize, func: VmFunction },
    JumpIf { test: usize, target: Target, on_true: bool },
}

/// A resolved instruction vector ready for execution.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub instructions: Vec<Instruction>,
}

impl Program {
    /// One-line-per-instruction listing for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (pc, inst) in self.instructions.iter().enumerate() {
            out.push_str(&format!("{pc:4}  {inst:?}\n"));
        }
        out
    }
}

/// How a program finished: clean halt, or self-aborted with a nonzero exit
/// code for the host to interpret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Ok,
    Abort(i32),
}

/// The execution machine. Borrows the pager for the duration of one or more
/// programs; the result callback is supplied per execution and may be
/// swapped between programs (the catalog bootstrap does exactly that).
pub struct Vm<'p> {
    pager: &'p mut Pager,
    registers: Vec<TypedValue>,
    cursors: Vec<Option<VmCursor>>,
}

impl<'p> Vm<'p> {
    pub fn new(pager: &'p mut Pager) -> Self {
        Self {
            pager,
            registers: (0..REGISTERS).map(|_| TypedValue::null()).collect(),
            cursors: (0..MAX_CURSORS).map(|_| None).collect(),
        }
    }

    pub fn pager(&mut self) -> &mut Pager {
        &mut *self.pager
    }

    fn reg(&self, index: usize) -> DbResult<&TypedValue> {
        self.registers
            .get(index)
            .ok_or_else(|| DbError::Vm(format!("register {index} out of range")))
    }

    fn set_reg(&mut self, index: usize, value: TypedValue) -> DbResult<()> {
        if index >= REGISTERS {
            return Err(DbError::Vm(format!("register {index} out of range")));
        }
        self.registers[index] = value;
        Ok(())
    }

    fn set_flag(&mut self, index: usize, value: bool) -> DbResult<()> {
        self.set_reg(index, TypedValue::flag(value))
    }

    /// Split-borrow the pager and one open cursor for a single opcode body.
    fn cursor_and_pager(&mut self, slot: usize) -> DbResult<(&mut Pager, &mut VmCursor)> {
        let pager = &mut *self.pager;
        let cursor = self
            .cursors
            .get_mut(slot)
            .ok_or_else(|| DbError::Vm(format!("cursor slot {slot} out of range")))?
            .as_mut()
            .ok_or_else(|| DbError::Vm(format!("cursor slot {slot} is not open")))?;
        Ok((pager, cursor))
    }

    /// Run a program to completion. Falling off the end behaves like a
    /// clean halt; all cursors are released either way.
    pub fn execute(
        &mut self,
        program: &Program,
        callback: &mut ResultCallback<'_>,
    ) -> DbResult<ExitStatus> {
        let status = self.run(program, callback);
        for slot in &mut self.cursors {
            *slot = None;
        }
        status
    }

    fn run(
        &mut self,
        program: &Program,
        callback: &mut ResultCallback<'_>,
    ) -> DbResult<ExitStatus> {
        let mut pc = 0usize;
        while pc < program.instructions.len() {
            match &program.instructions[pc] {
                Instruction::Goto { target } => {
                    pc = target.pc()?;
                    continue;
                }
                Instruction::Halt { code } => {
                    return if *code == 0 {
                        Ok(ExitStatus::Ok)
                    } else {
                        Ok(ExitStatus::Abort(*code))
                    };
                }
                Instruction::Begin => self.pager.begin()?,
                Instruction::Commit => self.pager.commit()?,
                Instruction::Rollback => self.pager.rollback()?,

                Instruction::Open { cursor, plan } => {
                    if *cursor >= MAX_CURSORS {
                        return Err(DbError::Vm(format!("cursor slot {cursor} out of range")));
                    }
                    self.cursors[*cursor] = Some(VmCursor::open(plan)?);
                }
                Instruction::Close { cursor } => {
                    if *cursor >= MAX_CURSORS {
                        return Err(DbError::Vm(format!("cursor slot {cursor} out of range")));
                    }
                    self.cursors[*cursor] = None;
                }
                Instruction::Rewind { cursor, result, to_end } => {
                    let (slot, to_end, result) = (*cursor, *to_end, *result);
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    let found = cur.rewind(pager, to_end)?;
                    self.set_flag(result, found)?;
                }
                Instruction::Step { cursor, result, forward } => {
                    let (slot, forward, result) = (*cursor, *forward, *result);
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    let found = cur.step(pager, forward)?;
                    self.set_flag(result, found)?;
                }
                Instruction::Seek { cursor, key, result, op } => {
                    let (slot, key, result, op) = (*cursor, *key, *result, *op);
                    let probe = self.reg(key)?.clone();
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    let found = cur.seek(pager, &probe, op)?;
                    self.set_flag(result, found)?;
                }
                Instruction::Column { cursor, column, dest } => {
                    let (slot, column, dest) = (*cursor, *column, *dest);
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    let value = cur.column(pager, column)?;
                    self.set_reg(dest, value)?;
                }
                Instruction::Insert { cursor, start, count } => {
                    let (slot, start, count) = (*cursor, *start, *count);
                    if start + count > REGISTERS || count == 0 {
                        return Err(DbError::Vm("bad register run for Insert".into()));
                    }
                    let run: Vec<TypedValue> = self.registers[start..start + count].to_vec();
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    cur.insert(pager, &run)?;
                }
                Instruction::Update { cursor, start, count } => {
                    let (slot, start, count) = (*cursor, *start, *count);
                    if start + count > REGISTERS {
                        return Err(DbError::Vm("bad register run for Update".into()));
                    }
                    let run: Vec<TypedValue> = self.registers[start..start + count].to_vec();
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    cur.update(pager, &run)?;
                }
                Instruction::Delete { cursor, valid, occurred } => {
                    let (slot, valid, occurred) = (*cursor, *valid, *occurred);
                    let (pager, cur) = self.cursor_and_pager(slot)?;
                    let removed = cur.delete(pager)?;
                    let still_valid = cur.is_valid();
                    self.set_flag(valid, still_valid)?;
                    self.set_flag(occurred, removed)?;
                }

                Instruction::Load { dest, value } => {
                    let (dest, value) = (*dest, value.clone());
                    self.set_reg(dest, value)?;
                }
                Instruction::Move { dest, src } => {
                    let value = self.reg(*src)?.clone();
                    self.set_reg(*dest, value)?;
                }
                Instruction::Arith { dest, left, right, op } => {
                    let (dest, op) = (*dest, *op);
                    let lhs = self.reg(*left)?;
                    let rhs = self.reg(*right)?;
                    if lhs.ty != rhs.ty {
                        return Err(DbError::Vm(format!(
                            "arithmetic on mismatched types {:?} and {:?}",
                            lhs.ty, rhs.ty
                        )));
                    }
                    let ty = lhs.ty;
                    let bytes = types::arith(op, ty, &lhs.data, &rhs.data)?;
                    self.set_reg(dest, TypedValue { ty, data: bytes })?;
                }
                Instruction::Logic { dest, left, right, op } => {
                    let (dest, op) = (*dest, *op);
                    let lhs = self.reg(*left)?.is_truthy();
                    let rhs = self.reg(*right)?.is_truthy();
                    let out = match op {
                        LogicOp::And => lhs && rhs,
                        LogicOp::Or => lhs || rhs,
                    };
                    self.set_flag(dest, out)?;
                }
                Instruction::Test { dest, left, right, op } => {
                    let (dest, op) = (*dest, *op);
                    let lhs = self.reg(*left)?;
                    let rhs = self.reg(*right)?;
                    if lhs.ty != rhs.ty {
                        return Err(DbError::Vm(format!(
                            "comparison on mismatched types {:?} and {:?}",
                            lhs.ty, rhs.ty
                        )));
                    }
                    let out = types::compare_op(op, lhs.ty, &lhs.data, &rhs.data);
                    self.set_flag(dest, out)?;
                }
                Instruction::Pack2 { dest, left, right } => {
                    let dest = *dest;
                    let lhs = self.reg(*left)?;
                    let rhs = self.reg(*right)?;
                    let ty = DataType::dual(lhs.ty, rhs.ty)?;
                    let mut data = Vec::with_capacity(ty.total_size() as usize);
                    data.extend_from_slice(&lhs.data);
                    data.extend_from_slice(&rhs.data);
                    self.set_reg(dest, TypedValue { ty, data })?;
                }
                Instruction::Unpack2 { dest, src } => {
                    let dest = *dest;
                    let value = self.reg(*src)?;
                    if !value.ty.is_dual() {
                        return Err(DbError::Vm(format!("Unpack2 of non-dual {:?}", value.ty)));
                    }
                    let first_ty = value.ty.component(0);
                    let second_ty = value.ty.component(1);
                    let offset = value.ty.component_offset(1) as usize;
                    let first = TypedValue::from_bytes(first_ty, &value.data[..offset]);
                    let second = TypedValue::from_bytes(second_ty, &value.data[offset..]);
                    self.set_reg(dest, first)?;
                    self.set_reg(dest + 1, second)?;
                }

                Instruction::Result { first, count } => {
                    let (first, count) = (*first, *count);
                    if first + count > REGISTERS {
                        return Err(DbError::Vm("bad register run for Result".into()));
                    }
                    callback(&self.registers[first..first + count]);
                }
                Instruction::Function { dest, first_arg, argc, func } => {
                    let (dest, first_arg, argc) = (*dest, *first_arg, *argc);
                    if first_arg + argc > REGISTERS {
                        return Err(DbError::Vm("bad register run for Function".into()));
                    }
                    let out = func(&self.registers[first_arg..first_arg + argc])?;
                    self.set_reg(dest, out)?;
                }
                Instruction::JumpIf { test, target, on_true } => {
                    let taken = self.reg(*test)?.is_truthy() == *on_true;
                    if taken {
                        pc = target.pc()?;
                        continue;
                    }
                }
            }
            pc += 1;
        }
        Ok(ExitStatus::Ok)
    }
}
