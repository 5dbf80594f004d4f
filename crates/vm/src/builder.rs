//! Fluent construction of instruction vectors.
//!
//! Programs are emitted with symbolic jump labels and a sentinel pc; the
//! final [`ProgramBuilder::resolve`] pass rewrites every label to its pc
//! index. Loop and branch helpers mirror the shapes the compiler emits:
//! `begin_while`/`end_while` around a cursor scan, `begin_if`/`end_if`
//! around a guarded body. Register allocation is a simple bump with scoped
//! rollback, enough for straight-line query programs.

use crate::{CursorPlan, Instruction, Program, REGISTERS, Target, VmFunction};
use common::{ArithOp, CompareOp, DbError, DbResult, LogicOp};
use hashbrown::HashMap;
use types::TypedValue;

/// Open loop context returned by [`ProgramBuilder::begin_while`].
pub struct WhileLoop {
    start: String,
    end: String,
}

/// Open branch context returned by [`ProgramBuilder::begin_if`].
pub struct IfGuard {
    end: String,
}

#[derive(Default)]
pub struct ProgramBuilder {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
    next_reg: usize,
    scopes: Vec<usize>,
    next_cursor: usize,
    gensym: usize,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, inst: Instruction) -> &mut Self {
        self.instructions.push(inst);
        self
    }

    /// Bind `name` to the next instruction's pc.
    pub fn label(&mut self, name: impl Into<String>) -> &mut Self {
        self.labels.insert(name.into(), self.instructions.len());
        self
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        self.gensym += 1;
        format!("{stem}_{}", self.gensym)
    }

    // ---- Registers and cursors ----

    pub fn alloc_reg(&mut self) -> usize {
        self.alloc_regs(1)
    }

    /// Allocate a contiguous register run and return its first index.
    pub fn alloc_regs(&mut self, count: usize) -> usize {
        let first = self.next_reg;
        self.next_reg += count;
        assert!(self.next_reg <= REGISTERS, "out of registers");
        first
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(self.next_reg);
    }

    pub fn pop_scope(&mut self) {
        if let Some(mark) = self.scopes.pop() {
            self.next_reg = mark;
        }
    }

    /// Claim the next cursor slot.
    pub fn open_cursor(&mut self, plan: CursorPlan) -> usize {
        let cursor = self.next_cursor;
        self.next_cursor += 1;
        self.emit(Instruction::Open { cursor, plan });
        cursor
    }

    pub fn close_cursor(&mut self, cursor: usize) -> &mut Self {
        self.emit(Instruction::Close { cursor })
    }

    // ---- Cursor movement ----

    /// Rewind to the first entry; the returned register holds the has-row
    /// flag.
    pub fn first(&mut self, cursor: usize) -> usize {
        let result = self.alloc_reg();
        self.emit(Instruction::Rewind {
            cursor,
            result,
            to_end: false,
        });
        result
    }

    /// Rewind to the last entry.
    pub fn last(&mut self, cursor: usize) -> usize {
        let result = self.alloc_reg();
        self.emit(Instruction::Rewind {
            cursor,
            result,
            to_end: true,
        });
        result
    }

    /// Step forward, refreshing the has-row flag in `result`.
    pub fn next(&mut self, cursor: usize, result: usize) -> &mut Self {
        self.emit(Instruction::Step {
            cursor,
            result,
            forward: true,
        })
    }

    /// Step backward, refreshing the has-row flag in `result`.
    pub fn prev(&mut self, cursor: usize, result: usize) -> &mut Self {
        self.emit(Instruction::Step {
            cursor,
            result,
            forward: false,
        })
    }

    /// Position by key and comparison; the returned register holds the
    /// found flag.
    pub fn seek(&mut self, cursor: usize, key: usize, op: CompareOp) -> usize {
        let result = self.alloc_reg();
        self.emit(Instruction::Seek {
            cursor,
            key,
            result,
            op,
        });
        result
    }

    // ---- Rows ----

    /// Copy one column into a fresh register.
    pub fn column(&mut self, cursor: usize, column: usize) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Column {
            cursor,
            column,
            dest,
        });
        dest
    }

    /// Copy `count` columns starting at `first_column` into a contiguous
    /// register run, returning the run's first register.
    pub fn columns(&mut self, cursor: usize, first_column: usize, count: usize) -> usize {
        let start = self.alloc_regs(count);
        for i in 0..count {
            self.emit(Instruction::Column {
                cursor,
                column: first_column + i,
                dest: start + i,
            });
        }
        start
    }

    pub fn insert_record(&mut self, cursor: usize, start: usize, count: usize) -> &mut Self {
        self.emit(Instruction::Insert {
            cursor,
            start,
            count,
        })
    }

    pub fn update_record(&mut self, cursor: usize, start: usize, count: usize) -> &mut Self {
        self.emit(Instruction::Update {
            cursor,
            start,
            count,
        })
    }

    /// Delete at the cursor; returns `(still_valid, occurred)` registers.
    pub fn delete(&mut self, cursor: usize) -> (usize, usize) {
        let valid = self.alloc_reg();
        let occurred = self.alloc_reg();
        self.emit(Instruction::Delete {
            cursor,
            valid,
            occurred,
        });
        (valid, occurred)
    }

    pub fn result(&mut self, first: usize, count: usize) -> &mut Self {
        self.emit(Instruction::Result { first, count })
    }

    // ---- Values and computation ----

    /// Load a literal into a fresh register.
    pub fn load(&mut self, value: TypedValue) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Load { dest, value });
        dest
    }

    pub fn move_reg(&mut self, dest: usize, src: usize) -> &mut Self {
        self.emit(Instruction::Move { dest, src })
    }

    pub fn arith(&mut self, op: ArithOp, left: usize, right: usize) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Arith {
            dest,
            left,
            right,
            op,
        });
        dest
    }

    /// Arithmetic into an existing register, for accumulator updates.
    pub fn arith_into(&mut self, dest: usize, op: ArithOp, left: usize, right: usize) -> &mut Self {
        self.emit(Instruction::Arith {
            dest,
            left,
            right,
            op,
        })
    }

    pub fn logic(&mut self, op: LogicOp, left: usize, right: usize) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Logic {
            dest,
            left,
            right,
            op,
        });
        dest
    }

    pub fn test(&mut self, op: CompareOp, left: usize, right: usize) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Test {
            dest,
            left,
            right,
            op,
        });
        dest
    }

    pub fn eq(&mut self, left: usize, right: usize) -> usize {
        self.test(CompareOp::Eq, left, right)
    }

    pub fn gt(&mut self, left: usize, right: usize) -> usize {
        self.test(CompareOp::Gt, left, right)
    }

    pub fn pack2(&mut self, left: usize, right: usize) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Pack2 { dest, left, right });
        dest
    }

    /// Unpack a dual into two fresh adjacent registers; returns the first.
    pub fn unpack2(&mut self, src: usize) -> usize {
        let dest = self.alloc_regs(2);
        self.emit(Instruction::Unpack2 { dest, src });
        dest
    }

    /// Call a built-in over an argument run; the returned register holds
    /// the function result.
    pub fn call(&mut self, func: VmFunction, first_arg: usize, argc: usize) -> usize {
        let dest = self.alloc_reg();
        self.emit(Instruction::Function {
            dest,
            first_arg,
            argc,
            func,
        });
        dest
    }

    // ---- Control flow ----

    pub fn begin(&mut self) -> &mut Self {
        self.emit(Instruction::Begin)
    }

    pub fn commit(&mut self) -> &mut Self {
        self.emit(Instruction::Commit)
    }

    pub fn rollback(&mut self) -> &mut Self {
        self.emit(Instruction::Rollback)
    }

    pub fn halt(&mut self) -> &mut Self {
        self.emit(Instruction::Halt { code: 0 })
    }

    pub fn halt_with(&mut self, code: i32) -> &mut Self {
        self.emit(Instruction::Halt { code })
    }

    pub fn goto(&mut self, label: impl Into<String>) -> &mut Self {
        self.emit(Instruction::Goto {
            target: Target::Label(label.into()),
        })
    }

    pub fn jump_if(&mut self, test: usize, label: impl Into<String>, on_true: bool) -> &mut Self {
        self.emit(Instruction::JumpIf {
            test,
            target: Target::Label(label.into()),
            on_true,
        })
    }

    pub fn jump_if_zero(&mut self, test: usize, label: impl Into<String>) -> &mut Self {
        self.jump_if(test, label, false)
    }

    /// Loop while `test` is truthy. The body follows; close with
    /// [`ProgramBuilder::end_while`].
    pub fn begin_while(&mut self, test: usize) -> WhileLoop {
        let start = self.fresh_label("while_start");
        let end = self.fresh_label("while_end");
        self.label(start.clone());
        self.jump_if_zero(test, end.clone());
        WhileLoop { start, end }
    }

    pub fn end_while(&mut self, ctx: WhileLoop) {
        self.goto(ctx.start);
        self.label(ctx.end);
    }

    /// Execute the body only when `test` is truthy. Close with
    /// [`ProgramBuilder::end_if`].
    pub fn begin_if(&mut self, test: usize) -> IfGuard {
        let end = self.fresh_label("if_end");
        self.jump_if_zero(test, end.clone());
        IfGuard { end }
    }

    pub fn end_if(&mut self, ctx: IfGuard) {
        self.label(ctx.end);
    }

    /// Resolve every symbolic target to its pc index and hand back the
    /// finished program. Unknown labels are reported, not guessed.
    pub fn resolve(mut self) -> DbResult<Program> {
        for inst in &mut self.instructions {
            let target = match inst {
                Instruction::Goto { target } => target,
                Instruction::JumpIf { target, .. } => target,
                _ => continue,
            };
            if let Target::Label(name) = target {
                let pc = self
                    .labels
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| DbError::Vm(format!("undefined label '{name}'")))?;
                *target = Target::Pc(pc);
            }
        }
        Ok(Program {
            instructions: self.instructions,
        })
    }
}
