use std::{fmt, sync::Arc};

use crate::{
    ARITHMETIC_EXCEPTION, ARRAY_INDEX_OUT_OF_BOUNDS, ASSERTION_ERROR, ArrayType, ClassInfo,
    EngineError, ExecContext, ExecError, FieldInfo, Handle, Instruction, InstructionResult,
    WEAK_REFERENCE,
};

/// Compact stack-machine instruction set used by the bundled programs and
/// the tests.
///
/// Branch targets are absolute pcs in the same method. Instructions that
/// may give way to another thread leave their operands on the stack until
/// they complete, so a repeated execution sees the same inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Nop,
    PushInt(i32),
    PushNull,
    /// Interned string constant.
    PushString(String),
    Load(usize),
    LoadRef(usize),
    Store(usize),
    StoreRef(usize),
    /// Adds a constant to an int local.
    Inc(usize, i32),
    Pop,
    Dup,
    Swap,

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,

    Goto(usize),
    IfZero(usize),
    IfNonZero(usize),
    /// Pops `b`, then `a`, jumps if `a < b`.
    IfLt(usize),
    IfEq(usize),
    IfNe(usize),
    IfNull(usize),
    IfNonNull(usize),
    IfRefEq(usize),

    New(String),
    NewArray(ArrayType),
    ArrayLength,
    ArrayLoad,
    ArrayStore,
    GetField { class: String, field: String },
    PutField { class: String, field: String },
    GetStatic { class: String, field: String },
    PutStatic { class: String, field: String },
    /// Pops the referent and pushes a new weak reference to it.
    NewWeakRef,
    /// Runs the collector in the middle of the transition.
    Collect,

    MonitorEnter,
    MonitorExit,
    Wait,
    TimedWait,
    Notify,
    NotifyAll,

    /// Pops the runnable (may be null) and pushes the new thread object.
    NewThread { method: String, daemon: bool },
    Start,
    Join,
    Yield,
    Sleep,
    Interrupt,
    CurrentThread,

    ChooseInt { id: String, min: i32, max: i32 },
    ChooseBool { id: String },

    Invoke(String),
    Return,
    ReturnValue,
    Throw,
    /// Pops an int and throws `AssertionError` with the message when it is 0.
    Assert(String),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Instruction for Op {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<InstructionResult, ExecError> {
        let pc = ctx.pc()?;
        let next = InstructionResult::Advanced(pc + 1);
        match self {
            Op::Nop => {}
            Op::PushInt(value) => ctx.push_int(*value)?,
            Op::PushNull => ctx.push_ref(Handle::NULL)?,
            Op::PushString(text) => {
                let string = ctx.intern(text)?;
                ctx.push_ref(string)?;
            }
            Op::Load(index) => {
                let value = ctx.frame()?.local(*index)?;
                ctx.push_int(value)?;
            }
            Op::LoadRef(index) => {
                let value = ctx.frame()?.local_ref(*index)?;
                ctx.push_ref(value)?;
            }
            Op::Store(index) => {
                let value = ctx.pop_int()?;
                ctx.frame_mut()?.set_local(*index, value)?;
            }
            Op::StoreRef(index) => {
                let value = ctx.pop_ref()?;
                ctx.frame_mut()?.set_local_ref(*index, value)?;
            }
            Op::Inc(index, delta) => {
                let frame = ctx.frame_mut()?;
                let value = frame.local(*index)?.wrapping_add(*delta);
                frame.set_local(*index, value)?;
            }
            Op::Pop => {
                ctx.frame_mut()?.pop()?;
            }
            Op::Dup => ctx.frame_mut()?.dup()?,
            Op::Swap => {
                let frame = ctx.frame_mut()?;
                let (b, b_ref) = frame.pop()?;
                let (a, a_ref) = frame.pop()?;
                frame.push(b, b_ref)?;
                frame.push(a, a_ref)?;
            }

            Op::Add => binary(ctx, |a, b| Ok(a.wrapping_add(b)))?,
            Op::Sub => binary(ctx, |a, b| Ok(a.wrapping_sub(b)))?,
            Op::Mul => binary(ctx, |a, b| Ok(a.wrapping_mul(b)))?,
            Op::Div => binary(ctx, |a, b| {
                if b == 0 {
                    return Err(ExecError::throw(ARITHMETIC_EXCEPTION, "/ by zero"));
                }
                Ok(a.wrapping_div(b))
            })?,
            Op::Rem => binary(ctx, |a, b| {
                if b == 0 {
                    return Err(ExecError::throw(ARITHMETIC_EXCEPTION, "% by zero"));
                }
                Ok(a.wrapping_rem(b))
            })?,
            Op::Neg => {
                let value = ctx.pop_int()?;
                ctx.push_int(value.wrapping_neg())?;
            }

            Op::Goto(target) => return Ok(InstructionResult::Advanced(*target)),
            Op::IfZero(target) => return branch(ctx.pop_int()? == 0, *target, pc),
            Op::IfNonZero(target) => return branch(ctx.pop_int()? != 0, *target, pc),
            Op::IfLt(target) => {
                let b = ctx.pop_int()?;
                let a = ctx.pop_int()?;
                return branch(a < b, *target, pc);
            }
            Op::IfEq(target) => {
                let b = ctx.pop_int()?;
                let a = ctx.pop_int()?;
                return branch(a == b, *target, pc);
            }
            Op::IfNe(target) => {
                let b = ctx.pop_int()?;
                let a = ctx.pop_int()?;
                return branch(a != b, *target, pc);
            }
            Op::IfNull(target) => return branch(ctx.pop_ref()?.is_null(), *target, pc),
            Op::IfNonNull(target) => return branch(!ctx.pop_ref()?.is_null(), *target, pc),
            Op::IfRefEq(target) => {
                let b = ctx.pop_ref()?;
                let a = ctx.pop_ref()?;
                return branch(a == b, *target, pc);
            }

            Op::New(class) => {
                let class = ctx.kernel().classes().by_name(class)?;
                let object = ctx.new_object(&class)?;
                ctx.push_ref(object)?;
            }
            Op::NewArray(ty) => {
                let length = ctx.pop_int()?;
                let array = ctx.new_array(*ty, length)?;
                ctx.push_ref(array)?;
            }
            Op::ArrayLength => {
                let array = ctx.pop_ref()?;
                let length = ctx.fields(array)?.array_length();
                ctx.push_int(length as i32)?;
            }
            Op::ArrayLoad => {
                let array = ctx.peek_ref(1)?;
                if !ctx.access(array)? {
                    return Ok(InstructionResult::Repeat);
                }
                let index = ctx.pop_int()?;
                ctx.pop_ref()?;
                let fields = ctx.fields(array)?;
                let ty = fields.array_type().ok_or_else(|| not_an_array(array))?;
                let offset = fields
                    .element_offset(index)
                    .ok_or_else(|| ExecError::throw(ARRAY_INDEX_OUT_OF_BOUNDS, index.to_string()))?;
                match ty {
                    ArrayType::Reference => {
                        let value = fields.get_ref(offset);
                        ctx.load_ref(value)?;
                    }
                    ArrayType::Long => {
                        let value = fields.get_long(offset);
                        ctx.push_long(value)?;
                    }
                    ArrayType::Int | ArrayType::Char => {
                        let value = fields.get_int(offset);
                        ctx.push_int(value)?;
                    }
                }
            }
            Op::ArrayStore => {
                // a long value covers two slots, the array sits below the index
                let value_slots = if ctx.frame()?.peek(2)?.1 { 1 } else { 2 };
                let array = ctx.peek_ref(value_slots + 1)?;
                if !ctx.access(array)? {
                    return Ok(InstructionResult::Repeat);
                }
                let ty = ctx.fields(array)?.array_type().ok_or_else(|| not_an_array(array))?;
                match ty {
                    ArrayType::Reference => {
                        let value = ctx.pop_ref()?;
                        let index = ctx.pop_int()?;
                        ctx.pop_ref()?;
                        let offset = element(ctx, array, index)?;
                        ctx.fields_mut(array)?.set_ref(offset, value);
                    }
                    ArrayType::Long => {
                        let value = ctx.pop_long()?;
                        let index = ctx.pop_int()?;
                        ctx.pop_ref()?;
                        let offset = element(ctx, array, index)?;
                        ctx.fields_mut(array)?.set_long(offset, value);
                    }
                    ArrayType::Int | ArrayType::Char => {
                        let value = ctx.pop_int()?;
                        let index = ctx.pop_int()?;
                        ctx.pop_ref()?;
                        let offset = element(ctx, array, index)?;
                        ctx.fields_mut(array)?.set_int(offset, value);
                    }
                }
            }
            Op::GetField { class, field } => {
                let (_, info) = resolve_field(ctx, class, field, false)?;
                let object = ctx.peek_ref(0)?;
                if !ctx.access(object)? {
                    return Ok(InstructionResult::Repeat);
                }
                ctx.pop_ref()?;
                let (value, long) = {
                    let fields = ctx.fields(object)?;
                    (fields.get_int(info.offset), (info.size == 2).then(|| fields.get_long(info.offset)))
                };
                push_value(ctx, &info, value, long)?;
            }
            Op::PutField { class, field } => {
                let (_, info) = resolve_field(ctx, class, field, false)?;
                let object = ctx.peek_ref(info.size)?;
                if !ctx.access(object)? {
                    return Ok(InstructionResult::Repeat);
                }
                let slot = pop_value(ctx, &info)?;
                ctx.pop_ref()?;
                store_value(ctx.fields_mut(object)?, &info, slot);
            }
            Op::GetStatic { class, field } => {
                let (class, info) = resolve_field(ctx, class, field, true)?;
                let (value, long) = {
                    let fields = ctx.static_fields(&class)?;
                    (fields.get_int(info.offset), (info.size == 2).then(|| fields.get_long(info.offset)))
                };
                push_value(ctx, &info, value, long)?;
            }
            Op::PutStatic { class, field } => {
                let (class, info) = resolve_field(ctx, class, field, true)?;
                let slot = pop_value(ctx, &info)?;
                store_value(ctx.static_fields_mut(&class)?, &info, slot);
            }
            Op::NewWeakRef => {
                let referent = ctx.peek_ref(0)?;
                let class = ctx.kernel().classes().by_name(WEAK_REFERENCE)?;
                let offset = class
                    .weak_referent_offset()
                    .ok_or_else(|| EngineError::UnknownField {
                        class: WEAK_REFERENCE.to_owned(),
                        field: "referent".to_owned(),
                    })?;
                let weak = ctx.new_object(&class)?;
                ctx.fields_mut(weak)?.set_ref(offset, referent);
                ctx.pop_ref()?;
                ctx.push_ref(weak)?;
            }
            Op::Collect => {
                ctx.kernel_mut().collect_garbage();
            }

            Op::MonitorEnter => {
                let object = ctx.peek_ref(0)?;
                if !ctx.lock(object)? {
                    return Ok(InstructionResult::Repeat);
                }
                ctx.pop_ref()?;
            }
            Op::MonitorExit => {
                let object = ctx.pop_ref()?;
                ctx.unlock(object)?;
            }
            Op::Wait | Op::TimedWait => {
                let object = ctx.peek_ref(0)?;
                if !ctx.wait(object, matches!(self, Op::TimedWait))? {
                    return Ok(InstructionResult::Repeat);
                }
                ctx.pop_ref()?;
            }
            Op::Notify | Op::NotifyAll => {
                let object = ctx.peek_ref(0)?;
                if !ctx.notify(object, matches!(self, Op::NotifyAll))? {
                    return Ok(InstructionResult::Repeat);
                }
                ctx.pop_ref()?;
            }

            Op::NewThread { method, daemon } => {
                let entry = ctx.kernel().classes().method_by_name(method)?;
                let runnable = ctx.pop_ref()?;
                let creator = ctx.thread();
                let (_, object) = ctx
                    .kernel_mut()
                    .new_thread(entry, runnable, *daemon, creator)?;
                ctx.push_ref(object)?;
            }
            Op::Start => {
                let object = ctx.pop_ref()?;
                ctx.start_thread(object)?;
            }
            Op::Join => {
                let object = ctx.peek_ref(0)?;
                if !ctx.join(object)? {
                    return Ok(InstructionResult::Repeat);
                }
                ctx.pop_ref()?;
            }
            Op::Yield => ctx.yield_now(),
            Op::Sleep => ctx.sleep()?,
            Op::Interrupt => {
                let object = ctx.pop_ref()?;
                ctx.interrupt(object)?;
            }
            Op::CurrentThread => {
                let object = ctx.kernel().threads.require(ctx.thread())?.object();
                ctx.push_ref(object)?;
            }

            Op::ChooseInt { id, min, max } => match ctx.choose_int(id, *min, *max)? {
                Some(value) => ctx.push_int(value)?,
                None => return Ok(InstructionResult::Repeat),
            },
            Op::ChooseBool { id } => match ctx.choose_bool(id)? {
                Some(value) => ctx.push_int(i32::from(value))?,
                None => return Ok(InstructionResult::Repeat),
            },

            Op::Invoke(name) => {
                let method = ctx.kernel().classes().method_by_name(name)?;
                return ctx.invoke(&method);
            }
            Op::Return => return ctx.return_value(&[]),
            Op::ReturnValue => {
                let value = ctx.frame_mut()?.pop()?;
                return ctx.return_value(&[value]);
            }
            Op::Throw => {
                let exception = ctx.pop_ref()?;
                let exception = ctx.non_null(exception)?;
                return Err(ExecError::Exception(exception));
            }
            Op::Assert(message) => {
                if ctx.pop_int()? == 0 {
                    return Err(ExecError::throw(ASSERTION_ERROR, message.clone()));
                }
            }
        }
        Ok(next)
    }
}

fn binary(
    ctx: &mut ExecContext<'_>,
    op: impl FnOnce(i32, i32) -> Result<i32, ExecError>,
) -> Result<(), ExecError> {
    let b = ctx.pop_int()?;
    let a = ctx.pop_int()?;
    ctx.push_int(op(a, b)?)?;
    Ok(())
}

fn branch(taken: bool, target: usize, pc: usize) -> Result<InstructionResult, ExecError> {
    Ok(InstructionResult::Advanced(if taken { target } else { pc + 1 }))
}

fn not_an_array(handle: Handle) -> ExecError {
    EngineError::Inconsistent(format!("{handle} is not an array")).into()
}

fn element(ctx: &ExecContext<'_>, array: Handle, index: i32) -> Result<usize, ExecError> {
    ctx.fields(array)?
        .element_offset(index)
        .ok_or_else(|| ExecError::throw(ARRAY_INDEX_OUT_OF_BOUNDS, index.to_string()))
}

fn resolve_field(
    ctx: &ExecContext<'_>,
    class: &str,
    field: &str,
    is_static: bool,
) -> Result<(Arc<ClassInfo>, FieldInfo), ExecError> {
    let info = ctx.kernel().classes().by_name(class)?;
    let found = if is_static {
        info.static_field(field)
    } else {
        info.instance_field(field)
    };
    let found = found.cloned().ok_or_else(|| EngineError::UnknownField {
        class: class.to_owned(),
        field: field.to_owned(),
    })?;
    Ok((info, found))
}

enum Slot {
    Int(i32),
    Long(i64),
    Ref(Handle),
}

fn pop_value(ctx: &mut ExecContext<'_>, field: &FieldInfo) -> Result<Slot, ExecError> {
    Ok(match (field.is_reference, field.size) {
        (true, _) => Slot::Ref(ctx.pop_ref()?),
        (false, 2) => Slot::Long(ctx.pop_long()?),
        _ => Slot::Int(ctx.pop_int()?),
    })
}

fn store_value(fields: &mut crate::Fields, field: &FieldInfo, slot: Slot) {
    match slot {
        Slot::Int(value) => fields.set_int(field.offset, value),
        Slot::Long(value) => fields.set_long(field.offset, value),
        Slot::Ref(value) => fields.set_ref(field.offset, value),
    }
}

fn push_value(
    ctx: &mut ExecContext<'_>,
    field: &FieldInfo,
    value: i32,
    long: Option<i64>,
) -> Result<(), ExecError> {
    match (field.is_reference, long) {
        (true, _) => ctx.load_ref(Handle::from_slot(value))?,
        (false, Some(long)) => ctx.push_long(long)?,
        (false, None) => ctx.push_int(value)?,
    }
    Ok(())
}
