//! Core instruction interpreter.
//!
//! The [`Interpreter`] executes an [`InstructionStream`] with its own evaluation stack,
//! arguments and locals. Calls are resolved through the [`NativeMethods`] registry first
//! and then through an optional [`MethodTable`] holding managed bodies, so a patched method
//! calling into the interception point runs end to end.
//!
//! # Exceptions
//!
//! `throw` searches the exception regions covering the throwing instruction from the
//! innermost outwards. Catch regions match objects of their class, filters run their filter
//! block and enter the handler on a true result, and finally and fault handlers run while
//! the exception passes through. `leave` runs the finally handlers of every region it
//! exits. An exception escaping a method continues the search in its caller.

use std::{cmp::Ordering, mem, sync::Arc};

use crate::{
    assembly::{
        ExceptionRegion, FlowType, Immediate, Instruction, InstructionStream, MethodRef,
        Operand, RegionKind,
    },
    config::EmulationLimits,
    emulation::{natives::NativeMethods, value::EmValue},
    metadata::token::Token,
    patch::MethodTable,
    Error, Result,
};

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Normal return, with the value of a non-void method.
    Return(Option<EmValue>),
    /// An exception escaped the method.
    Throw(EmValue),
}

impl Completion {
    /// Return value, treating an escaped exception as an error.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for [`Completion::Throw`].
    pub fn into_value(self) -> Result<Option<EmValue>> {
        match self {
            Completion::Return(value) => Ok(value),
            Completion::Throw(exception) => Err(Error::Execution(format!(
                "unhandled exception {exception:?}"
            ))),
        }
    }
}

/// How a run of instructions ended.
enum Exit {
    Return(Option<EmValue>),
    Throw(EmValue),
    EndFinally,
    EndFilter(EmValue),
}

enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Throw(EmValue),
    Exit(Exit),
}

#[derive(Debug, Default)]
struct Frame {
    args: Vec<EmValue>,
    locals: Vec<EmValue>,
    stack: Vec<EmValue>,
    caught: Option<EmValue>,
}

impl Frame {
    fn push(&mut self, value: EmValue) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<EmValue> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Execution("evaluation stack underflow".to_string()))
    }

    fn peek(&self) -> Result<&EmValue> {
        self.stack
            .last()
            .ok_or_else(|| Error::Execution("evaluation stack underflow".to_string()))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<EmValue>> {
        if self.stack.len() < count {
            return Err(Error::Execution(format!(
                "call needs {count} arguments, stack holds {}",
                self.stack.len()
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }
}

fn slot<'a>(values: &'a mut [EmValue], index: u16, what: &str) -> Result<&'a mut EmValue> {
    values
        .get_mut(usize::from(index))
        .ok_or_else(|| Error::Execution(format!("{what} {index} out of range")))
}

/// Step-based interpreter bounded by [`EmulationLimits`].
///
/// The instruction budget is shared by everything one interpreter executes; create a new
/// interpreter (or call [`Interpreter::reset`]) per top-level invocation.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use dotpatch::assembly::{InstructionEmitter, StreamBuilder};
/// use dotpatch::config::EmulationLimits;
/// use dotpatch::emulation::{EmValue, Interpreter, NativeMethods};
///
/// let mut b = StreamBuilder::new();
/// b.ldarg(0)?.ldarg(1)?.op("mul")?.ret()?;
/// let square = b.build(2, true)?;
///
/// let mut interpreter = Interpreter::new(Arc::new(NativeMethods::new()), EmulationLimits::default());
/// let result = interpreter.run(&square, vec![EmValue::I32(6), EmValue::I32(7)])?;
/// assert_eq!(result, Some(EmValue::I32(42)));
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub struct Interpreter {
    natives: Arc<NativeMethods>,
    methods: Option<Arc<dyn MethodTable>>,
    limits: EmulationLimits,
    executed: u64,
    depth: usize,
}

impl Interpreter {
    /// Creates an interpreter that resolves calls through `natives` only.
    #[must_use]
    pub fn new(natives: Arc<NativeMethods>, limits: EmulationLimits) -> Self {
        Interpreter {
            natives,
            methods: None,
            limits,
            executed: 0,
            depth: 0,
        }
    }

    /// Also resolves calls to managed bodies in `methods`.
    #[must_use]
    pub fn with_methods(mut self, methods: Arc<dyn MethodTable>) -> Self {
        self.methods = Some(methods);
        self
    }

    /// Instructions executed since creation or the last reset.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Clears the instruction counter.
    pub fn reset(&mut self) {
        self.executed = 0;
        self.depth = 0;
    }

    /// Executes the live body of `method` from the method table.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if no method table was given or the method is
    /// unknown, and [`Error::Execution`] for faults and unhandled exceptions.
    pub fn execute(&mut self, method: Token, args: Vec<EmValue>) -> Result<Option<EmValue>> {
        let methods = self
            .methods
            .as_ref()
            .ok_or(Error::MethodNotFound(method))?;
        let body = methods.read(method)?;
        self.run(&body, args)
    }

    /// Executes `stream` and returns its result.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for faults, exceeded limits and unhandled exceptions.
    pub fn run(&mut self, stream: &InstructionStream, args: Vec<EmValue>) -> Result<Option<EmValue>> {
        self.call(stream, args)?.into_value()
    }

    /// Executes `stream`, reporting an escaped exception as [`Completion::Throw`].
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for faults and exceeded limits.
    pub fn call(&mut self, stream: &InstructionStream, args: Vec<EmValue>) -> Result<Completion> {
        if args.len() != usize::from(stream.arg_count) {
            return Err(Error::Execution(format!(
                "method takes {} arguments, {} given",
                stream.arg_count,
                args.len()
            )));
        }
        if self.depth >= self.limits.max_call_depth {
            return Err(Error::Execution(format!(
                "call depth limit of {} exceeded",
                self.limits.max_call_depth
            )));
        }

        let mut frame = Frame {
            args,
            locals: vec![EmValue::Null; usize::from(stream.local_count)],
            ..Frame::default()
        };

        self.depth += 1;
        let exit = self.run_from(stream, &mut frame, 0);
        self.depth -= 1;

        match exit? {
            Exit::Return(value) => Ok(Completion::Return(value)),
            Exit::Throw(exception) => Ok(Completion::Throw(exception)),
            Exit::EndFinally | Exit::EndFilter(_) => Err(Error::Execution(
                "endfinally or endfilter outside of a handler".to_string(),
            )),
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.executed += 1;
        if self.limits.max_instructions != 0 && self.executed > self.limits.max_instructions {
            return Err(Error::Execution(format!(
                "instruction limit of {} exceeded",
                self.limits.max_instructions
            )));
        }
        Ok(())
    }

    fn run_from(&mut self, stream: &InstructionStream, frame: &mut Frame, start: usize) -> Result<Exit> {
        let mut pc = start;
        loop {
            let instruction = stream.get(pc).ok_or_else(|| {
                Error::Execution(format!("execution ran past the end of the method at {pc}"))
            })?;
            self.tick()?;

            let thrown = match self.step(frame, stream, instruction)? {
                Step::Next => {
                    pc += 1;
                    continue;
                }
                Step::Jump(target) => {
                    pc = target;
                    continue;
                }
                Step::Exit(exit) => return Ok(exit),
                Step::Leave(target) => match self.leave(stream, frame, pc, target)? {
                    None => {
                        pc = target;
                        continue;
                    }
                    Some(exception) => exception,
                },
                Step::Throw(exception) => exception,
            };

            match self.unwind(stream, frame, pc, thrown)? {
                Ok(handler) => pc = handler,
                Err(exception) => return Ok(Exit::Throw(exception)),
            }
        }
    }

    /// Runs a finally or fault handler on an empty stack. Returns the exception it threw.
    fn run_handler(
        &mut self,
        stream: &InstructionStream,
        frame: &mut Frame,
        region: &ExceptionRegion,
    ) -> Result<Option<EmValue>> {
        let saved = mem::take(&mut frame.stack);
        let exit = self.run_from(stream, frame, region.handler_start);
        frame.stack = saved;
        match exit? {
            Exit::EndFinally => Ok(None),
            Exit::Throw(exception) => Ok(Some(exception)),
            Exit::Return(_) | Exit::EndFilter(_) => Err(Error::Execution(format!(
                "handler at {} did not end with endfinally",
                region.handler_start
            ))),
        }
    }

    /// Runs the finally handlers of every region `leave` at `pc` exits, innermost first.
    fn leave(
        &mut self,
        stream: &InstructionStream,
        frame: &mut Frame,
        pc: usize,
        target: usize,
    ) -> Result<Option<EmValue>> {
        frame.stack.clear();
        let mut exited: Vec<&ExceptionRegion> = stream
            .regions
            .iter()
            .filter(|r| matches!(r.kind, RegionKind::Finally))
            .filter(|r| (r.try_start..r.try_end).contains(&pc))
            .filter(|r| !(r.try_start..r.try_end).contains(&target))
            .collect();
        exited.sort_by_key(|r| r.try_end - r.try_start);

        for region in exited {
            if let Some(exception) = self.run_handler(stream, frame, region)? {
                return Ok(Some(exception));
            }
        }
        Ok(None)
    }

    /// Finds the handler for `exception` thrown at `pc`, running finally and fault handlers
    /// on the way out. `Err` carries the exception that escapes the method.
    fn unwind(
        &mut self,
        stream: &InstructionStream,
        frame: &mut Frame,
        pc: usize,
        exception: EmValue,
    ) -> Result<std::result::Result<usize, EmValue>> {
        let mut exception = exception;
        let mut covering: Vec<&ExceptionRegion> = stream
            .regions
            .iter()
            .filter(|r| (r.try_start..r.try_end).contains(&pc))
            .collect();
        covering.sort_by_key(|r| r.try_end - r.try_start);

        for region in covering {
            let caught = match region.kind {
                RegionKind::Catch(class) => matches!(exception, EmValue::Object(c) if c == class),
                RegionKind::Filter { filter_start } => {
                    let saved = mem::replace(&mut frame.stack, vec![exception.clone()]);
                    let exit = self.run_from(stream, frame, filter_start);
                    frame.stack = saved;
                    match exit? {
                        Exit::EndFilter(verdict) => verdict.is_truthy(),
                        // an exception inside a filter means "not handled"
                        Exit::Throw(_) => false,
                        Exit::Return(_) | Exit::EndFinally => {
                            return Err(Error::Execution(format!(
                                "filter at {filter_start} did not end with endfilter"
                            )))
                        }
                    }
                }
                RegionKind::Finally | RegionKind::Fault => {
                    if let Some(replacement) = self.run_handler(stream, frame, region)? {
                        exception = replacement;
                    }
                    false
                }
            };

            if caught {
                tracing::trace!(handler = region.handler_start, "exception caught");
                frame.stack.clear();
                frame.stack.push(exception.clone());
                frame.caught = Some(exception);
                return Ok(Ok(region.handler_start));
            }
        }
        Ok(Err(exception))
    }

    fn invoke(&mut self, method: &MethodRef, args: Vec<EmValue>) -> Result<Completion> {
        if let Some(native) = self.natives.get(method.token) {
            tracing::trace!(method = %method.full_name(), "native call");
            let result = native(method, &args)?;
            return Ok(Completion::Return(method.returns_value.then_some(result)));
        }
        let body = match &self.methods {
            Some(methods) => methods.read(method.token)?,
            None => {
                return Err(Error::Execution(format!(
                    "no implementation for {}",
                    method.full_name()
                )))
            }
        };
        self.call(&body, args)
    }

    fn step(
        &mut self,
        frame: &mut Frame,
        stream: &InstructionStream,
        instruction: &Instruction,
    ) -> Result<Step> {
        let mnemonic = instruction.mnemonic;

        if let Some(index) = instruction.argument_index() {
            if mnemonic == "starg.s" {
                let value = frame.pop()?;
                *slot(&mut frame.args, index, "argument")? = value;
            } else {
                let value = slot(&mut frame.args, index, "argument")?.clone();
                frame.push(value);
            }
            return Ok(Step::Next);
        }

        if let Some(index) = instruction.local_index() {
            if mnemonic.starts_with("stloc") {
                let value = frame.pop()?;
                *slot(&mut frame.locals, index, "local")? = value;
            } else {
                let value = slot(&mut frame.locals, index, "local")?.clone();
                frame.push(value);
            }
            return Ok(Step::Next);
        }

        if let Some(constant) = instruction.constant() {
            let value = if mnemonic == "ldc.i8" {
                EmValue::I64(constant)
            } else {
                let narrow = i32::try_from(constant)
                    .map_err(|_| Error::Execution(format!("{constant} does not fit ldc.i4")))?;
                EmValue::I32(narrow)
            };
            frame.push(value);
            return Ok(Step::Next);
        }

        match instruction.flow_type {
            FlowType::Return => {
                let value = if stream.returns_value {
                    Some(frame.pop()?)
                } else {
                    None
                };
                return Ok(Step::Exit(Exit::Return(value)));
            }
            FlowType::UnconditionalBranch => return Ok(Step::Jump(target(instruction)?)),
            FlowType::ConditionalBranch => {
                let taken = match mnemonic.trim_end_matches(".s") {
                    "brtrue" => frame.pop()?.is_truthy(),
                    "brfalse" => !frame.pop()?.is_truthy(),
                    op => {
                        let right = frame.pop()?;
                        let left = frame.pop()?;
                        match op {
                            "beq" => left.cil_eq(&right),
                            "bne.un" => !left.cil_eq(&right),
                            "bge" => compare(&left, &right)? != Ordering::Less,
                            "bgt" => compare(&left, &right)? == Ordering::Greater,
                            "ble" => compare(&left, &right)? != Ordering::Greater,
                            "blt" => compare(&left, &right)? == Ordering::Less,
                            _ => return Err(unsupported(mnemonic)),
                        }
                    }
                };
                return Ok(if taken {
                    Step::Jump(target(instruction)?)
                } else {
                    Step::Next
                });
            }
            FlowType::Switch => {
                let selector = frame.pop()?;
                let Operand::Switch(targets) = &instruction.operand else {
                    return Err(unsupported(mnemonic));
                };
                let chosen = selector
                    .as_i32()
                    .and_then(|v| usize::try_from(v).ok())
                    .and_then(|v| targets.get(v).copied());
                return Ok(chosen.map_or(Step::Next, Step::Jump));
            }
            FlowType::Leave => return Ok(Step::Leave(target(instruction)?)),
            FlowType::EndFinally => return Ok(Step::Exit(Exit::EndFinally)),
            FlowType::EndFilter => return Ok(Step::Exit(Exit::EndFilter(frame.pop()?))),
            FlowType::Throw => {
                let exception = if mnemonic == "rethrow" {
                    frame.caught.clone().ok_or_else(|| {
                        Error::Execution("rethrow outside of a catch handler".to_string())
                    })?
                } else {
                    frame.pop()?
                };
                if exception.is_null() {
                    return Err(Error::Execution("throw of a null reference".to_string()));
                }
                return Ok(Step::Throw(exception));
            }
            FlowType::Call => return self.step_call(frame, instruction),
            FlowType::Sequential => {}
        }

        match mnemonic {
            "nop" => {}
            "ldnull" => frame.push(EmValue::Null),
            "ldc.r8" => match instruction.operand {
                Operand::Immediate(Immediate::Float64(v)) => frame.push(EmValue::F64(v)),
                _ => return Err(unsupported(mnemonic)),
            },
            "ldstr" => match &instruction.operand {
                Operand::String(s) => frame.push(EmValue::Str(Arc::clone(s))),
                _ => return Err(unsupported(mnemonic)),
            },
            "dup" => {
                let value = frame.peek()?.clone();
                frame.push(value);
            }
            "pop" => {
                frame.pop()?;
            }
            "add" | "sub" | "mul" | "div" | "rem" | "and" | "or" | "xor" => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(binary(mnemonic, &left, &right)?);
            }
            "neg" => {
                let value = match frame.pop()? {
                    EmValue::I32(v) => EmValue::I32(v.wrapping_neg()),
                    EmValue::I64(v) => EmValue::I64(v.wrapping_neg()),
                    EmValue::F64(v) => EmValue::F64(-v),
                    other => return Err(operand_type(mnemonic, &other)),
                };
                frame.push(value);
            }
            "not" => {
                let value = match frame.pop()? {
                    EmValue::I32(v) => EmValue::I32(!v),
                    EmValue::I64(v) => EmValue::I64(!v),
                    other => return Err(operand_type(mnemonic, &other)),
                };
                frame.push(value);
            }
            "conv.i4" | "conv.i8" | "conv.r8" => {
                let value = frame.pop()?;
                frame.push(convert(mnemonic, &value)?);
            }
            "ceq" | "cgt" | "clt" => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let result = match mnemonic {
                    "ceq" => left.cil_eq(&right),
                    "cgt" => compare(&left, &right)? == Ordering::Greater,
                    _ => compare(&left, &right)? == Ordering::Less,
                };
                frame.push(EmValue::bool(result));
            }
            "box" => {}
            "isinst" | "castclass" => {
                let Operand::Type(class) = instruction.operand else {
                    return Err(unsupported(mnemonic));
                };
                if let &EmValue::Object(actual) = frame.peek()? {
                    if actual != class {
                        if mnemonic == "castclass" {
                            return Err(Error::Execution(format!(
                                "invalid cast from {actual} to {class}"
                            )));
                        }
                        frame.pop()?;
                        frame.push(EmValue::Null);
                    }
                }
            }
            _ => return Err(unsupported(mnemonic)),
        }
        Ok(Step::Next)
    }

    fn step_call(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<Step> {
        let method = instruction
            .method()
            .ok_or_else(|| unsupported(instruction.mnemonic))?;

        if instruction.mnemonic == "newobj" {
            let args = frame.pop_n(usize::from(method.param_count))?;
            let native = self.natives.get(method.token).ok_or_else(|| {
                Error::Execution(format!("no constructor for {}", method.full_name()))
            })?;
            frame.push(native(method, &args)?);
            return Ok(Step::Next);
        }

        let args = frame.pop_n(usize::from(method.pops()))?;
        match self.invoke(method, args)? {
            Completion::Return(value) => {
                if method.returns_value {
                    frame.push(value.unwrap_or(EmValue::Null));
                }
                Ok(Step::Next)
            }
            Completion::Throw(exception) => Ok(Step::Throw(exception)),
        }
    }
}

fn target(instruction: &Instruction) -> Result<usize> {
    match instruction.operand {
        Operand::Target(t) => Ok(t),
        _ => Err(unsupported(instruction.mnemonic)),
    }
}

fn unsupported(mnemonic: &str) -> Error {
    Error::Execution(format!("cannot execute {mnemonic}"))
}

fn operand_type(mnemonic: &str, value: &EmValue) -> Error {
    Error::Execution(format!("{mnemonic} on {}", value.type_name()))
}

fn compare(left: &EmValue, right: &EmValue) -> Result<Ordering> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return Ok(a.cmp(&b));
    }
    match (left.as_f64(), right.as_f64()) {
        // unordered compares as neither greater nor less
        (Some(a), Some(b)) => Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal)),
        _ => Err(Error::Execution(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn convert(mnemonic: &str, value: &EmValue) -> Result<EmValue> {
    let converted = match (mnemonic, value) {
        ("conv.i4", EmValue::F64(v)) => EmValue::I32(*v as i32),
        ("conv.i4", v) => EmValue::I32(v.as_i64().map(|i| i as i32).ok_or_else(|| operand_type(mnemonic, v))?),
        ("conv.i8", EmValue::F64(v)) => EmValue::I64(*v as i64),
        ("conv.i8", v) => EmValue::I64(v.as_i64().ok_or_else(|| operand_type(mnemonic, v))?),
        (_, v) => EmValue::F64(v.as_f64().ok_or_else(|| operand_type(mnemonic, v))?),
    };
    Ok(converted)
}

fn binary(mnemonic: &str, left: &EmValue, right: &EmValue) -> Result<EmValue> {
    let division_by_zero = || Error::Execution(format!("{mnemonic} by zero"));
    match (left, right) {
        (EmValue::I32(a), EmValue::I32(b)) => {
            let (a, b) = (*a, *b);
            Ok(EmValue::I32(match mnemonic {
                "add" => a.wrapping_add(b),
                "sub" => a.wrapping_sub(b),
                "mul" => a.wrapping_mul(b),
                "div" => a.checked_div(b).ok_or_else(division_by_zero)?,
                "rem" => a.checked_rem(b).ok_or_else(division_by_zero)?,
                "and" => a & b,
                "or" => a | b,
                _ => a ^ b,
            }))
        }
        (EmValue::F64(_), _) | (_, EmValue::F64(_)) => {
            let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
                return Err(operand_type(mnemonic, right));
            };
            Ok(EmValue::F64(match mnemonic {
                "add" => a + b,
                "sub" => a - b,
                "mul" => a * b,
                "div" => a / b,
                "rem" => a % b,
                _ => return Err(operand_type(mnemonic, left)),
            }))
        }
        _ => {
            let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) else {
                return Err(Error::Execution(format!(
                    "{mnemonic} on {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            Ok(EmValue::I64(match mnemonic {
                "add" => a.wrapping_add(b),
                "sub" => a.wrapping_sub(b),
                "mul" => a.wrapping_mul(b),
                "div" => a.checked_div(b).ok_or_else(division_by_zero)?,
                "rem" => a.checked_rem(b).ok_or_else(division_by_zero)?,
                "and" => a & b,
                "or" => a | b,
                _ => a ^ b,
            }))
        }
    }
}
