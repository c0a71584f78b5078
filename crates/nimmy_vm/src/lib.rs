//! The nimmy virtual machine.
//!
//! A tree-walking interpreter built around an explicit stack of execution
//! frames. One call to [`Vm::step`] executes exactly one source statement
//! in the innermost frame, so execution can be suspended and resumed
//! between any two statements. Everything the debugger offers
//! (step-into/over/out, continue-to-breakpoint) and everything the
//! embedder offers (`run`, `eval`) is driven through that single
//! primitive. Expressions inside a statement are evaluated recursively to
//! completion; only statement boundaries are suspension points.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use nimmy_parser::{parse_fragment, parse_program, ParseError};
use nimmy_syntax::{BinaryOp, Expr, Ident, Program, Span, Stmt, UnaryOp};

/// A runtime value. Containers (arrays, sets, tables, objects) have
/// reference semantics: cloning a `Value` clones the handle, not the
/// contents.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    Array(Rc<RefCell<Vec<Value>>>),
    /// Deduplicated by structural equality; iteration is insertion-stable.
    Set(Rc<RefCell<Vec<Value>>>),
    Table(Rc<RefCell<IndexMap<String, Value>>>),
    Object(Rc<RefCell<ObjectValue>>),
    Func(Rc<FuncValue>),
    Native(Rc<NativeValue>),
    Type(Rc<TypeValue>),
    Range {
        start: i64,
        end: i64,
        inclusive: bool,
    },
}

pub struct FuncValue {
    name: String,
    params: Vec<String>,
    body: Rc<Vec<Stmt>>,
    /// The defining scope, captured at declaration time.
    scope: ScopeRef,
}

pub struct NativeValue {
    name: String,
    func: Box<dyn Fn(&[Value]) -> Result<Value, String>>,
}

pub struct TypeValue {
    name: String,
    fields: Vec<String>,
}

pub struct ObjectValue {
    type_name: String,
    fields: IndexMap<String, Value>,
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Value::Str(Rc::new(text.into()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_value(self))
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "string",
        Value::Array(_) => "array",
        Value::Set(_) => "set",
        Value::Table(_) => "table",
        Value::Object(_) => "object",
        Value::Func(_) => "proc",
        Value::Native(_) => "proc",
        Value::Type(_) => "type",
        Value::Range { .. } => "range",
    }
}

/// Structural equality. Ints and floats cross-compare; containers compare
/// by contents; functions, natives, and type descriptors by identity.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Set(a), Value::Set(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| values_equal(x, y)))
        }
        (Value::Table(a), Value::Table(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len()
                && a.iter().all(|(key, x)| {
                    b.get(key).map(|y| values_equal(x, y)).unwrap_or(false)
                })
        }
        (Value::Object(a), Value::Object(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.type_name == b.type_name
                && a.fields.len() == b.fields.len()
                && a.fields.iter().all(|(key, x)| {
                    b.fields.get(key).map(|y| values_equal(x, y)).unwrap_or(false)
                })
        }
        (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
        (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
        (Value::Type(a), Value::Type(b)) => Rc::ptr_eq(a, b),
        (
            Value::Range {
                start: a,
                end: b,
                inclusive: i,
            },
            Value::Range {
                start: c,
                end: d,
                inclusive: j,
            },
        ) => a == c && b == d && i == j,
        _ => false,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Nil => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Array(items) => !items.borrow().is_empty(),
        Value::Set(items) => !items.borrow().is_empty(),
        Value::Table(entries) => !entries.borrow().is_empty(),
        _ => true,
    }
}

fn render_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Render for user-facing output (`echo`, `$`, `&`): strings appear bare.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Str(text) => text.as_ref().clone(),
        other => format_value(other),
    }
}

/// Render for debugging and the REPL: strings appear quoted.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => render_float(*f),
        Value::Str(text) => format!("\"{text}\""),
        Value::Array(items) => format!(
            "[{}]",
            items
                .borrow()
                .iter()
                .map(format_value)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Set(items) => format!(
            "{{{}}}",
            items
                .borrow()
                .iter()
                .map(format_value)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Table(entries) => format!(
            "{{{}}}",
            entries
                .borrow()
                .iter()
                .map(|(key, value)| format!("\"{key}\": {}", format_value(value)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Object(object) => {
            let object = object.borrow();
            let fields = object
                .fields
                .iter()
                .map(|(key, value)| format!("{key}: {}", format_value(value)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}({fields})", object.type_name)
        }
        Value::Func(func) => format!("<proc {}>", func.name),
        Value::Native(native) => format!("<proc {}>", native.name),
        Value::Type(ty) => format!("<type {}>", ty.name),
        Value::Range {
            start,
            end,
            inclusive,
        } => {
            if *inclusive {
                format!("{start}..{end}")
            } else {
                format!("{start}..<{end}")
            }
        }
    }
}

pub type ScopeRef = Rc<RefCell<Scope>>;

/// A lexically nested binding environment: name to value, a per-name
/// const flag, and a parent link for lookup chaining.
#[derive(Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
    consts: HashSet<String>,
    parent: Option<ScopeRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    Undefined,
    Constant,
}

impl Scope {
    pub fn root() -> ScopeRef {
        Rc::new(RefCell::new(Scope::default()))
    }

    pub fn child(parent: &ScopeRef) -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            parent: Some(parent.clone()),
            ..Scope::default()
        }))
    }

    /// Install a fresh binding in this scope, shadowing any outer binding
    /// of the same name.
    pub fn define(&mut self, name: &str, value: Value, is_const: bool) {
        self.vars.insert(name.to_string(), value);
        if is_const {
            self.consts.insert(name.to_string());
        } else {
            self.consts.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name).cloned()
    }

    pub fn lookup(scope: &ScopeRef, name: &str) -> Option<Value> {
        let mut current = scope.clone();
        loop {
            let next = {
                let borrowed = current.borrow();
                if let Some(value) = borrowed.vars.get(name) {
                    return Some(value.clone());
                }
                borrowed.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// Update the nearest binding of `name` in the chain.
    pub fn assign(scope: &ScopeRef, name: &str, value: Value) -> Result<(), AssignError> {
        let mut current = scope.clone();
        loop {
            let next = {
                let mut borrowed = current.borrow_mut();
                if borrowed.vars.contains_key(name) {
                    if borrowed.consts.contains(name) {
                        return Err(AssignError::Constant);
                    }
                    borrowed.vars.insert(name.to_string(), value);
                    return Ok(());
                }
                borrowed.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                None => return Err(AssignError::Undefined),
            }
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Closures make the scope graph cyclic, so only names are printed.
        let mut names: Vec<&str> = self.vars.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Scope")
            .field("names", &names)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum VmError {
    Runtime { message: String, span: Span },
}

impl VmError {
    pub fn span(&self) -> Span {
        match self {
            VmError::Runtime { span, .. } => *span,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            VmError::Runtime { message, .. } => message,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Runtime { message, span } => {
                write!(f, "runtime error at {span}: {message}")
            }
        }
    }
}

impl std::error::Error for VmError {}

fn runtime_error(message: impl Into<String>, span: Span) -> VmError {
    VmError::Runtime {
        message: message.into(),
        span,
    }
}

/// The shared error type for whole-pipeline entry points (`run`,
/// `run_file`): lex/parse, runtime, or I/O.
#[derive(Debug)]
pub enum NimmyError {
    Parse(ParseError),
    Runtime(VmError),
    Io(std::io::Error),
}

impl fmt::Display for NimmyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NimmyError::Parse(err) => write!(f, "{err}"),
            NimmyError::Runtime(err) => write!(f, "{err}"),
            NimmyError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for NimmyError {}

impl From<ParseError> for NimmyError {
    fn from(err: ParseError) -> Self {
        NimmyError::Parse(err)
    }
}

impl From<VmError> for NimmyError {
    fn from(err: VmError) -> Self {
        NimmyError::Runtime(err)
    }
}

impl From<std::io::Error> for NimmyError {
    fn from(err: std::io::Error) -> Self {
        NimmyError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlFlow {
    None,
    Break,
    Continue,
    Return,
}

/// Where a function frame delivers its return value when it retires.
#[derive(Debug, Clone)]
enum ReturnSink {
    Discard,
    Bind { name: String, is_const: bool },
    Assign { target: Expr },
}

/// One record on the execution stack: an in-progress block, loop, or
/// function activation. Every frame carries the scope its statements run
/// in; `step` picks up "current scope" from the innermost frame.
enum Frame {
    Block {
        stmts: Rc<Vec<Stmt>>,
        index: usize,
        scope: ScopeRef,
    },
    ForLoop {
        var_name: String,
        items: Vec<Value>,
        iter_index: usize,
        body: Rc<Vec<Stmt>>,
        index: usize,
        scope: ScopeRef,
    },
    WhileLoop {
        condition: Expr,
        body: Rc<Vec<Stmt>>,
        index: usize,
        scope: ScopeRef,
    },
    Function {
        name: String,
        body: Rc<Vec<Stmt>>,
        index: usize,
        scope: ScopeRef,
        caller_scope: ScopeRef,
        sink: ReturnSink,
    },
}

impl Frame {
    fn stmts(&self) -> &Rc<Vec<Stmt>> {
        match self {
            Frame::Block { stmts, .. } => stmts,
            Frame::ForLoop { body, .. }
            | Frame::WhileLoop { body, .. }
            | Frame::Function { body, .. } => body,
        }
    }

    fn index(&self) -> usize {
        match self {
            Frame::Block { index, .. }
            | Frame::ForLoop { index, .. }
            | Frame::WhileLoop { index, .. }
            | Frame::Function { index, .. } => *index,
        }
    }

    fn index_mut(&mut self) -> &mut usize {
        match self {
            Frame::Block { index, .. }
            | Frame::ForLoop { index, .. }
            | Frame::WhileLoop { index, .. }
            | Frame::Function { index, .. } => index,
        }
    }

    fn scope(&self) -> &ScopeRef {
        match self {
            Frame::Block { scope, .. }
            | Frame::ForLoop { scope, .. }
            | Frame::WhileLoop { scope, .. }
            | Frame::Function { scope, .. } => scope,
        }
    }

    fn is_loop(&self) -> bool {
        matches!(self, Frame::ForLoop { .. } | Frame::WhileLoop { .. })
    }
}

/// Result of [`Vm::run_interactive`].
#[derive(Debug)]
pub struct InteractiveResult {
    pub success: bool,
    pub value: Value,
    pub error: Option<String>,
    pub output: Vec<String>,
}

enum PreparedCall {
    /// A user-defined call with its arguments already evaluated; the
    /// caller decides whether to push a frame or run it eagerly.
    User {
        func: Rc<FuncValue>,
        args: Vec<Value>,
    },
    /// Native and constructor calls complete immediately.
    Immediate(Value),
}

pub struct Vm {
    globals: ScopeRef,
    current_scope: ScopeRef,
    output: Vec<String>,
    return_value: Option<Value>,
    control: ControlFlow,
    frames: Vec<Frame>,
    current_line: u32,
    finished: bool,
    breakpoints: HashSet<u32>,
}

impl Vm {
    pub fn new() -> Self {
        let globals = Scope::root();
        install_builtins(&globals);
        Self {
            current_scope: globals.clone(),
            globals,
            output: Vec::new(),
            return_value: None,
            control: ControlFlow::None,
            frames: Vec::new(),
            current_line: 0,
            finished: true,
            breakpoints: HashSet::new(),
        }
    }

    /// Install a host function in the global scope. Must happen before
    /// execution begins; mid-step registration is not supported.
    pub fn add_native<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + 'static,
    {
        let native = Value::Native(Rc::new(NativeValue {
            name: name.to_string(),
            func: Box::new(func),
        }));
        self.globals.borrow_mut().define(name, native, true);
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().define(name, value, false);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name)
    }

    /// Parse and run a source file to completion; returns the collected
    /// output (one trailing newline per `echo` line) and clears the
    /// buffer.
    pub fn run(&mut self, source: &str) -> Result<String, NimmyError> {
        let program = parse_program(source)?;
        self.eval(&program)?;
        let mut collected = String::new();
        for line in self.output.drain(..) {
            collected.push_str(&line);
            collected.push('\n');
        }
        Ok(collected)
    }

    pub fn run_file(&mut self, path: &str) -> Result<String, NimmyError> {
        let source = std::fs::read_to_string(path)?;
        self.run(&source)
    }

    /// Run a loaded program to completion: `load` plus `step` until
    /// finished.
    pub fn eval(&mut self, program: &Program) -> Result<Value, VmError> {
        self.load(program);
        while !self.finished {
            self.step()?;
        }
        Ok(Value::Nil)
    }

    /// Reset frames and seed the initial block frame with the program's
    /// top-level statements. The global scope and the breakpoint set
    /// survive across loads.
    pub fn load(&mut self, program: &Program) {
        self.frames.clear();
        self.control = ControlFlow::None;
        self.return_value = None;
        self.current_scope = self.globals.clone();
        if program.stmts.is_empty() {
            self.current_line = 0;
            self.finished = true;
            return;
        }
        self.current_line = program.stmts[0].span().line;
        self.finished = false;
        self.frames.push(Frame::Block {
            stmts: Rc::new(program.stmts.clone()),
            index: 0,
            scope: self.globals.clone(),
        });
    }

    /// Execute exactly one statement in the innermost frame.
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.finished {
            return Ok(());
        }
        if self.frames.is_empty() {
            self.finished = true;
            return Ok(());
        }
        let top = self.frames.len() - 1;
        let (stmts, index) = {
            let frame = &self.frames[top];
            (frame.stmts().clone(), frame.index())
        };
        if index >= stmts.len() {
            return self.refresh_position();
        }
        let stmt = &stmts[index];
        self.current_scope = self.frames[top].scope().clone();
        self.current_line = stmt.span().line;
        self.dispatch_stmt(stmt, top)?;
        self.refresh_position()
    }

    /// Retire finished frames until the innermost frame has a pending
    /// statement (updating the current line) or the stack is empty
    /// (marking the VM finished).
    fn refresh_position(&mut self) -> Result<(), VmError> {
        loop {
            let pending_line = match self.frames.last() {
                None => {
                    self.finished = true;
                    return Ok(());
                }
                Some(frame) => {
                    let stmts = frame.stmts();
                    let index = frame.index();
                    if index < stmts.len() {
                        Some(stmts[index].span().line)
                    } else {
                        None
                    }
                }
            };
            match pending_line {
                Some(line) => {
                    self.current_line = line;
                    return Ok(());
                }
                None => self.advance_top_frame()?,
            }
        }
    }

    /// Frame retirement: pop a finished block, iterate a loop, or retire
    /// a function frame by delivering its return value.
    fn advance_top_frame(&mut self) -> Result<(), VmError> {
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => {
                self.finished = true;
                return Ok(());
            }
        };
        match frame {
            Frame::Block { .. } => Ok(()),
            Frame::ForLoop {
                var_name,
                items,
                iter_index,
                body,
                scope,
                ..
            } => {
                let next = iter_index + 1;
                if next >= items.len() {
                    return Ok(());
                }
                // A fresh scope per iteration keeps closures captured in
                // earlier iterations valid.
                let parent = scope
                    .borrow()
                    .parent
                    .clone()
                    .unwrap_or_else(|| self.globals.clone());
                let fresh = Scope::child(&parent);
                fresh.borrow_mut().define(&var_name, items[next].clone(), true);
                self.frames.push(Frame::ForLoop {
                    var_name,
                    items,
                    iter_index: next,
                    body,
                    index: 0,
                    scope: fresh,
                });
                Ok(())
            }
            Frame::WhileLoop {
                condition,
                body,
                scope,
                ..
            } => {
                self.current_scope = scope.clone();
                let cond = self.eval_expr(&condition)?;
                if truthy(&cond) {
                    self.frames.push(Frame::WhileLoop {
                        condition,
                        body,
                        index: 0,
                        scope,
                    });
                }
                Ok(())
            }
            Frame::Function {
                caller_scope, sink, ..
            } => {
                let value = self.return_value.take().unwrap_or(Value::Nil);
                self.control = ControlFlow::None;
                self.current_scope = caller_scope.clone();
                match sink {
                    ReturnSink::Discard => {}
                    ReturnSink::Bind { name, is_const } => {
                        caller_scope.borrow_mut().define(&name, value, is_const);
                    }
                    // The assignment target is evaluated in the caller's
                    // scope, which is active again now.
                    ReturnSink::Assign { target } => self.assign_to_target(&target, value)?,
                }
                Ok(())
            }
        }
    }

    fn bump_index(&mut self, frame_idx: usize) {
        if let Some(frame) = self.frames.get_mut(frame_idx) {
            *frame.index_mut() += 1;
        }
    }

    fn dispatch_stmt(&mut self, stmt: &Stmt, frame_idx: usize) -> Result<(), VmError> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                self.bump_index(frame_idx);
                self.dispatch_binding(name, value, true)
            }
            Stmt::Var { name, value, .. } => {
                self.bump_index(frame_idx);
                self.dispatch_binding(name, value, false)
            }
            Stmt::Assign { target, value, .. } => {
                self.bump_index(frame_idx);
                match self.prepare_statement_call(value)? {
                    Some(PreparedCall::User { func, args }) => {
                        self.push_call_frame(
                            func,
                            args,
                            ReturnSink::Assign {
                                target: target.clone(),
                            },
                        );
                        Ok(())
                    }
                    Some(PreparedCall::Immediate(result)) => self.assign_to_target(target, result),
                    None => {
                        let result = self.eval_expr(value)?;
                        self.assign_to_target(target, result)
                    }
                }
            }
            Stmt::Proc {
                name, params, body, ..
            } => {
                self.bump_index(frame_idx);
                self.define_proc(name, params, body);
                Ok(())
            }
            Stmt::TypeDef { name, fields, .. } => {
                self.bump_index(frame_idx);
                self.define_type(name, fields);
                Ok(())
            }
            Stmt::Echo { args, .. } => {
                self.bump_index(frame_idx);
                self.exec_echo(args)
            }
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                self.bump_index(frame_idx);
                for branch in branches {
                    let cond = self.eval_expr(&branch.condition)?;
                    if truthy(&cond) {
                        self.push_block(&branch.body);
                        return Ok(());
                    }
                }
                if let Some(body) = else_body {
                    self.push_block(body);
                }
                Ok(())
            }
            Stmt::For {
                item, iter, body, ..
            } => {
                let iterable = self.eval_expr(iter)?;
                let items = materialize_iteration(iterable, iter.span())?;
                self.bump_index(frame_idx);
                if let Some(first) = items.first().cloned() {
                    let scope = Scope::child(&self.current_scope);
                    scope.borrow_mut().define(&item.name, first, true);
                    self.frames.push(Frame::ForLoop {
                        var_name: item.name.clone(),
                        items,
                        iter_index: 0,
                        body: Rc::new(body.clone()),
                        index: 0,
                        scope,
                    });
                }
                Ok(())
            }
            Stmt::While {
                condition, body, ..
            } => {
                let cond = self.eval_expr(condition)?;
                self.bump_index(frame_idx);
                if truthy(&cond) {
                    let scope = Scope::child(&self.current_scope);
                    self.frames.push(Frame::WhileLoop {
                        condition: condition.clone(),
                        body: Rc::new(body.clone()),
                        index: 0,
                        scope,
                    });
                }
                Ok(())
            }
            Stmt::Return { expr, .. } => {
                let value = match expr {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::Nil,
                };
                self.return_value = Some(value);
                self.control = ControlFlow::Return;
                // Unwind to the innermost function frame and retire it.
                while let Some(frame) = self.frames.last() {
                    if matches!(frame, Frame::Function { .. }) {
                        return self.advance_top_frame();
                    }
                    self.frames.pop();
                }
                // Return at top level: nothing left to retire.
                self.return_value = None;
                self.control = ControlFlow::None;
                Ok(())
            }
            Stmt::Break(_) => {
                while let Some(frame) = self.frames.last() {
                    let was_loop = frame.is_loop();
                    self.frames.pop();
                    if was_loop {
                        break;
                    }
                }
                Ok(())
            }
            Stmt::Continue(_) => {
                // Forcing the loop frame's index past the end triggers its
                // iteration step on the next advance.
                while let Some(frame) = self.frames.last_mut() {
                    if frame.is_loop() {
                        let end = frame.stmts().len();
                        *frame.index_mut() = end;
                        break;
                    }
                    self.frames.pop();
                }
                Ok(())
            }
            Stmt::Block { body, .. } => {
                self.bump_index(frame_idx);
                self.push_block(body);
                Ok(())
            }
            Stmt::Expr { expr, .. } => {
                self.bump_index(frame_idx);
                match self.prepare_statement_call(expr)? {
                    Some(PreparedCall::User { func, args }) => {
                        self.push_call_frame(func, args, ReturnSink::Discard);
                        Ok(())
                    }
                    Some(PreparedCall::Immediate(_)) | None => {
                        if !matches!(expr, Expr::Call { .. }) {
                            self.eval_expr(expr)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn dispatch_binding(
        &mut self,
        name: &Ident,
        value: &Expr,
        is_const: bool,
    ) -> Result<(), VmError> {
        match self.prepare_statement_call(value)? {
            Some(PreparedCall::User { func, args }) => {
                // The binding is installed when the function frame
                // retires, not in this step.
                self.push_call_frame(
                    func,
                    args,
                    ReturnSink::Bind {
                        name: name.name.clone(),
                        is_const,
                    },
                );
                Ok(())
            }
            Some(PreparedCall::Immediate(result)) => {
                self.current_scope
                    .borrow_mut()
                    .define(&name.name, result, is_const);
                Ok(())
            }
            None => {
                let result = self.eval_expr(value)?;
                self.current_scope
                    .borrow_mut()
                    .define(&name.name, result, is_const);
                Ok(())
            }
        }
    }

    /// If `expr` is a call in statement position, resolve and prepare it:
    /// user-defined calls come back unexecuted so the stepper can push a
    /// frame; native and constructor calls complete immediately. Returns
    /// `None` for non-call expressions.
    fn prepare_statement_call(&mut self, expr: &Expr) -> Result<Option<PreparedCall>, VmError> {
        match expr {
            Expr::Call { callee, args, span } => {
                Ok(Some(self.prepare_call(callee, args, *span)?))
            }
            _ => Ok(None),
        }
    }

    fn prepare_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        span: Span,
    ) -> Result<PreparedCall, VmError> {
        let (callable, mut arg_values) = match callee {
            // UFCS: resolve the name (object fields first, then the scope
            // chain) and prepend the receiver to the argument list.
            Expr::Member { base, name, .. } => {
                let receiver = self.eval_expr(base)?;
                let method = match &receiver {
                    Value::Object(object) => object.borrow().fields.get(&name.name).cloned(),
                    _ => None,
                };
                let callable = match method {
                    Some(value) => value,
                    None => Scope::lookup(&self.current_scope, &name.name).ok_or_else(|| {
                        runtime_error(
                            format!("Undefined variable '{}'", name.name),
                            name.span,
                        )
                    })?,
                };
                (callable, vec![receiver])
            }
            other => (self.eval_expr(other)?, Vec::new()),
        };
        for arg in args {
            arg_values.push(self.eval_expr(arg)?);
        }
        match callable {
            Value::Func(func) => {
                if func.params.len() != arg_values.len() {
                    return Err(runtime_error(
                        format!(
                            "Expected {} arguments, got {}",
                            func.params.len(),
                            arg_values.len()
                        ),
                        span,
                    ));
                }
                Ok(PreparedCall::User {
                    func,
                    args: arg_values,
                })
            }
            Value::Native(native) => {
                let result =
                    (native.func)(&arg_values).map_err(|message| runtime_error(message, span))?;
                Ok(PreparedCall::Immediate(result))
            }
            Value::Type(ty) => {
                if ty.fields.len() != arg_values.len() {
                    return Err(runtime_error(
                        format!(
                            "Expected {} arguments, got {}",
                            ty.fields.len(),
                            arg_values.len()
                        ),
                        span,
                    ));
                }
                let mut fields = IndexMap::new();
                for (field, value) in ty.fields.iter().zip(arg_values) {
                    fields.insert(field.clone(), value);
                }
                Ok(PreparedCall::Immediate(Value::Object(Rc::new(RefCell::new(
                    ObjectValue {
                        type_name: ty.name.clone(),
                        fields,
                    },
                )))))
            }
            other => Err(runtime_error(
                format!("Cannot call {}", type_name(&other)),
                span,
            )),
        }
    }

    fn push_call_frame(&mut self, func: Rc<FuncValue>, args: Vec<Value>, sink: ReturnSink) {
        let activation = Scope::child(&func.scope);
        {
            let mut scope = activation.borrow_mut();
            for (param, value) in func.params.iter().zip(args) {
                scope.define(param, value, false);
            }
        }
        self.frames.push(Frame::Function {
            name: func.name.clone(),
            body: func.body.clone(),
            index: 0,
            scope: activation,
            caller_scope: self.current_scope.clone(),
            sink,
        });
    }

    fn push_block(&mut self, body: &[Stmt]) {
        let scope = Scope::child(&self.current_scope);
        self.frames.push(Frame::Block {
            stmts: Rc::new(body.to_vec()),
            index: 0,
            scope,
        });
    }

    fn define_proc(&mut self, name: &Ident, params: &[Ident], body: &[Stmt]) {
        let func = Value::Func(Rc::new(FuncValue {
            name: name.name.clone(),
            params: params.iter().map(|param| param.name.clone()).collect(),
            body: Rc::new(body.to_vec()),
            scope: self.current_scope.clone(),
        }));
        self.current_scope.borrow_mut().define(&name.name, func, true);
    }

    fn define_type(&mut self, name: &Ident, fields: &[Ident]) {
        let ty = Value::Type(Rc::new(TypeValue {
            name: name.name.clone(),
            fields: fields.iter().map(|field| field.name.clone()).collect(),
        }));
        self.current_scope.borrow_mut().define(&name.name, ty, true);
    }

    fn exec_echo(&mut self, args: &[Expr]) -> Result<(), VmError> {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.eval_expr(arg)?;
            parts.push(render_value(&value));
        }
        self.output.push(parts.join(" "));
        Ok(())
    }

    fn assign_to_target(&mut self, target: &Expr, value: Value) -> Result<(), VmError> {
        match target {
            Expr::Ident(ident) => {
                Scope::assign(&self.current_scope, &ident.name, value).map_err(|err| match err {
                    AssignError::Undefined => runtime_error(
                        format!("Undefined variable '{}'", ident.name),
                        ident.span,
                    ),
                    AssignError::Constant => runtime_error(
                        format!("Cannot assign to constant '{}'", ident.name),
                        ident.span,
                    ),
                })
            }
            Expr::Index { base, index, span } => {
                let container = self.eval_expr(base)?;
                let key = self.eval_expr(index)?;
                match container {
                    Value::Array(items) => {
                        let idx = match key {
                            Value::Int(i) => i,
                            other => {
                                return Err(runtime_error(
                                    format!(
                                        "Array index must be an integer, got {}",
                                        type_name(&other)
                                    ),
                                    *span,
                                ))
                            }
                        };
                        let mut items = items.borrow_mut();
                        if idx < 0 || idx as usize >= items.len() {
                            return Err(runtime_error(
                                format!("Array index {idx} out of bounds"),
                                *span,
                            ));
                        }
                        items[idx as usize] = value;
                        Ok(())
                    }
                    Value::Table(entries) => match key {
                        Value::Str(key) => {
                            entries.borrow_mut().insert(key.as_ref().clone(), value);
                            Ok(())
                        }
                        _ => Err(runtime_error("Table key must be a string", *span)),
                    },
                    other => Err(runtime_error(
                        format!("Cannot index {}", type_name(&other)),
                        *span,
                    )),
                }
            }
            Expr::Member { base, name, span } => {
                let container = self.eval_expr(base)?;
                match container {
                    Value::Object(object) => {
                        object.borrow_mut().fields.insert(name.name.clone(), value);
                        Ok(())
                    }
                    other => Err(runtime_error(
                        format!(
                            "Cannot assign field '{}' on {}",
                            name.name,
                            type_name(&other)
                        ),
                        *span,
                    )),
                }
            }
            other => Err(runtime_error("Invalid assignment target", other.span())),
        }
    }

    // ---- expression evaluation ----

    /// Evaluate an expression against the current scope. User-defined
    /// calls encountered here (inside a larger expression) run eagerly to
    /// completion; statement-position calls go through the frame stack
    /// instead and never reach this path.
    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, VmError> {
        match expr {
            Expr::Int(value, _) => Ok(Value::Int(*value)),
            Expr::Float(value, _) => Ok(Value::Float(*value)),
            Expr::Str(value, _) => Ok(Value::string(value.clone())),
            Expr::Bool(value, _) => Ok(Value::Bool(*value)),
            Expr::Nil(_) => Ok(Value::Nil),
            Expr::Ident(ident) => Scope::lookup(&self.current_scope, &ident.name).ok_or_else(|| {
                runtime_error(format!("Undefined variable '{}'", ident.name), ident.span)
            }),
            Expr::Unary { op, expr, span } => {
                let value = self.eval_expr(expr)?;
                match op {
                    UnaryOp::Neg => match value {
                        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(runtime_error(
                            format!("Cannot negate {}", type_name(&other)),
                            *span,
                        )),
                    },
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Stringify => Ok(Value::string(render_value(&value))),
                }
            }
            Expr::Binary {
                left, op, right, span
            } => self.eval_binary(left, *op, right, *span),
            Expr::Call { callee, args, span } => {
                match self.prepare_call(callee, args, *span)? {
                    PreparedCall::User { func, args } => self.call_function_eager(&func, args),
                    PreparedCall::Immediate(value) => Ok(value),
                }
            }
            Expr::Index { base, index, span } => {
                let container = self.eval_expr(base)?;
                let key = self.eval_expr(index)?;
                self.eval_index(container, key, *span)
            }
            Expr::Member { base, name, span } => self.eval_member(base, name, *span),
            Expr::Array { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item)?);
                }
                Ok(Value::array(values))
            }
            Expr::Table { entries, span } => {
                let mut map = IndexMap::new();
                for (key, value) in entries {
                    let key = match self.eval_expr(key)? {
                        Value::Str(text) => text.as_ref().clone(),
                        _ => return Err(runtime_error("Table key must be a string", *span)),
                    };
                    let value = self.eval_expr(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Table(Rc::new(RefCell::new(map))))
            }
            Expr::SetConstructor { items, .. } => {
                let mut values: Vec<Value> = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.eval_expr(item)?;
                    if !values.iter().any(|existing| values_equal(existing, &value)) {
                        values.push(value);
                    }
                }
                Ok(Value::Set(Rc::new(RefCell::new(values))))
            }
            Expr::Range {
                start,
                end,
                inclusive,
                ..
            } => {
                let start = self.expect_int(start, "range bound")?;
                let end = self.expect_int(end, "range bound")?;
                Ok(Value::Range {
                    start,
                    end,
                    inclusive: *inclusive,
                })
            }
        }
    }

    fn expect_int(&mut self, expr: &Expr, what: &str) -> Result<i64, VmError> {
        match self.eval_expr(expr)? {
            Value::Int(i) => Ok(i),
            other => Err(runtime_error(
                format!("Expected int for {what}, got {}", type_name(&other)),
                expr.span(),
            )),
        }
    }

    fn eval_binary(
        &mut self,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        span: Span,
    ) -> Result<Value, VmError> {
        // and/or short-circuit and produce a boolean from truthiness.
        if op == BinaryOp::And {
            let lhs = self.eval_expr(left)?;
            if !truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            let rhs = self.eval_expr(right)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }
        if op == BinaryOp::Or {
            let lhs = self.eval_expr(left)?;
            if truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            let rhs = self.eval_expr(right)?;
            return Ok(Value::Bool(truthy(&rhs)));
        }

        let lhs = self.eval_expr(left)?;
        let rhs = self.eval_expr(right)?;
        match op {
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
            BinaryOp::Neq => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
            BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
                let ordering = compare_values(&lhs, &rhs).ok_or_else(|| {
                    runtime_error(
                        format!(
                            "Cannot compare {} and {}",
                            type_name(&lhs),
                            type_name(&rhs)
                        ),
                        span,
                    )
                })?;
                let result = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Lte => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(result))
            }
            BinaryOp::In => self.eval_membership(lhs, rhs, span),
            BinaryOp::Concat => Ok(Value::string(format!(
                "{}{}",
                render_value(&lhs),
                render_value(&rhs)
            ))),
            BinaryOp::Add => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
                (Value::Set(a), Value::Set(b)) => {
                    let mut union = a.borrow().clone();
                    for value in b.borrow().iter() {
                        if !union.iter().any(|existing| values_equal(existing, value)) {
                            union.push(value.clone());
                        }
                    }
                    Ok(Value::Set(Rc::new(RefCell::new(union))))
                }
                _ => {
                    let (a, b) = self.numeric_pair(&lhs, &rhs, "+", span)?;
                    Ok(Value::Float(a + b))
                }
            },
            BinaryOp::Sub => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
                (Value::Set(a), Value::Set(b)) => {
                    let b = b.borrow();
                    let difference = a
                        .borrow()
                        .iter()
                        .filter(|value| !b.iter().any(|other| values_equal(other, value)))
                        .cloned()
                        .collect();
                    Ok(Value::Set(Rc::new(RefCell::new(difference))))
                }
                _ => {
                    let (a, b) = self.numeric_pair(&lhs, &rhs, "-", span)?;
                    Ok(Value::Float(a - b))
                }
            },
            BinaryOp::Mul => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
                (Value::Set(a), Value::Set(b)) => {
                    let b = b.borrow();
                    let intersection = a
                        .borrow()
                        .iter()
                        .filter(|value| b.iter().any(|other| values_equal(other, value)))
                        .cloned()
                        .collect();
                    Ok(Value::Set(Rc::new(RefCell::new(intersection))))
                }
                _ => {
                    let (a, b) = self.numeric_pair(&lhs, &rhs, "*", span)?;
                    Ok(Value::Float(a * b))
                }
            },
            BinaryOp::Div => {
                let (a, b) = self.numeric_pair(&lhs, &rhs, "/", span)?;
                if b == 0.0 {
                    return Err(runtime_error("Division by zero", span));
                }
                Ok(Value::Float(a / b))
            }
            BinaryOp::IntDiv => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => {
                    if *b == 0 {
                        return Err(runtime_error("Division by zero", span));
                    }
                    Ok(Value::Int(a.wrapping_div(*b)))
                }
                _ => {
                    let (a, b) = self.numeric_pair(&lhs, &rhs, "div", span)?;
                    if b == 0.0 {
                        return Err(runtime_error("Division by zero", span));
                    }
                    Ok(Value::Float((a / b).trunc()))
                }
            },
            BinaryOp::Mod => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => {
                    if *b == 0 {
                        return Err(runtime_error("Modulo by zero", span));
                    }
                    Ok(Value::Int(a.wrapping_rem(*b)))
                }
                _ => {
                    let (a, b) = self.numeric_pair(&lhs, &rhs, "mod", span)?;
                    if b == 0.0 {
                        return Err(runtime_error("Modulo by zero", span));
                    }
                    Ok(Value::Float(a % b))
                }
            },
        }
    }

    fn numeric_pair(
        &self,
        lhs: &Value,
        rhs: &Value,
        op: &str,
        span: Span,
    ) -> Result<(f64, f64), VmError> {
        let a = match lhs {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            other => {
                return Err(runtime_error(
                    format!("Cannot apply {op} to {}", type_name(other)),
                    span,
                ))
            }
        };
        let b = match rhs {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            other => {
                return Err(runtime_error(
                    format!("Cannot apply {op} to {}", type_name(other)),
                    span,
                ))
            }
        };
        Ok((a, b))
    }

    fn eval_membership(&self, needle: Value, haystack: Value, span: Span) -> Result<Value, VmError> {
        match haystack {
            Value::Array(items) => Ok(Value::Bool(
                items.borrow().iter().any(|item| values_equal(item, &needle)),
            )),
            Value::Set(items) => Ok(Value::Bool(
                items.borrow().iter().any(|item| values_equal(item, &needle)),
            )),
            Value::Str(text) => match needle {
                Value::Str(sub) => Ok(Value::Bool(text.contains(sub.as_str()))),
                other => Err(runtime_error(
                    format!(
                        "Cannot test membership of {} in string",
                        type_name(&other)
                    ),
                    span,
                )),
            },
            Value::Table(entries) => match needle {
                Value::Str(key) => Ok(Value::Bool(entries.borrow().contains_key(key.as_str()))),
                _ => Err(runtime_error("Table key must be a string", span)),
            },
            other => Err(runtime_error(
                format!("Cannot test membership in {}", type_name(&other)),
                span,
            )),
        }
    }

    fn eval_index(&self, container: Value, key: Value, span: Span) -> Result<Value, VmError> {
        match container {
            Value::Array(items) => {
                let idx = match key {
                    Value::Int(i) => i,
                    other => {
                        return Err(runtime_error(
                            format!("Array index must be an integer, got {}", type_name(&other)),
                            span,
                        ))
                    }
                };
                let items = items.borrow();
                if idx < 0 || idx as usize >= items.len() {
                    return Err(runtime_error(
                        format!("Array index {idx} out of bounds"),
                        span,
                    ));
                }
                Ok(items[idx as usize].clone())
            }
            Value::Str(text) => {
                let idx = match key {
                    Value::Int(i) => i,
                    other => {
                        return Err(runtime_error(
                            format!("Array index must be an integer, got {}", type_name(&other)),
                            span,
                        ))
                    }
                };
                match text.chars().nth(idx.max(0) as usize) {
                    Some(ch) if idx >= 0 => Ok(Value::string(ch.to_string())),
                    _ => Err(runtime_error(
                        format!("String index {idx} out of bounds"),
                        span,
                    )),
                }
            }
            Value::Table(entries) => match key {
                // Missing table keys read as nil.
                Value::Str(key) => Ok(entries
                    .borrow()
                    .get(key.as_str())
                    .cloned()
                    .unwrap_or(Value::Nil)),
                _ => Err(runtime_error("Table key must be a string", span)),
            },
            other => Err(runtime_error(
                format!("Cannot index {}", type_name(&other)),
                span,
            )),
        }
    }

    /// Field access. Resolution order: object field, then a function of
    /// that name in the scope chain (invoked with the receiver as sole
    /// argument), then the `len`/`card` pseudo-fields.
    fn eval_member(&mut self, base: &Expr, name: &Ident, span: Span) -> Result<Value, VmError> {
        let receiver = self.eval_expr(base)?;
        if let Value::Object(object) = &receiver {
            let field = object.borrow().fields.get(&name.name).cloned();
            if let Some(value) = field {
                return Ok(value);
            }
        }
        if let Some(found) = Scope::lookup(&self.current_scope, &name.name) {
            match found {
                Value::Func(func) => {
                    if func.params.len() != 1 {
                        return Err(runtime_error(
                            format!("Expected {} arguments, got 1", func.params.len()),
                            span,
                        ));
                    }
                    return self.call_function_eager(&func, vec![receiver]);
                }
                Value::Native(native) => {
                    return (native.func)(&[receiver])
                        .map_err(|message| runtime_error(message, span));
                }
                _ => {}
            }
        }
        match &receiver {
            Value::Array(items) if name.name == "len" => {
                Ok(Value::Int(items.borrow().len() as i64))
            }
            Value::Str(text) if name.name == "len" => {
                Ok(Value::Int(text.chars().count() as i64))
            }
            Value::Table(entries) if name.name == "len" => {
                Ok(Value::Int(entries.borrow().len() as i64))
            }
            Value::Set(items) if name.name == "len" || name.name == "card" => {
                Ok(Value::Int(items.borrow().len() as i64))
            }
            Value::Object(object) => Err(runtime_error(
                format!(
                    "Object of type {} has no field '{}'",
                    object.borrow().type_name,
                    name.name
                ),
                span,
            )),
            other => Err(runtime_error(
                format!("Cannot access field '{}' on {}", name.name, type_name(other)),
                span,
            )),
        }
    }

    // ---- eager execution (calls inside expressions, interactive mode) ----

    /// Run a user-defined function to completion inside the current step.
    /// This is the fallback for calls embedded in larger expressions; it
    /// never pushes an execution frame, so it is invisible to stepping.
    fn call_function_eager(
        &mut self,
        func: &Rc<FuncValue>,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let saved_scope = self.current_scope.clone();
        let saved_control = self.control;
        self.control = ControlFlow::None;
        let activation = Scope::child(&func.scope);
        {
            let mut scope = activation.borrow_mut();
            for (param, value) in func.params.iter().zip(args) {
                scope.define(param, value, false);
            }
        }
        self.current_scope = activation;
        let result = self.exec_stmts_eager(&func.body);
        self.current_scope = saved_scope;
        result?;
        let value = if self.control == ControlFlow::Return {
            self.return_value.take().unwrap_or(Value::Nil)
        } else {
            Value::Nil
        };
        self.control = saved_control;
        Ok(value)
    }

    fn exec_stmts_eager(&mut self, stmts: &[Stmt]) -> Result<(), VmError> {
        for stmt in stmts {
            self.exec_stmt_eager(stmt)?;
            if self.control != ControlFlow::None {
                break;
            }
        }
        Ok(())
    }

    fn exec_block_eager(&mut self, stmts: &[Stmt]) -> Result<(), VmError> {
        let saved = self.current_scope.clone();
        self.current_scope = Scope::child(&saved);
        let result = self.exec_stmts_eager(stmts);
        self.current_scope = saved;
        result
    }

    /// Recursive statement execution, used for function bodies invoked
    /// eagerly and for interactive fragments. Mirrors the stepped
    /// dispatch, minus the frame bookkeeping.
    fn exec_stmt_eager(&mut self, stmt: &Stmt) -> Result<(), VmError> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                let result = self.eval_expr(value)?;
                self.current_scope
                    .borrow_mut()
                    .define(&name.name, result, true);
                Ok(())
            }
            Stmt::Var { name, value, .. } => {
                let result = self.eval_expr(value)?;
                self.current_scope
                    .borrow_mut()
                    .define(&name.name, result, false);
                Ok(())
            }
            Stmt::Assign { target, value, .. } => {
                let result = self.eval_expr(value)?;
                self.assign_to_target(target, result)
            }
            Stmt::Proc {
                name, params, body, ..
            } => {
                self.define_proc(name, params, body);
                Ok(())
            }
            Stmt::TypeDef { name, fields, .. } => {
                self.define_type(name, fields);
                Ok(())
            }
            Stmt::Echo { args, .. } => self.exec_echo(args),
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                for branch in branches {
                    let cond = self.eval_expr(&branch.condition)?;
                    if truthy(&cond) {
                        return self.exec_block_eager(&branch.body);
                    }
                }
                match else_body {
                    Some(body) => self.exec_block_eager(body),
                    None => Ok(()),
                }
            }
            Stmt::For {
                item, iter, body, ..
            } => {
                let iterable = self.eval_expr(iter)?;
                let items = materialize_iteration(iterable, iter.span())?;
                for value in items {
                    let saved = self.current_scope.clone();
                    let scope = Scope::child(&saved);
                    scope.borrow_mut().define(&item.name, value, true);
                    self.current_scope = scope;
                    let result = self.exec_stmts_eager(body);
                    self.current_scope = saved;
                    result?;
                    match self.control {
                        ControlFlow::Break => {
                            self.control = ControlFlow::None;
                            break;
                        }
                        ControlFlow::Continue => self.control = ControlFlow::None,
                        ControlFlow::Return => return Ok(()),
                        ControlFlow::None => {}
                    }
                }
                Ok(())
            }
            Stmt::While {
                condition, body, ..
            } => {
                let saved = self.current_scope.clone();
                let scope = Scope::child(&saved);
                loop {
                    self.current_scope = scope.clone();
                    let cond = match self.eval_expr(condition) {
                        Ok(cond) => cond,
                        Err(err) => {
                            self.current_scope = saved;
                            return Err(err);
                        }
                    };
                    if !truthy(&cond) {
                        break;
                    }
                    if let Err(err) = self.exec_stmts_eager(body) {
                        self.current_scope = saved;
                        return Err(err);
                    }
                    match self.control {
                        ControlFlow::Break => {
                            self.control = ControlFlow::None;
                            break;
                        }
                        ControlFlow::Continue => self.control = ControlFlow::None,
                        ControlFlow::Return => break,
                        ControlFlow::None => {}
                    }
                }
                self.current_scope = saved;
                Ok(())
            }
            Stmt::Break(_) => {
                self.control = ControlFlow::Break;
                Ok(())
            }
            Stmt::Continue(_) => {
                self.control = ControlFlow::Continue;
                Ok(())
            }
            Stmt::Return { expr, .. } => {
                let value = match expr {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::Nil,
                };
                self.return_value = Some(value);
                self.control = ControlFlow::Return;
                Ok(())
            }
            Stmt::Block { body, .. } => self.exec_block_eager(body),
            Stmt::Expr { expr, .. } => {
                self.eval_expr(expr)?;
                Ok(())
            }
        }
    }

    // ---- debug controls ----

    pub fn step_into(&mut self) -> Result<(), VmError> {
        self.step()
    }

    /// Single statements at the current level; a call dispatched by the
    /// statement runs to completion.
    pub fn step_over(&mut self) -> Result<(), VmError> {
        let depth = self.call_depth();
        self.step()?;
        while !self.finished && self.call_depth() > depth {
            self.step()?;
        }
        Ok(())
    }

    pub fn step_out(&mut self) -> Result<(), VmError> {
        let depth = self.call_depth();
        while !self.finished && self.call_depth() >= depth {
            self.step()?;
        }
        Ok(())
    }

    /// Step once to make progress, then run until a breakpoint line or
    /// the end. Breakpoints fire before the statement on that line
    /// executes.
    pub fn continue_to_breakpoint(&mut self) -> Result<(), VmError> {
        self.step()?;
        while !self.finished && !self.breakpoints.contains(&self.current_line) {
            self.step()?;
        }
        Ok(())
    }

    pub fn add_breakpoint(&mut self, line: u32) {
        self.breakpoints.insert(line);
    }

    pub fn remove_breakpoint(&mut self, line: u32) {
        self.breakpoints.remove(&line);
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn has_breakpoint(&self, line: u32) -> bool {
        self.breakpoints.contains(&line)
    }

    // ---- introspection ----

    pub fn current_line(&self) -> u32 {
        self.current_line
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of function frames currently on the stack.
    pub fn call_depth(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| matches!(frame, Frame::Function { .. }))
            .count()
    }

    /// Name of the innermost function the VM is paused in, if any.
    pub fn current_function(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| match frame {
            Frame::Function { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn current_scope(&self) -> ScopeRef {
        self.current_scope.clone()
    }

    pub fn global_scope(&self) -> ScopeRef {
        self.globals.clone()
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    // ---- interactive evaluation ----

    /// Parse and evaluate a fragment against the current paused state.
    /// Bindings and container mutations made by the fragment persist, but
    /// the frame stack, current line, and finished flag are untouched;
    /// `echo` output from the fragment is captured separately and never
    /// reaches the main output stream.
    pub fn run_interactive(&mut self, source: &str) -> InteractiveResult {
        let program = match parse_fragment(source) {
            Ok(program) => program,
            Err(err) => {
                return InteractiveResult {
                    success: false,
                    value: Value::Nil,
                    error: Some(err.to_string()),
                    output: Vec::new(),
                }
            }
        };
        if program.stmts.is_empty() {
            return InteractiveResult {
                success: true,
                value: Value::Nil,
                error: None,
                output: Vec::new(),
            };
        }

        let saved_output = std::mem::take(&mut self.output);
        let saved_line = self.current_line;
        let saved_finished = self.finished;
        let saved_control = self.control;
        let saved_return = self.return_value.take();
        let saved_scope = self.current_scope.clone();
        self.control = ControlFlow::None;

        let mut value = Value::Nil;
        let mut error = None;
        for stmt in &program.stmts {
            let result = match stmt {
                Stmt::Expr { expr, .. } => match self.eval_expr(expr) {
                    Ok(result) => {
                        value = result;
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                other => {
                    value = Value::Nil;
                    self.exec_stmt_eager(other)
                }
            };
            if let Err(err) = result {
                error = Some(err.to_string());
                break;
            }
            if self.control != ControlFlow::None {
                // A stray return/break/continue just ends the fragment.
                break;
            }
        }

        let captured = std::mem::replace(&mut self.output, saved_output);
        self.current_line = saved_line;
        self.finished = saved_finished;
        self.control = saved_control;
        self.return_value = saved_return;
        self.current_scope = saved_scope;

        let success = error.is_none();
        InteractiveResult {
            success,
            value: if success { value } else { Value::Nil },
            error,
            output: captured,
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-compute the iteration values for a `for` loop: a range yields its
/// integers, an array a snapshot of its elements, a string its characters.
fn materialize_iteration(value: Value, span: Span) -> Result<Vec<Value>, VmError> {
    match value {
        Value::Range {
            start,
            end,
            inclusive,
        } => {
            let mut items = Vec::new();
            let mut i = start;
            loop {
                let done = if inclusive { i > end } else { i >= end };
                if done {
                    break;
                }
                items.push(Value::Int(i));
                i = match i.checked_add(1) {
                    Some(next) => next,
                    None => break,
                };
            }
            Ok(items)
        }
        Value::Array(items) => Ok(items.borrow().clone()),
        Value::Str(text) => Ok(text
            .chars()
            .map(|ch| Value::string(ch.to_string()))
            .collect()),
        other => Err(runtime_error(
            format!("Cannot iterate over {}", type_name(&other)),
            span,
        )),
    }
}

// ---- built-in native functions ----

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), String> {
    if args.len() != count {
        let plural = if count == 1 { "argument" } else { "arguments" };
        return Err(format!("{name} expects {count} {plural}, got {}", args.len()));
    }
    Ok(())
}

fn set_insert(items: &mut Vec<Value>, value: Value) {
    if !items.iter().any(|existing| values_equal(existing, &value)) {
        items.push(value);
    }
}

fn numeric(name: &str, value: &Value) -> Result<f64, String> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(format!("{name} expects a number, got {}", type_name(other))),
    }
}

fn install_builtins(globals: &ScopeRef) {
    let mut scope = globals.borrow_mut();
    let mut native = |name: &str, func: Box<dyn Fn(&[Value]) -> Result<Value, String>>| {
        scope.define(
            name,
            Value::Native(Rc::new(NativeValue {
                name: name.to_string(),
                func,
            })),
            true,
        );
    };

    native(
        "len",
        Box::new(|args| {
            expect_args("len", args, 1)?;
            match &args[0] {
                Value::Array(items) => Ok(Value::Int(items.borrow().len() as i64)),
                Value::Str(text) => Ok(Value::Int(text.chars().count() as i64)),
                Value::Table(entries) => Ok(Value::Int(entries.borrow().len() as i64)),
                Value::Set(items) => Ok(Value::Int(items.borrow().len() as i64)),
                other => Err(format!(
                    "len expects array, string, table, or set, got {}",
                    type_name(other)
                )),
            }
        }),
    );

    native(
        "str",
        Box::new(|args| {
            expect_args("str", args, 1)?;
            Ok(Value::string(render_value(&args[0])))
        }),
    );

    native(
        "int",
        Box::new(|args| {
            expect_args("int", args, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| format!("cannot convert \"{text}\" to int")),
                other => Err(format!("cannot convert {} to int", type_name(other))),
            }
        }),
    );

    native(
        "float",
        Box::new(|args| {
            expect_args("float", args, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::Str(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("cannot convert \"{text}\" to float")),
                other => Err(format!("cannot convert {} to float", type_name(other))),
            }
        }),
    );

    native(
        "typeof",
        Box::new(|args| {
            expect_args("typeof", args, 1)?;
            match &args[0] {
                Value::Object(object) => Ok(Value::string(object.borrow().type_name.clone())),
                other => Ok(Value::string(type_name(other))),
            }
        }),
    );

    native(
        "push",
        Box::new(|args| {
            expect_args("push", args, 2)?;
            match &args[0] {
                Value::Array(items) => {
                    items.borrow_mut().push(args[1].clone());
                    Ok(Value::Nil)
                }
                other => Err(format!("push expects an array, got {}", type_name(other))),
            }
        }),
    );

    native(
        "pop",
        Box::new(|args| {
            expect_args("pop", args, 1)?;
            match &args[0] {
                Value::Array(items) => items
                    .borrow_mut()
                    .pop()
                    .ok_or_else(|| "pop from empty array".to_string()),
                other => Err(format!("pop expects an array, got {}", type_name(other))),
            }
        }),
    );

    native(
        "keys",
        Box::new(|args| {
            expect_args("keys", args, 1)?;
            match &args[0] {
                Value::Table(entries) => Ok(Value::array(
                    entries
                        .borrow()
                        .keys()
                        .map(|key| Value::string(key.clone()))
                        .collect(),
                )),
                other => Err(format!("keys expects a table, got {}", type_name(other))),
            }
        }),
    );

    native(
        "values",
        Box::new(|args| {
            expect_args("values", args, 1)?;
            match &args[0] {
                Value::Table(entries) => {
                    Ok(Value::array(entries.borrow().values().cloned().collect()))
                }
                other => Err(format!("values expects a table, got {}", type_name(other))),
            }
        }),
    );

    native(
        "hasKey",
        Box::new(|args| {
            expect_args("hasKey", args, 2)?;
            match (&args[0], &args[1]) {
                (Value::Table(entries), Value::Str(key)) => {
                    Ok(Value::Bool(entries.borrow().contains_key(key.as_str())))
                }
                (Value::Table(_), other) => Err(format!(
                    "hasKey expects a string key, got {}",
                    type_name(other)
                )),
                (other, _) => Err(format!("hasKey expects a table, got {}", type_name(other))),
            }
        }),
    );

    native(
        "abs",
        Box::new(|args| {
            expect_args("abs", args, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(format!("abs expects a number, got {}", type_name(other))),
            }
        }),
    );

    native(
        "min",
        Box::new(|args| {
            expect_args("min", args, 2)?;
            if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
                return Ok(Value::Int(*a.min(b)));
            }
            let a = numeric("min", &args[0])?;
            let b = numeric("min", &args[1])?;
            Ok(Value::Float(a.min(b)))
        }),
    );

    native(
        "max",
        Box::new(|args| {
            expect_args("max", args, 2)?;
            if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
                return Ok(Value::Int(*a.max(b)));
            }
            let a = numeric("max", &args[0])?;
            let b = numeric("max", &args[1])?;
            Ok(Value::Float(a.max(b)))
        }),
    );

    native(
        "contains",
        Box::new(|args| {
            expect_args("contains", args, 2)?;
            match (&args[0], &args[1]) {
                (Value::Array(items), needle) => Ok(Value::Bool(
                    items.borrow().iter().any(|item| values_equal(item, needle)),
                )),
                (Value::Set(items), needle) => Ok(Value::Bool(
                    items.borrow().iter().any(|item| values_equal(item, needle)),
                )),
                (Value::Str(text), Value::Str(sub)) => {
                    Ok(Value::Bool(text.contains(sub.as_str())))
                }
                (Value::Table(entries), Value::Str(key)) => {
                    Ok(Value::Bool(entries.borrow().contains_key(key.as_str())))
                }
                (Value::Str(_), other) | (Value::Table(_), other) => Err(format!(
                    "contains expects a string needle here, got {}",
                    type_name(other)
                )),
                (other, _) => Err(format!(
                    "contains expects array, set, string, or table, got {}",
                    type_name(other)
                )),
            }
        }),
    );

    native(
        "incl",
        Box::new(|args| {
            expect_args("incl", args, 2)?;
            match &args[0] {
                Value::Set(items) => {
                    set_insert(&mut items.borrow_mut(), args[1].clone());
                    Ok(Value::Nil)
                }
                other => Err(format!("incl expects a set, got {}", type_name(other))),
            }
        }),
    );

    native(
        "excl",
        Box::new(|args| {
            expect_args("excl", args, 2)?;
            match &args[0] {
                Value::Set(items) => {
                    items
                        .borrow_mut()
                        .retain(|item| !values_equal(item, &args[1]));
                    Ok(Value::Nil)
                }
                other => Err(format!("excl expects a set, got {}", type_name(other))),
            }
        }),
    );

    native(
        "card",
        Box::new(|args| {
            expect_args("card", args, 1)?;
            match &args[0] {
                Value::Set(items) => Ok(Value::Int(items.borrow().len() as i64)),
                other => Err(format!("card expects a set, got {}", type_name(other))),
            }
        }),
    );

    native(
        "del",
        Box::new(|args| {
            expect_args("del", args, 2)?;
            match (&args[0], &args[1]) {
                (Value::Table(entries), Value::Str(key)) => {
                    entries.borrow_mut().shift_remove(key.as_str());
                    Ok(Value::Nil)
                }
                (Value::Array(items), Value::Int(idx)) => {
                    let mut items = items.borrow_mut();
                    if *idx < 0 || *idx as usize >= items.len() {
                        return Err(format!("Array index {idx} out of bounds"));
                    }
                    items.remove(*idx as usize);
                    Ok(Value::Nil)
                }
                (Value::Table(_), other) => {
                    Err(format!("Table key must be a string, got {}", type_name(other)))
                }
                (Value::Array(_), other) => Err(format!(
                    "Array index must be an integer, got {}",
                    type_name(other)
                )),
                (other, _) => Err(format!(
                    "del expects a table or array, got {}",
                    type_name(other)
                )),
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::{format_value, values_equal, Scope, Value, Vm, VmError};
    use nimmy_parser::parse_program;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn load_vm(source: &str) -> Vm {
        let program = parse_program(source).expect("parse program");
        let mut vm = Vm::new();
        vm.load(&program);
        vm
    }

    fn run_source(source: &str) -> Vm {
        let program = parse_program(source).expect("parse program");
        let mut vm = Vm::new();
        vm.eval(&program).expect("eval program");
        vm
    }

    fn run_err(source: &str) -> VmError {
        let program = parse_program(source).expect("parse program");
        let mut vm = Vm::new();
        vm.eval(&program).expect_err("expected runtime error")
    }

    fn set_of(items: Vec<Value>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    #[test]
    fn steps_through_straight_line_program() {
        let mut vm = load_vm("let a = 1\nlet b = 2\nlet c = 3\n");
        assert_eq!(vm.current_line(), 1);
        assert!(!vm.is_finished());
        vm.step().expect("step");
        assert_eq!(vm.current_line(), 2);
        vm.step().expect("step");
        assert_eq!(vm.current_line(), 3);
        vm.step().expect("step");
        assert!(vm.is_finished());
        assert_eq!(vm.get_global("a"), Some(Value::Int(1)));
        assert_eq!(vm.get_global("b"), Some(Value::Int(2)));
        assert_eq!(vm.get_global("c"), Some(Value::Int(3)));
    }

    #[test]
    fn step_into_enters_function_body() {
        let source = "proc add(a, b) =\n  return a + b\n\nlet result = add(3, 4)\n";
        let mut vm = load_vm(source);
        assert_eq!(vm.current_line(), 1);
        vm.step_into().expect("step");
        assert_eq!(vm.current_line(), 4);
        vm.step_into().expect("step");
        assert_eq!(vm.current_line(), 2);
        assert_eq!(vm.call_depth(), 1);
        vm.step_into().expect("step");
        assert!(vm.is_finished());
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.get_global("result"), Some(Value::Int(7)));
    }

    #[test]
    fn step_over_runs_call_to_completion() {
        let source = "proc add(a, b) =\n  return a + b\n\nlet result = add(3, 4)\n\nlet y = 10\n";
        let mut vm = load_vm(source);
        vm.step_over().expect("step over");
        assert_eq!(vm.current_line(), 4);
        vm.step_over().expect("step over");
        assert_eq!(vm.current_line(), 6);
        assert_eq!(vm.get_global("result"), Some(Value::Int(7)));
        vm.step_over().expect("step over");
        assert!(vm.is_finished());
        assert_eq!(vm.get_global("y"), Some(Value::Int(10)));
    }

    #[test]
    fn step_over_non_call_statement_is_one_step() {
        let mut vm = load_vm("let a = 1\nlet b = 2\n");
        vm.step_over().expect("step over");
        assert_eq!(vm.current_line(), 2);
        assert_eq!(vm.get_global("a"), Some(Value::Int(1)));
        assert_eq!(vm.get_global("b"), None);
    }

    #[test]
    fn step_over_does_not_swallow_if_blocks() {
        let source = "var x = 0\nif true:\n  x = 1\n  x = 2\nlet y = 3\n";
        let mut vm = load_vm(source);
        vm.step_over().expect("step over");
        assert_eq!(vm.current_line(), 2);
        vm.step_over().expect("step over");
        // The branch was entered, not run to completion.
        assert_eq!(vm.current_line(), 3);
        assert_eq!(vm.get_global("x"), Some(Value::Int(0)));
    }

    #[test]
    fn continue_stops_at_breakpoint_inside_function() {
        let source = "proc compute(n) =\n  let a = n * 2\n  let b = a + 1\n  return b\n\nlet result = compute(5)\n";
        let mut vm = load_vm(source);
        vm.add_breakpoint(3);
        vm.continue_to_breakpoint().expect("continue");
        assert!(!vm.is_finished());
        assert_eq!(vm.current_line(), 3);
        assert_eq!(vm.call_depth(), 1);
        assert_eq!(vm.current_function(), Some("compute"));
        assert_eq!(
            Scope::lookup(&vm.current_scope(), "a"),
            Some(Value::Int(10))
        );
        vm.continue_to_breakpoint().expect("continue");
        assert!(vm.is_finished());
        assert_eq!(vm.get_global("result"), Some(Value::Int(11)));
    }

    #[test]
    fn step_out_returns_to_caller_level() {
        let source = "proc compute(n) =\n  let a = n * 2\n  let b = a + 1\n  return b\n\nlet result = compute(5)\n";
        let mut vm = load_vm(source);
        vm.add_breakpoint(3);
        vm.continue_to_breakpoint().expect("continue");
        assert_eq!(vm.call_depth(), 1);
        vm.step_out().expect("step out");
        assert_eq!(vm.call_depth(), 0);
        assert!(vm.is_finished());
        assert_eq!(vm.get_global("result"), Some(Value::Int(11)));
    }

    #[test]
    fn for_loop_line_sequence_and_accumulation() {
        let source = "var sum = 0\nfor i in 1..3:\n  sum = sum + i\nlet done = true\n";
        let mut vm = load_vm(source);
        let mut lines = Vec::new();
        while !vm.is_finished() {
            lines.push(vm.current_line());
            vm.step().expect("step");
        }
        assert_eq!(lines, vec![1, 2, 3, 3, 3, 4]);
        assert_eq!(vm.get_global("sum"), Some(Value::Int(6)));
        assert_eq!(vm.get_global("done"), Some(Value::Bool(true)));
    }

    #[test]
    fn interactive_does_not_perturb_state() {
        let mut vm = load_vm("let a = 1\nlet b = 2\nlet c = 3\n");
        vm.step().expect("step");
        assert_eq!(vm.current_line(), 2);
        let result = vm.run_interactive("a + 100");
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.value, Value::Int(101));
        assert_eq!(vm.current_line(), 2);
        assert!(!vm.is_finished());
        vm.step().expect("step");
        assert_eq!(vm.current_line(), 3);
    }

    #[test]
    fn interactive_runtime_error_leaves_state_unchanged() {
        let mut vm = load_vm("let a = 1\nlet b = 2\nlet c = 3\n");
        vm.step().expect("step");
        let scope_before = vm.current_scope();
        let frames_before = vm.frames.len();
        let result = vm.run_interactive("1 / 0");
        assert!(!result.success);
        let message = result.error.expect("error message");
        assert!(message.contains("Division by zero"), "{message}");
        assert!(message.contains("error"), "{message}");
        assert_eq!(result.value, Value::Nil);
        assert_eq!(vm.current_line(), 2);
        assert_eq!(vm.frames.len(), frames_before);
        assert!(Rc::ptr_eq(&scope_before, &vm.current_scope()));
        vm.step().expect("step");
        assert_eq!(vm.current_line(), 3);
    }

    #[test]
    fn interactive_parse_error_is_reported() {
        let mut vm = Vm::new();
        let result = vm.run_interactive("let = 1");
        assert!(!result.success);
        assert!(result.error.expect("error message").contains("error"));
    }

    #[test]
    fn interactive_captures_echo_separately() {
        let mut vm = load_vm("echo \"main\"\nlet a = 1\n");
        vm.step().expect("step");
        let result = vm.run_interactive("echo \"aside\"");
        assert!(result.success);
        assert_eq!(result.output, vec!["aside".to_string()]);
        assert_eq!(vm.output(), &["main".to_string()]);
    }

    #[test]
    fn interactive_bindings_persist() {
        let mut vm = Vm::new();
        let first = vm.run_interactive("let q = 5");
        assert!(first.success);
        let second = vm.run_interactive("q + 1");
        assert!(second.success);
        assert_eq!(second.value, Value::Int(6));
    }

    #[test]
    fn interactive_empty_fragment_is_nil_success() {
        let mut vm = Vm::new();
        let result = vm.run_interactive("   \n  \n");
        assert!(result.success);
        assert_eq!(result.value, Value::Nil);
        assert!(result.error.is_none());
    }

    #[test]
    fn eval_matches_stepped_execution() {
        let source = "proc square(x) =\n  return x * x\n\nvar total = 0\nfor i in 1..4:\n  if i mod 2 == 0:\n    total = total + square(i)\nlet result = total\n";
        let program = parse_program(source).expect("parse program");
        let mut eager = Vm::new();
        eager.eval(&program).expect("eval");
        let mut stepped = Vm::new();
        stepped.load(&program);
        while !stepped.is_finished() {
            stepped.step().expect("step");
        }
        assert_eq!(eager.get_global("total"), stepped.get_global("total"));
        assert_eq!(eager.get_global("result"), Some(Value::Int(20)));
    }

    #[test]
    fn call_depth_tracks_function_frames() {
        let source = "proc inner(x) =\n  return x\n\nproc outer(x) =\n  let y = inner(x)\n  return y\n\nlet result = outer(1)\n";
        let mut vm = load_vm(source);
        let mut max_depth = 0;
        while !vm.is_finished() {
            max_depth = max_depth.max(vm.call_depth());
            vm.step().expect("step");
        }
        assert_eq!(max_depth, 2);
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.get_global("result"), Some(Value::Int(1)));
    }

    #[test]
    fn breakpoints_survive_reload() {
        let program = parse_program("let a = 1\nlet b = 2\nlet c = 3\n").expect("parse program");
        let mut vm = Vm::new();
        vm.add_breakpoint(2);
        vm.load(&program);
        vm.continue_to_breakpoint().expect("continue");
        assert_eq!(vm.current_line(), 2);
        vm.load(&program);
        assert!(vm.has_breakpoint(2));
        vm.continue_to_breakpoint().expect("continue");
        assert_eq!(vm.current_line(), 2);
    }

    #[test]
    fn breakpoint_management() {
        let mut vm = Vm::new();
        vm.add_breakpoint(3);
        vm.add_breakpoint(7);
        assert!(vm.has_breakpoint(3));
        vm.remove_breakpoint(3);
        assert!(!vm.has_breakpoint(3));
        assert!(vm.has_breakpoint(7));
        vm.clear_breakpoints();
        assert!(!vm.has_breakpoint(7));
    }

    #[test]
    fn return_value_delivered_to_assignment_target() {
        let source = "proc five() =\n  return 5\n\nvar x = 0\nx = five()\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("x"), Some(Value::Int(5)));
    }

    #[test]
    fn return_value_delivered_to_index_target() {
        let source = "proc five() =\n  return 5\n\nvar xs = [0, 0]\nxs[1] = five()\n";
        let vm = run_source(source);
        assert_eq!(
            vm.get_global("xs"),
            Some(Value::array(vec![Value::Int(0), Value::Int(5)]))
        );
    }

    #[test]
    fn bare_call_discards_return_value() {
        let source = "proc noop() =\n  return 7\n\nnoop()\nlet after = 1\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("after"), Some(Value::Int(1)));
    }

    #[test]
    fn calls_inside_expressions_run_eagerly() {
        let source = "proc double(x) =\n  return x * 2\n\nlet a = double(2) + double(3)\n";
        let mut vm = load_vm(source);
        vm.step().expect("step");
        // The whole binding completes in one step; the embedded calls
        // never appear on the frame stack.
        vm.step().expect("step");
        assert!(vm.is_finished());
        assert_eq!(vm.get_global("a"), Some(Value::Int(10)));
    }

    #[test]
    fn closures_capture_per_iteration_scopes() {
        let source = "var procs = []\nfor i in 1..2:\n  proc f() =\n    return i\n  push(procs, f)\nlet a = procs[0]()\nlet b = procs[1]()\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("a"), Some(Value::Int(1)));
        assert_eq!(vm.get_global("b"), Some(Value::Int(2)));
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        let source = "var n = 0\nvar total = 0\nwhile true:\n  n = n + 1\n  if n > 5:\n    break\n  if n mod 2 == 0:\n    continue\n  total = total + n\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("total"), Some(Value::Int(9)));
        assert_eq!(vm.get_global("n"), Some(Value::Int(6)));
    }

    #[test]
    fn for_loop_over_array_string_and_exclusive_range() {
        let source = "var total = 0\nfor x in [1, 2, 3]:\n  total = total + x\nvar out = \"\"\nfor c in \"abc\":\n  out = out & c\nvar small = 0\nfor i in 0..<3:\n  small = small + i\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("total"), Some(Value::Int(6)));
        assert_eq!(vm.get_global("out"), Some(Value::string("abc")));
        assert_eq!(vm.get_global("small"), Some(Value::Int(3)));
    }

    #[test]
    fn if_elif_else_branching() {
        let source = "proc pick(n) =\n  if n < 0:\n    return \"neg\"\n  elif n == 0:\n    return \"zero\"\n  else:\n    return \"pos\"\n\nlet a = pick(0 - 5)\nlet b = pick(0)\nlet c = pick(5)\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("a"), Some(Value::string("neg")));
        assert_eq!(vm.get_global("b"), Some(Value::string("zero")));
        assert_eq!(vm.get_global("c"), Some(Value::string("pos")));
    }

    #[test]
    fn arithmetic_promotion_and_division() {
        let source = "let a = 7 div 2\nlet b = 7 mod 2\nlet c = 7 % 2\nlet d = 1 + 2.5\nlet e = 10 / 4\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("a"), Some(Value::Int(3)));
        assert_eq!(vm.get_global("b"), Some(Value::Int(1)));
        assert_eq!(vm.get_global("c"), Some(Value::Int(1)));
        assert_eq!(vm.get_global("d"), Some(Value::Float(3.5)));
        assert_eq!(vm.get_global("e"), Some(Value::Float(2.5)));
    }

    #[test]
    fn division_by_zero_messages() {
        let err = run_err("echo 1 / 0\n");
        assert!(err.message().contains("Division by zero"), "{err}");
        assert!(err.to_string().starts_with("runtime error at line 1"), "{err}");
        let err = run_err("echo 1 mod 0\n");
        assert!(err.message().contains("Modulo by zero"), "{err}");
        let err = run_err("echo 1 div 0\n");
        assert!(err.message().contains("Division by zero"), "{err}");
    }

    #[test]
    fn undefined_variable_message() {
        let err = run_err("echo nope\n");
        assert_eq!(err.message(), "Undefined variable 'nope'");
    }

    #[test]
    fn constant_assignment_is_rejected() {
        let err = run_err("let a = 1\na = 2\n");
        assert_eq!(err.message(), "Cannot assign to constant 'a'");
        let vm = run_source("var a = 1\na = 2\n");
        assert_eq!(vm.get_global("a"), Some(Value::Int(2)));
    }

    #[test]
    fn array_index_errors() {
        let err = run_err("let xs = [1]\necho xs[5]\n");
        assert_eq!(err.message(), "Array index 5 out of bounds");
        let err = run_err("echo 3[0]\n");
        assert_eq!(err.message(), "Cannot index int");
    }

    #[test]
    fn table_reads_and_key_errors() {
        let source = "let t = {\"a\": 1}\nlet missing = t[\"b\"]\nlet v = t[\"a\"]\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("missing"), Some(Value::Nil));
        assert_eq!(vm.get_global("v"), Some(Value::Int(1)));
        let err = run_err("let t = {\"a\": 1}\necho t[1]\n");
        assert_eq!(err.message(), "Table key must be a string");
    }

    #[test]
    fn arity_mismatch_message() {
        let err = run_err("proc f(a, b) =\n  return a\n\nf(1)\n");
        assert_eq!(err.message(), "Expected 2 arguments, got 1");
    }

    #[test]
    fn calling_a_non_callable_fails() {
        let err = run_err("let x = 5\nx(1)\n");
        assert_eq!(err.message(), "Cannot call int");
    }

    #[test]
    fn iterating_a_non_iterable_fails() {
        let err = run_err("for x in 5:\n  echo x\n");
        assert_eq!(err.message(), "Cannot iterate over int");
    }

    #[test]
    fn echo_joins_arguments_with_spaces() {
        let mut vm = Vm::new();
        let out = vm.run("echo 1, \"two\", 3.0\n").expect("run");
        assert_eq!(out, "1 two 3.0\n");
        assert!(vm.output().is_empty());
    }

    #[test]
    fn string_operators() {
        let source = "let s = \"ab\" & 1\nlet t = $42\nlet c = \"hello\"[1]\nlet has = \"ell\" in \"hello\"\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("s"), Some(Value::string("ab1")));
        assert_eq!(vm.get_global("t"), Some(Value::string("42")));
        assert_eq!(vm.get_global("c"), Some(Value::string("e")));
        assert_eq!(vm.get_global("has"), Some(Value::Bool(true)));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let source = "let a = false and missing\nlet b = true or missing\nlet c = not 0\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("a"), Some(Value::Bool(false)));
        assert_eq!(vm.get_global("b"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("c"), Some(Value::Bool(true)));
    }

    #[test]
    fn set_operations() {
        let source = "let a = {1, 2, 3}\nlet b = {2, 3, 4}\nlet u = a + b\nlet d = a - b\nlet i = a * b\nlet dup = {1, 1, 2}\nlet has = 2 in a\n";
        let vm = run_source(source);
        assert_eq!(
            vm.get_global("u"),
            Some(set_of(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(4)
            ]))
        );
        assert_eq!(vm.get_global("d"), Some(set_of(vec![Value::Int(1)])));
        assert_eq!(
            vm.get_global("i"),
            Some(set_of(vec![Value::Int(2), Value::Int(3)]))
        );
        assert_eq!(
            vm.get_global("dup"),
            Some(set_of(vec![Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(vm.get_global("has"), Some(Value::Bool(true)));
    }

    #[test]
    fn set_builtins() {
        let source = "let s = {1, 2}\nincl(s, 3)\nincl(s, 1)\nexcl(s, 2)\nlet n = card(s)\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("n"), Some(Value::Int(2)));
        assert_eq!(
            vm.get_global("s"),
            Some(set_of(vec![Value::Int(1), Value::Int(3)]))
        );
    }

    #[test]
    fn objects_construct_access_and_mutate() {
        let source = "type Point = object\n  x\n  y\n\nlet p = Point(1, 2)\nlet sum = p.x + p.y\np.x = 10\nlet after = p.x\nlet kind = typeof(p)\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("sum"), Some(Value::Int(3)));
        assert_eq!(vm.get_global("after"), Some(Value::Int(10)));
        assert_eq!(vm.get_global("kind"), Some(Value::string("Point")));
    }

    #[test]
    fn missing_object_field_fails() {
        let err = run_err("type Point = object\n  x\n  y\n\nlet p = Point(1, 2)\necho p.z\n");
        assert!(err.message().contains("no field 'z'"), "{err}");
    }

    #[test]
    fn constructor_arity_is_checked() {
        let err = run_err("type Point = object\n  x\n  y\n\nlet p = Point(1)\n");
        assert_eq!(err.message(), "Expected 2 arguments, got 1");
    }

    #[test]
    fn ufcs_on_builtin_and_pseudo_fields() {
        let source = "let xs = [1, 2, 3]\nlet n = xs.len\nxs.push(4)\nlet m = len(xs)\nlet s = {1, 2}\nlet k = s.card\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("n"), Some(Value::Int(3)));
        assert_eq!(vm.get_global("m"), Some(Value::Int(4)));
        assert_eq!(vm.get_global("k"), Some(Value::Int(2)));
    }

    #[test]
    fn ufcs_on_user_function() {
        let source = "proc double(x) =\n  return x * 2\n\nlet y = 5.double()\nlet z = 5.double\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("y"), Some(Value::Int(10)));
        assert_eq!(vm.get_global("z"), Some(Value::Int(10)));
    }

    #[test]
    fn object_method_fields_receive_the_object() {
        let source = "type Counter = object\n  count\n\nproc bump(c) =\n  c.count = c.count + 1\n  return c.count\n\nlet c = Counter(0)\nlet a = c.bump()\nlet b = c.bump()\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("a"), Some(Value::Int(1)));
        assert_eq!(vm.get_global("b"), Some(Value::Int(2)));
    }

    #[test]
    fn arrays_share_by_reference() {
        let source = "let xs = [1, 2]\nlet ys = xs\npush(ys, 3)\nlet n = len(xs)\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("n"), Some(Value::Int(3)));
    }

    #[test]
    fn table_builtins() {
        let source = "let t = {\"a\": 1, \"b\": 2}\nlet ks = keys(t)\nlet vs = values(t)\nlet has = hasKey(t, \"a\")\ndel(t, \"a\")\nlet gone = hasKey(t, \"a\")\n";
        let vm = run_source(source);
        assert_eq!(
            vm.get_global("ks"),
            Some(Value::array(vec![
                Value::string("a"),
                Value::string("b")
            ]))
        );
        assert_eq!(
            vm.get_global("vs"),
            Some(Value::array(vec![Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(vm.get_global("has"), Some(Value::Bool(true)));
        assert_eq!(vm.get_global("gone"), Some(Value::Bool(false)));
    }

    #[test]
    fn numeric_builtins() {
        let source = "let a = abs(0 - 5)\nlet b = min(3, 7)\nlet c = max(3, 7)\nlet d = int(3.9)\nlet e = float(2)\nlet f = int(\"42\")\nlet g = str(12)\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("a"), Some(Value::Int(5)));
        assert_eq!(vm.get_global("b"), Some(Value::Int(3)));
        assert_eq!(vm.get_global("c"), Some(Value::Int(7)));
        assert_eq!(vm.get_global("d"), Some(Value::Int(3)));
        assert_eq!(vm.get_global("e"), Some(Value::Float(2.0)));
        assert_eq!(vm.get_global("f"), Some(Value::Int(42)));
        assert_eq!(vm.get_global("g"), Some(Value::string("12")));
    }

    #[test]
    fn host_native_functions() {
        let mut vm = Vm::new();
        vm.add_native("twice", |args| match args {
            [Value::Int(n)] => Ok(Value::Int(n * 2)),
            _ => Err("twice expects one int".to_string()),
        });
        let out = vm.run("echo twice(21)\n").expect("run");
        assert_eq!(out, "42\n");
    }

    #[test]
    fn native_errors_carry_the_call_site() {
        let mut vm = Vm::new();
        vm.add_native("boom", |_| Err("kaboom".to_string()));
        let program = parse_program("let a = 1\nboom()\n").expect("parse program");
        let err = vm.eval(&program).expect_err("expected runtime error");
        assert_eq!(err.message(), "kaboom");
        assert_eq!(err.span().line, 2);
    }

    #[test]
    fn globals_accessible_from_scripts() {
        let mut vm = Vm::new();
        vm.set_global("x", Value::Int(5));
        let out = vm.run("echo x + 1\n").expect("run");
        assert_eq!(out, "6\n");
        assert_eq!(vm.get_global("x"), Some(Value::Int(5)));
    }

    #[test]
    fn globals_persist_across_loads() {
        let mut vm = Vm::new();
        vm.run("var counter = 1\n").expect("run");
        vm.run("counter = counter + 1\n").expect("run");
        assert_eq!(vm.get_global("counter"), Some(Value::Int(2)));
    }

    #[test]
    fn block_statement_scopes_bindings() {
        let source = "var seen = 0\nblock:\n  let inner = 5\n  seen = inner\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("seen"), Some(Value::Int(5)));
        assert_eq!(vm.get_global("inner"), None);
    }

    #[test]
    fn truthiness_in_conditions() {
        let source = "var out = \"\"\nif 0:\n  out = \"zero\"\nelse:\n  out = \"nonzero\"\nvar empty = \"\"\nif \"\":\n  empty = \"yes\"\nelse:\n  empty = \"no\"\n";
        let vm = run_source(source);
        assert_eq!(vm.get_global("out"), Some(Value::string("nonzero")));
        assert_eq!(vm.get_global("empty"), Some(Value::string("no")));
    }

    #[test]
    fn step_on_finished_vm_is_a_no_op() {
        let mut vm = load_vm("let a = 1\n");
        vm.step().expect("step");
        assert!(vm.is_finished());
        vm.step().expect("step");
        assert!(vm.is_finished());
    }

    #[test]
    fn loading_empty_program_finishes_immediately() {
        let program = parse_program("").expect("parse program");
        let mut vm = Vm::new();
        vm.load(&program);
        assert!(vm.is_finished());
    }

    #[test]
    fn value_equality_is_structural() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(values_equal(
            &Value::array(vec![Value::Int(1), Value::Int(2)]),
            &Value::array(vec![Value::Int(1), Value::Int(2)])
        ));
        assert!(values_equal(
            &set_of(vec![Value::Int(1), Value::Int(2)]),
            &set_of(vec![Value::Int(2), Value::Int(1)])
        ));
        assert!(!values_equal(&Value::Int(1), &Value::string("1")));
    }

    #[test]
    fn value_rendering() {
        assert_eq!(format_value(&Value::string("hi")), "\"hi\"");
        assert_eq!(super::render_value(&Value::string("hi")), "hi");
        assert_eq!(format_value(&Value::Float(1.0)), "1.0");
        assert_eq!(
            format_value(&Value::array(vec![Value::Int(1), Value::string("a")])),
            "[1, \"a\"]"
        );
        assert_eq!(
            format_value(&Value::Range {
                start: 1,
                end: 3,
                inclusive: true
            }),
            "1..3"
        );
    }

    #[test]
    fn scope_define_lookup_assign() {
        let root = Scope::root();
        root.borrow_mut().define("a", Value::Int(1), false);
        let child = Scope::child(&root);
        assert_eq!(Scope::lookup(&child, "a"), Some(Value::Int(1)));
        Scope::assign(&child, "a", Value::Int(2)).expect("assign");
        assert_eq!(Scope::lookup(&root, "a"), Some(Value::Int(2)));
        child.borrow_mut().define("a", Value::Int(9), false);
        assert_eq!(Scope::lookup(&child, "a"), Some(Value::Int(9)));
        assert_eq!(Scope::lookup(&root, "a"), Some(Value::Int(2)));
        assert!(Scope::assign(&child, "missing", Value::Nil).is_err());
    }
}
