use crate::{
    ast::{AstNode, LiteralValue, NodeFlags, NodeTag, OpCode},
    command::{Command, CommandCallback},
    compact, debug,
    error::{DecodeError, RuntimeError},
    library::{self, ExternalCall, Lcg, RequestKind},
    models::{ExecutionState, ExecutionStats, InterpreterOptions},
    provider::SyncDataProvider,
    scope::{ScopeManager, Variable},
    tracer::ExecutionTracer,
    value::{
        ArrayValue, FunctionPointer, NumericPair, PointerTarget, PointerValue,
        StructValue, Value,
    },
};
use std::{cell::RefCell, collections::HashMap, rc::Rc};

/// How a statement finished: fell through, or is unwinding toward the
/// nearest loop (`Break`/`Continue`) or function call (`Return`).
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Non-local exits carried up the visitor stack. Faults become an `ERROR`
/// command and the `Error` state; the other two are clean control
/// transfers, caught only at the top level.
enum Interrupt {
    /// A fatal runtime error at the given node-table offset
    Fault { error: RuntimeError, node: u32 },
    /// A loop header exceeded `max_loop_iterations`
    LoopLimit,
    /// A queued `reset` became observable
    Reset,
}

fn fault(error: RuntimeError, node: u32) -> Interrupt {
    Interrupt::Fault { error, node }
}

type Exec = Result<Flow, Interrupt>;
type Eval = Result<Value, Interrupt>;

/// Where the run currently stands, at step granularity.
enum Phase {
    /// Nothing has run yet
    Boot,
    /// Globals and setup are done; the next unit is loop iteration `n`
    Loop(u32),
    /// Terminated (cleanly or not)
    Finished,
}

/// A steppable sketch executor. Decodes (or adopts) a CompactAST tree and
/// runs it, emitting one [Command] per observable action through the host
/// callback and resolving world-reads through the host's
/// [SyncDataProvider]. The current state and stats can be read at any
/// time.
pub struct Interpreter {
    options: InterpreterOptions,

    // Static data, immutable after construction
    program: Rc<AstNode>,
    functions: HashMap<String, Rc<AstNode>>,
    struct_defs: HashMap<String, Vec<(String, String)>>,
    enum_constants: HashMap<String, i32>,
    typedefs: HashMap<String, String>,

    // Host hooks
    callback: Option<CommandCallback>,
    provider: Option<Box<dyn SyncDataProvider>>,

    // Runtime state
    scopes: ScopeManager,
    state: ExecutionState,
    phase: Phase,
    seq: u32,
    /// Interpreter-relative millisecond clock; advanced only by delays
    clock_ms: u32,
    request_counter: u32,
    fp_counter: u32,
    call_depth: usize,
    pause_requested: bool,
    reset_requested: bool,
    rng: Lcg,
    stats: ExecutionStats,
    tracer: ExecutionTracer,
    /// The fatal error that ended the run, if any
    error: Option<RuntimeError>,
}

impl Interpreter {
    /// Decode a CompactAST blob and build an interpreter for it.
    pub fn new(
        bytes: &[u8],
        options: InterpreterOptions,
    ) -> Result<Self, DecodeError> {
        let root = compact::decode(bytes)?;
        Ok(Self::from_ast(root, options))
    }

    /// Build an interpreter for an already-decoded tree.
    pub fn from_ast(root: AstNode, options: InterpreterOptions) -> Self {
        let mut interp = Self {
            options,
            program: Rc::new(root),
            functions: HashMap::new(),
            struct_defs: HashMap::new(),
            enum_constants: HashMap::new(),
            typedefs: HashMap::new(),
            callback: None,
            provider: None,
            scopes: ScopeManager::new(options.memory_limit_bytes),
            state: ExecutionState::Idle,
            phase: Phase::Boot,
            seq: 0,
            clock_ms: 0,
            request_counter: 0,
            fp_counter: 0,
            call_depth: 0,
            pause_requested: false,
            reset_requested: false,
            rng: Lcg::new(),
            stats: ExecutionStats::default(),
            tracer: ExecutionTracer::new(options.verbose),
            error: None,
        };
        interp.collect_definitions();
        interp.seed_globals();
        interp
    }

    /// Register the command callback. Invoked synchronously, once per
    /// observable action, before execution advances past it.
    pub fn set_command_callback(&mut self, callback: CommandCallback) {
        self.callback = Some(callback);
    }

    /// Register the provider that answers external world-reads.
    pub fn set_sync_data_provider(
        &mut self,
        provider: Box<dyn SyncDataProvider>,
    ) {
        self.provider = Some(provider);
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    /// The fatal error that ended the run, if the state is `Error`.
    pub fn error(&self) -> Option<&RuntimeError> {
        self.error.as_ref()
    }

    /// The diagnostic tracer (only records when the `verbose` option is
    /// set).
    pub fn tracer(&self) -> &ExecutionTracer {
        &self.tracer
    }

    // ---- Control operations ----

    /// Run the program: globals, then `setup()`, then `loop()` up to the
    /// configured iteration ceiling. Returns when the run terminates or
    /// pauses. Only legal from `Idle`.
    pub fn start(&mut self) {
        if self.state != ExecutionState::Idle {
            return;
        }
        self.state = ExecutionState::Running;
        match self.run_boot() {
            Err(int) => self.finish_interrupt(int),
            Ok(()) => match self.phase {
                Phase::Finished => self.finish_clean("complete"),
                _ => self.run_loop_phase(),
            },
        }
    }

    /// Request suspension. Observed at the next loop-iteration boundary;
    /// safe to call from inside the command callback.
    pub fn pause(&mut self) {
        if matches!(
            self.state,
            ExecutionState::Running
                | ExecutionState::Stepping
                | ExecutionState::WaitingForResponse
        ) {
            self.pause_requested = true;
        }
    }

    /// Continue a paused run.
    pub fn resume(&mut self) {
        if self.state != ExecutionState::Paused {
            return;
        }
        self.state = ExecutionState::Running;
        self.run_loop_phase();
    }

    /// Execute one unit of progress: from `Idle`, the globals plus
    /// `setup()`; afterwards, one `loop()` iteration per call. Leaves the
    /// interpreter `Paused` between units.
    pub fn step(&mut self) {
        match self.state {
            ExecutionState::Idle => {
                self.state = ExecutionState::Stepping;
                match self.run_boot() {
                    Err(int) => self.finish_interrupt(int),
                    Ok(()) => match self.phase {
                        Phase::Finished => self.finish_clean("complete"),
                        _ => self.state = ExecutionState::Paused,
                    },
                }
            }
            ExecutionState::Paused => {
                self.state = ExecutionState::Stepping;
                self.step_loop_once();
            }
            _ => {}
        }
    }

    /// Return to `Idle`, clearing scopes, counters, the clock and the
    /// tracer. Inside a provider call the reset is queued and takes effect
    /// on return.
    pub fn reset(&mut self) {
        match self.state {
            ExecutionState::Running
            | ExecutionState::Stepping
            | ExecutionState::WaitingForResponse => {
                self.reset_requested = true;
            }
            _ => self.do_reset(),
        }
    }

    // ---- Run phases ----

    fn do_reset(&mut self) {
        self.scopes = ScopeManager::new(self.options.memory_limit_bytes);
        self.seed_globals();
        self.state = ExecutionState::Idle;
        self.phase = Phase::Boot;
        self.seq = 0;
        self.clock_ms = 0;
        self.request_counter = 0;
        self.fp_counter = 0;
        self.call_depth = 0;
        self.pause_requested = false;
        self.reset_requested = false;
        self.rng = Lcg::new();
        self.stats = ExecutionStats::default();
        self.tracer.clear();
        self.error = None;
    }

    fn seed_globals(&mut self) {
        for (name, value) in library::constants() {
            let type_name = match value {
                Value::Double(_) => "double",
                _ => "int",
            };
            self.scopes
                .declare_builtin(name, Variable::constant(value, type_name));
        }
    }

    /// Walk the program once, collecting functions, struct layouts, enum
    /// constants and typedefs.
    fn collect_definitions(&mut self) {
        let program = Rc::clone(&self.program);
        for child in &program.children {
            match child.tag {
                NodeTag::FuncDef => {
                    self.functions.insert(
                        child.name_str().to_string(),
                        Rc::new(child.clone()),
                    );
                }
                NodeTag::StructDef => {
                    let fields = child
                        .children
                        .iter()
                        .filter(|c| c.tag == NodeTag::VarDecl)
                        .map(|c| {
                            (
                                c.name_str().to_string(),
                                c.type_str().to_string(),
                            )
                        })
                        .collect();
                    self.struct_defs
                        .insert(child.name_str().to_string(), fields);
                }
                NodeTag::EnumDef => {
                    let mut next = 0i32;
                    for member in &child.children {
                        if member.tag != NodeTag::EnumMember {
                            continue;
                        }
                        if let Some(LiteralValue::Int(v)) = member.value {
                            next = v;
                        }
                        self.enum_constants
                            .insert(member.name_str().to_string(), next);
                        next = next.wrapping_add(1);
                    }
                }
                NodeTag::Typedef => {
                    self.typedefs.insert(
                        child.name_str().to_string(),
                        child.type_str().to_string(),
                    );
                }
                _ => {}
            }
        }
    }

    /// Emit the run preamble, execute global declarations, then `setup()`.
    /// Leaves `phase` at `Loop(0)`, or `Finished` when there is no `loop`
    /// function (or a top-level `return` ended the program).
    fn run_boot(&mut self) -> Result<(), Interrupt> {
        if self.options.emit_version_info {
            self.emit(|seq, ts| Command::VersionInfo {
                seq,
                ts,
                version: env!("CARGO_PKG_VERSION").to_string(),
                component: "interpreter".to_string(),
            });
        }
        self.emit(|seq, ts| Command::ProgramStart { seq, ts });

        let program = Rc::clone(&self.program);
        for child in &program.children {
            match child.tag {
                NodeTag::FuncDef
                | NodeTag::FuncDecl
                | NodeTag::StructDef
                | NodeTag::StructDecl
                | NodeTag::EnumDef
                | NodeTag::Typedef
                | NodeTag::Comment
                | NodeTag::PreprocInclude
                | NodeTag::PreprocPragma => {}
                _ => {
                    if let Flow::Return(_) = self.execute(child)? {
                        // A top-level return ends the program cleanly.
                        self.phase = Phase::Finished;
                        return Ok(());
                    }
                }
            }
        }

        self.emit(|seq, ts| Command::SetupStart { seq, ts });
        if self.functions.contains_key("setup") {
            self.call_function("setup", Vec::new(), 0)?;
        }
        self.emit(|seq, ts| Command::SetupEnd { seq, ts });

        self.phase = if self.functions.contains_key("loop") {
            Phase::Loop(0)
        } else {
            Phase::Finished
        };
        Ok(())
    }

    /// Drive loop iterations until the ceiling, a pause, or termination.
    fn run_loop_phase(&mut self) {
        loop {
            let iteration = match self.phase {
                Phase::Loop(i) => i,
                _ => return,
            };
            if iteration >= self.options.max_loop_iterations {
                self.finish_clean("loop_limit");
                return;
            }
            if self.pause_requested {
                self.pause_requested = false;
                self.state = ExecutionState::Paused;
                return;
            }
            match self.run_loop_iteration(iteration) {
                Ok(()) => self.phase = Phase::Loop(iteration + 1),
                Err(int) => {
                    self.finish_interrupt(int);
                    return;
                }
            }
        }
    }

    /// One `step()` unit while paused in the loop phase.
    fn step_loop_once(&mut self) {
        let iteration = match self.phase {
            Phase::Loop(i) => i,
            _ => {
                self.state = ExecutionState::Paused;
                return;
            }
        };
        if iteration >= self.options.max_loop_iterations {
            self.finish_clean("loop_limit");
            return;
        }
        match self.run_loop_iteration(iteration) {
            Ok(()) => {
                self.phase = Phase::Loop(iteration + 1);
                if iteration + 1 >= self.options.max_loop_iterations {
                    self.finish_clean("loop_limit");
                } else {
                    self.state = ExecutionState::Paused;
                }
            }
            Err(int) => self.finish_interrupt(int),
        }
    }

    fn run_loop_iteration(&mut self, iteration: u32) -> Result<(), Interrupt> {
        self.emit(move |seq, ts| Command::LoopStart {
            seq,
            ts,
            iteration,
        });
        self.call_function("loop", Vec::new(), 0)?;
        self.emit(move |seq, ts| Command::LoopEnd {
            seq,
            ts,
            iteration,
        });
        self.stats.loop_iterations += 1;
        Ok(())
    }

    fn finish_clean(&mut self, reason: &str) {
        self.phase = Phase::Finished;
        let reason = reason.to_string();
        self.emit(move |seq, ts| Command::ProgramEnd { seq, ts, reason });
        self.state = ExecutionState::Complete;
    }

    fn finish_interrupt(&mut self, int: Interrupt) {
        match int {
            Interrupt::Fault { error, node } => {
                self.phase = Phase::Finished;
                let kind = error.kind().to_string();
                let message = error.to_string();
                self.emit(move |seq, ts| Command::Error {
                    seq,
                    ts,
                    kind,
                    message,
                    node,
                });
                self.error = Some(error);
                self.state = ExecutionState::Error;
            }
            Interrupt::LoopLimit => self.finish_clean("loop_limit"),
            Interrupt::Reset => {
                self.reset_requested = false;
                self.do_reset();
            }
        }
    }

    // ---- Emission and external reads ----

    fn emit(&mut self, build: impl FnOnce(u32, u32) -> Command) {
        self.seq += 1;
        let cmd = build(self.seq, self.clock_ms);
        self.stats.commands_emitted += 1;
        if self.tracer.is_enabled() {
            self.tracer.emit(cmd.kind(), self.clock_ms);
        }
        debug!(println!("emit {}", cmd.to_json()));
        if let Some(cb) = self.callback.as_mut() {
            cb(&cmd);
        }
    }

    fn perform_external(&mut self, call: ExternalCall, node: u32) -> Eval {
        match call {
            ExternalCall::PinMode { pin, mode } => {
                self.emit(move |seq, ts| Command::PinMode {
                    seq,
                    ts,
                    pin,
                    mode,
                });
            }
            ExternalCall::DigitalWrite { pin, value } => {
                self.emit(move |seq, ts| Command::DigitalWrite {
                    seq,
                    ts,
                    pin,
                    value,
                });
            }
            ExternalCall::AnalogWrite { pin, value } => {
                self.emit(move |seq, ts| Command::AnalogWrite {
                    seq,
                    ts,
                    pin,
                    value,
                });
            }
            ExternalCall::Delay { ms } => {
                self.emit(move |seq, ts| Command::Delay { seq, ts, ms });
                self.clock_ms = self.clock_ms.wrapping_add(ms);
            }
            ExternalCall::DelayMicroseconds { us } => {
                self.emit(move |seq, ts| Command::DelayMicroseconds {
                    seq,
                    ts,
                    us,
                });
                self.clock_ms = self.clock_ms.wrapping_add(us / 1000);
            }
            ExternalCall::Tone {
                pin,
                frequency,
                duration,
            } => {
                self.emit(move |seq, ts| Command::Tone {
                    seq,
                    ts,
                    pin,
                    frequency,
                    duration,
                });
            }
            ExternalCall::NoTone { pin } => {
                self.emit(move |seq, ts| Command::NoTone { seq, ts, pin });
            }
            ExternalCall::AttachInterrupt { pin, mode } => {
                self.emit(move |seq, ts| Command::AttachInterrupt {
                    seq,
                    ts,
                    pin,
                    mode,
                });
            }
            ExternalCall::DetachInterrupt { pin } => {
                self.emit(move |seq, ts| Command::DetachInterrupt {
                    seq,
                    ts,
                    pin,
                });
            }
            ExternalCall::SerialBegin { baud } => {
                self.emit(move |seq, ts| Command::SerialBegin {
                    seq,
                    ts,
                    baud,
                });
            }
            ExternalCall::SerialEnd => {
                self.emit(|seq, ts| Command::SerialEnd { seq, ts });
            }
            ExternalCall::SerialFlush => {
                self.emit(|seq, ts| Command::SerialFlush { seq, ts });
            }
            ExternalCall::SerialPrint { value } => {
                self.emit(move |seq, ts| Command::SerialPrint {
                    seq,
                    ts,
                    value,
                });
            }
            ExternalCall::SerialPrintln { value } => {
                self.emit(move |seq, ts| Command::SerialPrintln {
                    seq,
                    ts,
                    value,
                });
            }
            ExternalCall::SerialWrite { value } => {
                self.emit(move |seq, ts| Command::SerialWrite {
                    seq,
                    ts,
                    value,
                });
            }
            ExternalCall::Request(kind) => {
                return self.request_value(kind, node);
            }
        }
        Ok(Value::Void)
    }

    /// Emit a data-request command and block on the provider for its value.
    /// With `sync_mode` off the request is advisory and the canonical zero
    /// is returned immediately.
    fn request_value(&mut self, kind: RequestKind, node: u32) -> Eval {
        self.request_counter += 1;
        let request_id = format!("r-{}", self.request_counter);

        match &kind {
            RequestKind::AnalogRead { pin } => {
                let pin = *pin;
                let id = request_id.clone();
                self.emit(move |seq, ts| Command::AnalogReadRequest {
                    seq,
                    ts,
                    pin,
                    request_id: id,
                });
            }
            RequestKind::DigitalRead { pin } => {
                let pin = *pin;
                let id = request_id.clone();
                self.emit(move |seq, ts| Command::DigitalReadRequest {
                    seq,
                    ts,
                    pin,
                    request_id: id,
                });
            }
            RequestKind::Millis => {
                let id = request_id.clone();
                self.emit(move |seq, ts| Command::MillisRequest {
                    seq,
                    ts,
                    request_id: id,
                });
            }
            RequestKind::Micros => {
                let id = request_id.clone();
                self.emit(move |seq, ts| Command::MicrosRequest {
                    seq,
                    ts,
                    request_id: id,
                });
            }
            RequestKind::PulseIn {
                pin,
                state,
                timeout,
            } => {
                let (pin, state, timeout) = (*pin, *state, *timeout);
                let id = request_id.clone();
                self.emit(move |seq, ts| Command::PulseInRequest {
                    seq,
                    ts,
                    pin,
                    state,
                    timeout,
                    request_id: id,
                });
            }
            RequestKind::LibrarySensor {
                library,
                method,
                arg,
            } => {
                let (library, method, arg) =
                    (library.clone(), method.clone(), *arg);
                let id = request_id.clone();
                self.emit(move |seq, ts| Command::LibrarySensorRequest {
                    seq,
                    ts,
                    library,
                    method,
                    arg,
                    request_id: id,
                });
            }
        }

        if !self.options.sync_mode {
            return Ok(match kind {
                RequestKind::Millis | RequestKind::Micros => Value::UInt(0),
                RequestKind::PulseIn { .. } => Value::UInt(0),
                _ => Value::Int(0),
            });
        }

        let prior = self.state;
        self.state = ExecutionState::WaitingForResponse;
        let value = match self.provider.as_mut() {
            None => {
                self.state = prior;
                return Err(fault(RuntimeError::MissingProvider, node));
            }
            Some(p) => match kind {
                RequestKind::AnalogRead { pin } => {
                    Value::Int(p.analog_read(pin))
                }
                RequestKind::DigitalRead { pin } => {
                    Value::Int(p.digital_read(pin))
                }
                RequestKind::Millis => Value::UInt(p.millis()),
                RequestKind::Micros => Value::UInt(p.micros()),
                RequestKind::PulseIn {
                    pin,
                    state,
                    timeout,
                } => Value::UInt(p.pulse_in(pin, state, timeout)),
                RequestKind::LibrarySensor {
                    library,
                    method,
                    arg,
                } => Value::Int(p.library_sensor(&library, &method, arg)),
            },
        };
        self.state = prior;
        if self.reset_requested {
            return Err(Interrupt::Reset);
        }
        Ok(value)
    }

    // ---- Function invocation ----

    fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        node: u32,
    ) -> Eval {
        let func = match self.functions.get(name) {
            Some(f) => Rc::clone(f),
            None => {
                return Err(fault(
                    RuntimeError::UndefinedFunction(name.to_string()),
                    node,
                ))
            }
        };
        if self.call_depth >= self.options.max_call_depth {
            return Err(fault(
                RuntimeError::StackOverflow(self.options.max_call_depth),
                node,
            ));
        }
        self.call_depth += 1;
        self.stats.functions_called += 1;
        if self.tracer.is_enabled() {
            self.tracer.enter(name, self.clock_ms);
        }

        let saved_depth = self.scopes.depth();
        self.scopes.push();
        self.track_depth();
        let result = self.run_function_body(&func, args);
        // Restore the frame stack unconditionally, early return included.
        while self.scopes.depth() > saved_depth {
            self.scopes.pop();
        }
        self.call_depth -= 1;
        if self.tracer.is_enabled() {
            self.tracer.exit(name, self.clock_ms);
        }

        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::Void),
            Err(int) => Err(int),
        }
    }

    fn run_function_body(&mut self, func: &AstNode, args: Vec<Value>) -> Exec {
        let mut args = args.into_iter();
        for child in &func.children {
            if child.tag != NodeTag::Param {
                continue;
            }
            let value = match args.next() {
                Some(v) => v,
                None => self.default_for_type(child.type_str()),
            };
            let mut var = Variable::new(value, child.type_str());
            var.is_const = child.flags.contains(NodeFlags::CONST);
            self.scopes
                .declare(child.name_str(), var)
                .map_err(|e| fault(e, child.offset))?;
        }
        match func.children.iter().find(|c| c.tag == NodeTag::Compound) {
            Some(body) => self.execute_block(body),
            None => Ok(Flow::Normal),
        }
    }

    fn track_depth(&mut self) {
        if self.scopes.depth() > self.stats.peak_scope_depth {
            self.stats.peak_scope_depth = self.scopes.depth();
        }
    }

    // ---- Statement execution ----

    fn execute(&mut self, node: &AstNode) -> Exec {
        if self.reset_requested {
            return Err(Interrupt::Reset);
        }
        if self.tracer.is_enabled() {
            self.tracer.enter(format!("{:?}", node.tag), self.clock_ms);
        }
        match node.tag {
            NodeTag::Compound => self.execute_block(node),
            NodeTag::ExpressionStmt => {
                if let Some(expr) = node.children.first() {
                    self.evaluate(expr)?;
                }
                Ok(Flow::Normal)
            }
            NodeTag::VarDecl => self.execute_var_decl(node),
            NodeTag::If => {
                let cond = self.evaluate(child(node, 0)?)?;
                if cond.as_bool() {
                    self.execute(child(node, 1)?)
                } else if let Some(else_branch) = node.children.get(2) {
                    self.execute(else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            NodeTag::While => {
                let cond = child(node, 0)?;
                let body = child(node, 1)?;
                let mut iterations = 0u32;
                loop {
                    self.guard_loop(&mut iterations)?;
                    if !self.evaluate(cond)?.as_bool() {
                        break;
                    }
                    match self.execute(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        _ => {}
                    }
                }
                Ok(Flow::Normal)
            }
            NodeTag::DoWhile => {
                let body = child(node, 0)?;
                let cond = child(node, 1)?;
                let mut iterations = 0u32;
                loop {
                    self.guard_loop(&mut iterations)?;
                    match self.execute(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        _ => {}
                    }
                    if !self.evaluate(cond)?.as_bool() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            NodeTag::For => self.execute_for(node),
            NodeTag::RangeFor => self.execute_range_for(node),
            NodeTag::Switch => self.execute_switch(node),
            NodeTag::Break => Ok(Flow::Break),
            NodeTag::Continue => Ok(Flow::Continue),
            NodeTag::Return => {
                let value = match node.children.first() {
                    Some(expr) => self.evaluate(expr)?,
                    None => Value::Void,
                };
                Ok(Flow::Return(value))
            }
            NodeTag::PreprocDefine => {
                // #define NAME <literal> behaves like a const global.
                if let Some(value) = &node.value {
                    if !self.scopes.contains(node.name_str()) {
                        let value = literal_to_value(value);
                        let var = Variable::constant(value, "");
                        self.scopes
                            .declare_global(node.name_str(), var)
                            .map_err(|e| fault(e, node.offset))?;
                    }
                }
                Ok(Flow::Normal)
            }
            NodeTag::PreprocIfdef => {
                // The decoder keeps only the surviving branch.
                for stmt in &node.children {
                    match self.execute(stmt)? {
                        Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Normal)
            }
            NodeTag::EmptyStmt
            | NodeTag::Comment
            | NodeTag::FuncDef
            | NodeTag::FuncDecl
            | NodeTag::StructDef
            | NodeTag::StructDecl
            | NodeTag::EnumDef
            | NodeTag::Typedef
            | NodeTag::UnionDef
            | NodeTag::TemplateDecl
            | NodeTag::NamespaceDecl
            | NodeTag::UsingDecl
            | NodeTag::PreprocInclude
            | NodeTag::PreprocUndef
            | NodeTag::PreprocPragma => Ok(Flow::Normal),
            // Any expression node in statement position: evaluate for its
            // side effects.
            _ => {
                self.evaluate(node)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn execute_block(&mut self, node: &AstNode) -> Exec {
        let saved_depth = self.scopes.depth();
        self.scopes.push();
        self.track_depth();
        let mut result = Ok(Flow::Normal);
        for stmt in &node.children {
            match self.execute(stmt) {
                Ok(Flow::Normal) => {}
                other => {
                    result = other;
                    break;
                }
            }
        }
        while self.scopes.depth() > saved_depth {
            self.scopes.pop();
        }
        result
    }

    fn execute_for(&mut self, node: &AstNode) -> Exec {
        let init = child(node, 0)?;
        let cond = child(node, 1)?;
        let update = child(node, 2)?;
        let body = child(node, 3)?;

        let saved_depth = self.scopes.depth();
        self.scopes.push();
        self.track_depth();
        let result = (|| {
            self.execute(init)?;
            let mut iterations = 0u32;
            loop {
                self.guard_loop(&mut iterations)?;
                let keep_going = match cond.tag {
                    NodeTag::EmptyStmt => true,
                    _ => self.evaluate(cond)?.as_bool(),
                };
                if !keep_going {
                    break;
                }
                match self.execute(body)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    _ => {}
                }
                if update.tag != NodeTag::EmptyStmt {
                    self.evaluate(update)?;
                }
            }
            Ok(Flow::Normal)
        })();
        while self.scopes.depth() > saved_depth {
            self.scopes.pop();
        }
        result
    }

    fn execute_range_for(&mut self, node: &AstNode) -> Exec {
        let decl = child(node, 0)?;
        let iterable = self.evaluate(child(node, 1)?)?;
        let body = child(node, 2)?;

        let items: Vec<Value> = match iterable {
            Value::IntVec(v) => v.into_iter().map(Value::Int).collect(),
            Value::DoubleVec(v) => {
                v.into_iter().map(Value::Double).collect()
            }
            Value::StrVec(v) => v.into_iter().map(Value::Str).collect(),
            Value::Array(a) => a.borrow().items.clone(),
            Value::Str(s) => {
                s.bytes().map(|b| Value::Int(i32::from(b))).collect()
            }
            other => {
                return Err(fault(
                    RuntimeError::TypeError(format!(
                        "cannot iterate over {}",
                        other.type_label()
                    )),
                    node.offset,
                ))
            }
        };

        let saved_depth = self.scopes.depth();
        self.scopes.push();
        self.track_depth();
        let result = (|| {
            self.scopes
                .declare(
                    decl.name_str(),
                    Variable::new(Value::Void, decl.type_str()),
                )
                .map_err(|e| fault(e, decl.offset))?;
            let mut iterations = 0u32;
            for item in items {
                self.guard_loop(&mut iterations)?;
                self.scopes
                    .assign(decl.name_str(), item)
                    .map_err(|e| fault(e, decl.offset))?;
                match self.execute(body)? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    _ => {}
                }
            }
            Ok(Flow::Normal)
        })();
        while self.scopes.depth() > saved_depth {
            self.scopes.pop();
        }
        result
    }

    fn execute_switch(&mut self, node: &AstNode) -> Exec {
        let disc = self.evaluate(child(node, 0)?)?;
        let cases = &node.children[1..];

        let mut start = None;
        for (i, case) in cases.iter().enumerate() {
            if case.tag != NodeTag::Case {
                continue;
            }
            let label = self.evaluate(child(case, 0)?)?;
            if label == disc {
                start = Some(i);
                break;
            }
        }
        if start.is_none() {
            start = cases.iter().position(|c| c.tag == NodeTag::Default);
        }

        let start = match start {
            Some(i) => i,
            None => return Ok(Flow::Normal),
        };
        // Fall through until a break.
        for case in &cases[start..] {
            let stmts = match case.tag {
                NodeTag::Case => &case.children[1..],
                _ => &case.children[..],
            };
            for stmt in stmts {
                match self.execute(stmt)? {
                    Flow::Normal => {}
                    Flow::Break => return Ok(Flow::Normal),
                    other => return Ok(other),
                }
            }
        }
        Ok(Flow::Normal)
    }

    /// Per-loop-header iteration ceiling. Exceeding it is a clean
    /// termination, not an error.
    fn guard_loop(&mut self, iterations: &mut u32) -> Result<(), Interrupt> {
        if *iterations >= self.options.max_loop_iterations {
            return Err(Interrupt::LoopLimit);
        }
        *iterations += 1;
        Ok(())
    }

    // ---- Declarations ----

    fn execute_var_decl(&mut self, node: &AstNode) -> Exec {
        let name = node.name_str().to_string();
        let type_name = node.type_str().to_string();
        let dims: Vec<&AstNode> = node
            .children
            .iter()
            .filter(|c| c.tag == NodeTag::ArrayDim)
            .collect();
        let init = node
            .children
            .iter()
            .find(|c| c.tag != NodeTag::ArrayDim);

        if node.flags.contains(NodeFlags::REFERENCE) {
            let target = match init {
                Some(t) if t.tag == NodeTag::Identifier => t.name_str(),
                _ => {
                    return Err(fault(
                        RuntimeError::TypeError(format!(
                            "reference `{}` must bind to a variable",
                            name
                        )),
                        node.offset,
                    ))
                }
            };
            let frame = match self.scopes.frame_of(target) {
                Some(f) => f,
                None => {
                    return Err(fault(
                        RuntimeError::NameError(format!(
                            "undefined identifier `{}`",
                            target
                        )),
                        node.offset,
                    ))
                }
            };
            let var = Variable::reference(frame, target, &type_name);
            return self
                .declare(node, &name, var)
                .map(|_| Flow::Normal);
        }

        let value = if !dims.is_empty() {
            self.array_decl_value(node, &type_name, &dims, init)?
        } else {
            match init {
                Some(expr) if expr.tag == NodeTag::StructInit => {
                    self.struct_init_value(expr, &type_name)?
                }
                Some(expr) if expr.tag == NodeTag::ArrayInit => {
                    self.array_init_value(expr, &type_name)?
                }
                Some(expr) => {
                    let v = self.evaluate(expr)?;
                    self.coerce_to_type(v, &type_name)
                        .map_err(|e| fault(e, node.offset))?
                }
                None => self.default_for_type(&type_name),
            }
        };

        let mut var = Variable::new(value, &type_name);
        var.is_const = node.flags.contains(NodeFlags::CONST);
        self.declare(node, &name, var).map(|_| Flow::Normal)
    }

    fn declare(
        &mut self,
        node: &AstNode,
        name: &str,
        var: Variable,
    ) -> Result<(), Interrupt> {
        let result = if node.flags.contains(NodeFlags::GLOBAL) {
            self.scopes.declare_global(name, var)
        } else {
            self.scopes.declare(name, var)
        };
        self.stats.variables_declared += 1;
        result.map_err(|e| fault(e, node.offset))
    }

    /// Build the value for an array declaration, from its initializer or
    /// its declared dimensions.
    fn array_decl_value(
        &mut self,
        node: &AstNode,
        type_name: &str,
        dims: &[&AstNode],
        init: Option<&AstNode>,
    ) -> Eval {
        if let Some(init) = init {
            if init.tag == NodeTag::ArrayInit {
                return self.array_init_value(init, type_name);
            }
            // e.g. `char buf[8] = "hi"` — decay to the scalar initializer.
            return self.evaluate(init);
        }

        let mut sizes = Vec::with_capacity(dims.len());
        for dim in dims {
            let size = match dim.children.first() {
                Some(expr) => {
                    let v = self.evaluate(expr)?;
                    let n = v.as_i32().map_err(|e| fault(e, dim.offset))?;
                    if n < 0 {
                        return Err(fault(
                            RuntimeError::TypeError(format!(
                                "negative array size for `{}`",
                                node.name_str()
                            )),
                            dim.offset,
                        ));
                    }
                    n as usize
                }
                None => 0,
            };
            sizes.push(size);
        }

        let base = self.base_type(type_name);
        Ok(match (sizes.len(), base_kind(&base)) {
            (1, BaseKind::Int) => Value::IntVec(vec![0; sizes[0]]),
            (1, BaseKind::Double) => Value::DoubleVec(vec![0.0; sizes[0]]),
            (1, BaseKind::Str) => {
                Value::StrVec(vec![String::new(); sizes[0]])
            }
            (2, BaseKind::Int) => {
                Value::IntMat(vec![vec![0; sizes[1]]; sizes[0]])
            }
            (2, BaseKind::Double) => {
                Value::DoubleMat(vec![vec![0.0; sizes[1]]; sizes[0]])
            }
            _ => {
                let items = (0..sizes[0])
                    .map(|_| self.default_for_type(&base))
                    .collect();
                Value::Array(Rc::new(RefCell::new(ArrayValue {
                    elem_type: base,
                    items,
                })))
            }
        })
    }

    /// Materialize an `ArrayInit` into the value shape its element type
    /// calls for.
    fn array_init_value(&mut self, node: &AstNode, type_name: &str) -> Eval {
        let base = self.base_type(type_name);
        let nested = node
            .children
            .first()
            .map_or(false, |c| c.tag == NodeTag::ArrayInit);

        if nested {
            match base_kind(&base) {
                BaseKind::Int => {
                    let mut rows = Vec::with_capacity(node.children.len());
                    for row in &node.children {
                        let mut items = Vec::with_capacity(
                            row.children.len(),
                        );
                        for item in &row.children {
                            let v = self.evaluate(item)?;
                            items.push(
                                v.as_i32()
                                    .map_err(|e| fault(e, item.offset))?,
                            );
                        }
                        rows.push(items);
                    }
                    return Ok(Value::IntMat(rows));
                }
                BaseKind::Double => {
                    let mut rows = Vec::with_capacity(node.children.len());
                    for row in &node.children {
                        let mut items = Vec::with_capacity(
                            row.children.len(),
                        );
                        for item in &row.children {
                            let v = self.evaluate(item)?;
                            items.push(
                                v.as_f64()
                                    .map_err(|e| fault(e, item.offset))?,
                            );
                        }
                        rows.push(items);
                    }
                    return Ok(Value::DoubleMat(rows));
                }
                _ => {}
            }
        }

        match base_kind(&base) {
            BaseKind::Int => {
                let mut items = Vec::with_capacity(node.children.len());
                for item in &node.children {
                    let v = self.evaluate(item)?;
                    items.push(
                        v.as_i32().map_err(|e| fault(e, item.offset))?,
                    );
                }
                Ok(Value::IntVec(items))
            }
            BaseKind::Double => {
                let mut items = Vec::with_capacity(node.children.len());
                for item in &node.children {
                    let v = self.evaluate(item)?;
                    items.push(
                        v.as_f64().map_err(|e| fault(e, item.offset))?,
                    );
                }
                Ok(Value::DoubleVec(items))
            }
            BaseKind::Str => {
                let mut items = Vec::with_capacity(node.children.len());
                for item in &node.children {
                    let v = self.evaluate(item)?;
                    items.push(v.to_string());
                }
                Ok(Value::StrVec(items))
            }
            BaseKind::Other => {
                let mut items = Vec::with_capacity(node.children.len());
                for item in &node.children {
                    let v = if item.tag == NodeTag::StructInit {
                        self.struct_init_value(item, &base)?
                    } else {
                        self.evaluate(item)?
                    };
                    items.push(v);
                }
                Ok(Value::Array(Rc::new(RefCell::new(ArrayValue {
                    elem_type: base,
                    items,
                }))))
            }
        }
    }

    /// Materialize a `StructInit` against the struct's declared layout,
    /// filling unlisted fields with their defaults.
    fn struct_init_value(&mut self, node: &AstNode, type_name: &str) -> Eval {
        let base = self.base_type(type_name);
        let layout = match self.struct_defs.get(&base) {
            Some(fields) => fields.clone(),
            None => Vec::new(),
        };
        let mut value = StructValue::new(&base);
        for (i, (field_name, field_type)) in layout.iter().enumerate() {
            let field_value = match node.children.get(i) {
                Some(expr) if expr.tag == NodeTag::StructInit => {
                    self.struct_init_value(expr, field_type)?
                }
                Some(expr) => {
                    let v = self.evaluate(expr)?;
                    self.coerce_to_type(v, field_type)
                        .map_err(|e| fault(e, expr.offset))?
                }
                None => self.default_for_type(field_type),
            };
            value.push_field(field_name, field_value);
        }
        // No known layout: keep the initializers positionally.
        if layout.is_empty() {
            for (i, expr) in node.children.iter().enumerate() {
                let v = self.evaluate(expr)?;
                value.push_field(format!("_{}", i), v);
            }
        }
        Ok(Value::Struct(Rc::new(RefCell::new(value))))
    }

    // ---- Types ----

    /// Strip qualifiers and resolve typedefs down to a base type name.
    fn base_type(&self, type_name: &str) -> String {
        let mut current = type_name.trim().to_string();
        loop {
            let stripped = current
                .trim_start_matches("const ")
                .trim_end_matches('&')
                .trim_end_matches("[]")
                .trim()
                .to_string();
            match self.typedefs.get(&stripped) {
                Some(next) if *next != stripped => current = next.clone(),
                _ => return stripped,
            }
        }
    }

    fn default_for_type(&self, type_name: &str) -> Value {
        let base = self.base_type(type_name);
        match base.as_str() {
            "int" | "long" | "short" | "char" | "int8_t" | "int16_t"
            | "int32_t" => Value::Int(0),
            "unsigned int" | "unsigned long" | "unsigned short"
            | "unsigned char" | "byte" | "uint8_t" | "uint16_t"
            | "uint32_t" | "word" | "size_t" => Value::UInt(0),
            "float" | "double" => Value::Double(0.0),
            "bool" | "boolean" => Value::Bool(false),
            "String" => Value::Str(String::new()),
            "void" => Value::Void,
            _ => {
                if let Some(fields) = self.struct_defs.get(&base) {
                    let mut value = StructValue::new(&base);
                    for (field_name, field_type) in fields.clone() {
                        value.push_field(
                            field_name,
                            self.default_for_type(&field_type),
                        );
                    }
                    Value::Struct(Rc::new(RefCell::new(value)))
                } else if base.contains('*') {
                    Value::Pointer(Rc::new(RefCell::new(
                        PointerValue::null(base),
                    )))
                } else {
                    Value::Void
                }
            }
        }
    }

    fn coerce_to_type(
        &self,
        value: Value,
        type_name: &str,
    ) -> Result<Value, RuntimeError> {
        let base = self.base_type(type_name);
        Ok(match base.as_str() {
            "int" | "long" | "short" | "char" | "int8_t" | "int16_t"
            | "int32_t" => Value::Int(value.as_i32()?),
            "unsigned int" | "unsigned long" | "unsigned short"
            | "unsigned char" | "byte" | "uint8_t" | "uint16_t"
            | "uint32_t" | "word" | "size_t" => Value::UInt(value.as_u32()?),
            "float" | "double" => Value::Double(value.as_f64()?),
            "bool" | "boolean" => Value::Bool(value.as_bool()),
            "String" => match value {
                Value::Str(_) | Value::SharedStr(_) => value,
                other => Value::Str(other.to_string()),
            },
            _ => value,
        })
    }

    // ---- Expression evaluation ----

    fn evaluate(&mut self, node: &AstNode) -> Eval {
        match node.tag {
            NodeTag::IntLiteral
            | NodeTag::FloatLiteral
            | NodeTag::BoolLiteral
            | NodeTag::CharLiteral
            | NodeTag::StringLiteral => Ok(match &node.value {
                Some(lit) => literal_to_value(lit),
                None => Value::Int(0),
            }),
            NodeTag::NullLiteral => Ok(Value::Pointer(Rc::new(
                RefCell::new(PointerValue::null("void")),
            ))),
            NodeTag::Identifier => self.eval_identifier(node),
            NodeTag::ArrayInit => self.array_init_value(node, ""),
            NodeTag::StructInit => self.struct_init_value(node, ""),
            NodeTag::BinaryOp => self.eval_binary(node),
            NodeTag::UnaryOp => self.eval_unary(node),
            NodeTag::PostfixOp => self.eval_postfix(node),
            NodeTag::Assign => {
                let value = self.evaluate(child(node, 1)?)?;
                self.assign_to(child(node, 0)?, value)
            }
            NodeTag::CompoundAssign => self.eval_compound_assign(node),
            NodeTag::Ternary => {
                let cond = self.evaluate(child(node, 0)?)?;
                if cond.as_bool() {
                    self.evaluate(child(node, 1)?)
                } else {
                    self.evaluate(child(node, 2)?)
                }
            }
            NodeTag::FunctionCall => self.eval_call(node),
            NodeTag::MemberAccess => self.eval_member_access(node),
            NodeTag::ArrayAccess => self.eval_array_access(node),
            NodeTag::Cast | NodeTag::FunctionStyleCast => {
                let value = self.evaluate(child(node, 0)?)?;
                self.coerce_to_type(value, node.type_str())
                    .map_err(|e| fault(e, node.offset))
            }
            NodeTag::Sizeof => Ok(Value::UInt(self.eval_sizeof(node)?)),
            NodeTag::AddressOf => self.eval_address_of(node),
            NodeTag::Dereference => {
                let value = self.evaluate(child(node, 0)?)?;
                self.deref_pointer(&value, node.offset)
            }
            NodeTag::CommaExpr => {
                let mut last = Value::Void;
                for expr in &node.children {
                    last = self.evaluate(expr)?;
                }
                Ok(last)
            }
            NodeTag::ConstructorCall => {
                // Arguments are evaluated for effect; library objects keep
                // their identity through the declared type.
                for arg in &node.children {
                    self.evaluate(arg)?;
                }
                Ok(self.default_for_type(node.type_str()))
            }
            NodeTag::EmptyStmt => Ok(Value::Void),
            _ => Err(fault(
                RuntimeError::TypeError(format!(
                    "`{:?}` is not valid in expression position",
                    node.tag
                )),
                node.offset,
            )),
        }
    }

    fn eval_identifier(&mut self, node: &AstNode) -> Eval {
        let name = node.name_str();
        if let Some(value) = self.scopes.lookup_value(name) {
            return Ok(value);
        }
        if let Some(&value) = self.enum_constants.get(name) {
            return Ok(Value::Int(value));
        }
        if self.functions.contains_key(name) {
            self.fp_counter += 1;
            return Ok(Value::Function(FunctionPointer {
                name: name.to_string(),
                id: self.fp_counter,
            }));
        }
        Err(fault(
            RuntimeError::NameError(format!(
                "undefined identifier `{}`",
                name
            )),
            node.offset,
        ))
    }

    fn eval_binary(&mut self, node: &AstNode) -> Eval {
        let op = node_op(node)?;
        // && and || short-circuit: the right operand is not evaluated
        // unless it decides the result.
        match op {
            OpCode::LogicalAnd => {
                let lhs = self.evaluate(child(node, 0)?)?;
                if !lhs.as_bool() {
                    return Ok(Value::Bool(false));
                }
                let rhs = self.evaluate(child(node, 1)?)?;
                return Ok(Value::Bool(rhs.as_bool()));
            }
            OpCode::LogicalOr => {
                let lhs = self.evaluate(child(node, 0)?)?;
                if lhs.as_bool() {
                    return Ok(Value::Bool(true));
                }
                let rhs = self.evaluate(child(node, 1)?)?;
                return Ok(Value::Bool(rhs.as_bool()));
            }
            _ => {}
        }
        let lhs = self.evaluate(child(node, 0)?)?;
        let rhs = self.evaluate(child(node, 1)?)?;
        binary_op(op, &lhs, &rhs).map_err(|e| fault(e, node.offset))
    }

    fn eval_unary(&mut self, node: &AstNode) -> Eval {
        let op = node_op(node)?;
        let operand = child(node, 0)?;
        match op {
            OpCode::PreInc | OpCode::PreDec => {
                let delta = if op == OpCode::PreInc { 1 } else { -1 };
                let new = self.step_lvalue(operand, delta)?.1;
                Ok(new)
            }
            OpCode::Plus => {
                let v = self.evaluate(operand)?;
                v.as_f64().map_err(|e| fault(e, node.offset))?;
                Ok(v)
            }
            OpCode::Neg => {
                let v = self.evaluate(operand)?;
                match v {
                    Value::Double(d) => Ok(Value::Double(-d)),
                    other => {
                        let i = other
                            .as_i32()
                            .map_err(|e| fault(e, node.offset))?;
                        Ok(Value::Int(i.wrapping_neg()))
                    }
                }
            }
            OpCode::Not => {
                let v = self.evaluate(operand)?;
                Ok(Value::Bool(!v.as_bool()))
            }
            OpCode::BitNot => {
                let v = self.evaluate(operand)?;
                let i = v.as_i32().map_err(|e| fault(e, node.offset))?;
                Ok(Value::Int(!i))
            }
            _ => Err(fault(
                RuntimeError::TypeError(format!(
                    "`{:?}` is not a unary operator",
                    op
                )),
                node.offset,
            )),
        }
    }

    fn eval_postfix(&mut self, node: &AstNode) -> Eval {
        let op = node_op(node)?;
        let operand = child(node, 0)?;
        match op {
            OpCode::PostInc | OpCode::PostDec => {
                let delta = if op == OpCode::PostInc { 1 } else { -1 };
                let old = self.step_lvalue(operand, delta)?.0;
                Ok(old)
            }
            _ => Err(fault(
                RuntimeError::TypeError(format!(
                    "`{:?}` is not a postfix operator",
                    op
                )),
                node.offset,
            )),
        }
    }

    /// Increment/decrement an l-value in place. Returns (old, new).
    fn step_lvalue(
        &mut self,
        target: &AstNode,
        delta: i32,
    ) -> Result<(Value, Value), Interrupt> {
        let old = self.evaluate(target)?;
        let new = match &old {
            Value::Double(d) => Value::Double(d + f64::from(delta)),
            Value::UInt(u) => {
                Value::UInt(u.wrapping_add(delta as u32))
            }
            other => {
                let i =
                    other.as_i32().map_err(|e| fault(e, target.offset))?;
                Value::Int(i.wrapping_add(delta))
            }
        };
        self.assign_to(target, new.clone())?;
        Ok((old, new))
    }

    fn eval_compound_assign(&mut self, node: &AstNode) -> Eval {
        let op = node_op(node)?;
        let base = op.base_op().ok_or_else(|| {
            fault(
                RuntimeError::TypeError(format!(
                    "`{:?}` is not a compound assignment",
                    op
                )),
                node.offset,
            )
        })?;
        let target = child(node, 0)?;
        let current = self.evaluate(target)?;
        let rhs = self.evaluate(child(node, 1)?)?;
        let value = binary_op(base, &current, &rhs)
            .map_err(|e| fault(e, node.offset))?;
        self.assign_to(target, value)
    }

    fn eval_member_access(&mut self, node: &AstNode) -> Eval {
        let member = node.name_str().to_string();
        let object = child(node, 0)?;

        if node.flags.contains(NodeFlags::ARROW) {
            let ptr = self.evaluate(object)?;
            let target = self.deref_pointer(&ptr, node.offset)?;
            return self.struct_field(&target, &member, node.offset);
        }

        if object.tag == NodeTag::Identifier
            && self.scopes.contains(object.name_str())
        {
            return self
                .scopes
                .member_value(object.name_str(), &member)
                .map_err(|e| fault(e, node.offset));
        }

        let value = self.evaluate(object)?;
        self.struct_field(&value, &member, node.offset)
    }

    fn struct_field(
        &self,
        value: &Value,
        member: &str,
        node: u32,
    ) -> Eval {
        match value {
            Value::Struct(s) => {
                s.borrow().get(member).cloned().ok_or_else(|| {
                    fault(
                        RuntimeError::NameError(format!(
                            "no member `{}`",
                            member
                        )),
                        node,
                    )
                })
            }
            other => Err(fault(
                RuntimeError::TypeError(format!(
                    "{} has no members",
                    other.type_label()
                )),
                node,
            )),
        }
    }

    fn eval_array_access(&mut self, node: &AstNode) -> Eval {
        let array = child(node, 0)?;
        let index_value = self.evaluate(child(node, 1)?)?;
        let index = index_value
            .as_i32()
            .map_err(|e| fault(e, node.offset))?;

        if array.tag == NodeTag::Identifier
            && self.scopes.contains(array.name_str())
        {
            let name = array.name_str();
            if index < 0 {
                return Err(fault(
                    RuntimeError::IndexOutOfRange {
                        name: name.to_string(),
                        index: i64::from(index),
                        len: self
                            .scopes
                            .lookup_value(name)
                            .map_or(0, |v| value_len(&v)),
                    },
                    node.offset,
                ));
            }
            return self
                .scopes
                .element_value(name, index as usize)
                .map_err(|e| fault(e, node.offset));
        }

        let value = self.evaluate(array)?;
        if index < 0 {
            return Err(fault(
                RuntimeError::IndexOutOfRange {
                    name: "<expression>".to_string(),
                    index: i64::from(index),
                    len: value_len(&value),
                },
                node.offset,
            ));
        }
        index_value_of(&value, index as usize)
            .map_err(|e| fault(e, node.offset))
    }

    fn eval_sizeof(&mut self, node: &AstNode) -> Result<u32, Interrupt> {
        if let Some(expr) = node.children.first() {
            let value = self.evaluate(expr)?;
            return Ok(size_of_value(&value));
        }
        Ok(size_of_type(&self.base_type(node.type_str())))
    }

    fn eval_address_of(&mut self, node: &AstNode) -> Eval {
        let target = child(node, 0)?;
        match target.tag {
            NodeTag::Identifier => {
                let name = target.name_str();
                let frame = self.scopes.frame_of(name).ok_or_else(|| {
                    fault(
                        RuntimeError::NameError(format!(
                            "undefined identifier `{}`",
                            name
                        )),
                        node.offset,
                    )
                })?;
                let pointed_type = self
                    .scopes
                    .lookup(name)
                    .map(|v| v.type_name.clone())
                    .unwrap_or_default();
                Ok(Value::Pointer(Rc::new(RefCell::new(PointerValue {
                    target: Some(PointerTarget::Variable {
                        frame,
                        name: name.to_string(),
                    }),
                    pointed_type,
                }))))
            }
            NodeTag::ArrayAccess => {
                let array = child(target, 0)?;
                if array.tag != NodeTag::Identifier {
                    return Err(fault(
                        RuntimeError::TypeError(
                            "cannot take the address of this expression"
                                .to_string(),
                        ),
                        node.offset,
                    ));
                }
                let name = array.name_str();
                let frame = self.scopes.frame_of(name).ok_or_else(|| {
                    fault(
                        RuntimeError::NameError(format!(
                            "undefined identifier `{}`",
                            name
                        )),
                        node.offset,
                    )
                })?;
                let index_value = self.evaluate(child(target, 1)?)?;
                let index = index_value
                    .as_i32()
                    .map_err(|e| fault(e, node.offset))?;
                Ok(Value::Pointer(Rc::new(RefCell::new(PointerValue {
                    target: Some(PointerTarget::Element {
                        frame,
                        name: name.to_string(),
                        index: index.max(0) as usize,
                    }),
                    pointed_type: String::new(),
                }))))
            }
            NodeTag::Dereference => self.evaluate(child(target, 0)?),
            _ => Err(fault(
                RuntimeError::TypeError(
                    "cannot take the address of this expression".to_string(),
                ),
                node.offset,
            )),
        }
    }

    /// Resolve a pointer read through the scope manager.
    fn deref_pointer(&self, value: &Value, node: u32) -> Eval {
        let ptr = match value {
            Value::Pointer(p) => p.borrow().clone(),
            other => {
                return Err(fault(
                    RuntimeError::TypeError(format!(
                        "cannot dereference {}",
                        other.type_label()
                    )),
                    node,
                ))
            }
        };
        match ptr.target {
            None => Err(fault(RuntimeError::NullDereference, node)),
            Some(PointerTarget::Variable { frame, name }) => self
                .scopes
                .get_in_frame(frame, &name)
                .map(|v| v.value.clone())
                .ok_or_else(|| fault(RuntimeError::NullDereference, node)),
            Some(PointerTarget::Element { frame, name, index }) => self
                .scopes
                .element_value_in_frame(frame, &name, index)
                .map_err(|e| fault(e, node)),
        }
    }

    // ---- Assignment targets ----

    fn assign_to(&mut self, target: &AstNode, value: Value) -> Eval {
        match target.tag {
            NodeTag::Identifier => {
                self.scopes
                    .assign(target.name_str(), value.clone())
                    .map_err(|e| fault(e, target.offset))?;
                Ok(value)
            }
            NodeTag::Dereference => {
                let ptr = self.evaluate(child(target, 0)?)?;
                self.write_through_pointer(&ptr, value.clone(), target)?;
                Ok(value)
            }
            NodeTag::MemberAccess => {
                let member = target.name_str().to_string();
                let object = child(target, 0)?;
                if target.flags.contains(NodeFlags::ARROW) {
                    let ptr = self.evaluate(object)?;
                    let dest = self.deref_pointer(&ptr, target.offset)?;
                    return self
                        .set_struct_field(&dest, &member, value, target);
                }
                if object.tag == NodeTag::Identifier
                    && self.scopes.contains(object.name_str())
                {
                    self.scopes
                        .set_member(
                            object.name_str(),
                            &member,
                            value.clone(),
                        )
                        .map_err(|e| fault(e, target.offset))?;
                    return Ok(value);
                }
                let dest = self.evaluate(object)?;
                self.set_struct_field(&dest, &member, value, target)
            }
            NodeTag::ArrayAccess => {
                let array = child(target, 0)?;
                let index_value = self.evaluate(child(target, 1)?)?;
                let index = index_value
                    .as_i32()
                    .map_err(|e| fault(e, target.offset))?;
                if index < 0 {
                    return Err(fault(
                        RuntimeError::IndexOutOfRange {
                            name: array.name_str().to_string(),
                            index: i64::from(index),
                            len: 0,
                        },
                        target.offset,
                    ));
                }
                if array.tag == NodeTag::Identifier
                    && self.scopes.contains(array.name_str())
                {
                    self.scopes
                        .set_element(
                            array.name_str(),
                            index as usize,
                            value.clone(),
                        )
                        .map_err(|e| fault(e, target.offset))?;
                    return Ok(value);
                }
                let dest = self.evaluate(array)?;
                match dest {
                    Value::Array(a) => {
                        let mut a = a.borrow_mut();
                        let len = a.items.len();
                        match a.items.get_mut(index as usize) {
                            Some(slot) => {
                                *slot = value.clone();
                                Ok(value)
                            }
                            None => Err(fault(
                                RuntimeError::IndexOutOfRange {
                                    name: "<expression>".to_string(),
                                    index: i64::from(index),
                                    len,
                                },
                                target.offset,
                            )),
                        }
                    }
                    other => Err(fault(
                        RuntimeError::TypeError(format!(
                            "cannot index into {}",
                            other.type_label()
                        )),
                        target.offset,
                    )),
                }
            }
            _ => Err(fault(
                RuntimeError::TypeError(
                    "invalid assignment target".to_string(),
                ),
                target.offset,
            )),
        }
    }

    fn set_struct_field(
        &mut self,
        dest: &Value,
        member: &str,
        value: Value,
        target: &AstNode,
    ) -> Eval {
        match dest {
            Value::Struct(s) => {
                s.borrow_mut().set(member, value.clone());
                Ok(value)
            }
            other => Err(fault(
                RuntimeError::TypeError(format!(
                    "{} has no members",
                    other.type_label()
                )),
                target.offset,
            )),
        }
    }

    fn write_through_pointer(
        &mut self,
        ptr: &Value,
        value: Value,
        target: &AstNode,
    ) -> Result<(), Interrupt> {
        let ptr = match ptr {
            Value::Pointer(p) => p.borrow().clone(),
            other => {
                return Err(fault(
                    RuntimeError::TypeError(format!(
                        "cannot dereference {}",
                        other.type_label()
                    )),
                    target.offset,
                ))
            }
        };
        match ptr.target {
            None => {
                Err(fault(RuntimeError::NullDereference, target.offset))
            }
            Some(PointerTarget::Variable { frame, name }) => {
                if self.scopes.get_in_frame(frame, &name).is_none() {
                    return Err(fault(
                        RuntimeError::NullDereference,
                        target.offset,
                    ));
                }
                self.scopes
                    .assign_in_frame(frame, &name, value)
                    .map_err(|e| fault(e, target.offset))
            }
            Some(PointerTarget::Element { frame, name, index }) => self
                .scopes
                .set_element_in_frame(frame, &name, index, value)
                .map_err(|e| fault(e, target.offset)),
        }
    }

    // ---- Calls ----

    fn eval_call(&mut self, node: &AstNode) -> Eval {
        let callee = child(node, 0)?;
        let mut args = Vec::with_capacity(node.children.len() - 1);
        for arg in &node.children[1..] {
            args.push(self.evaluate(arg)?);
        }

        match callee.tag {
            NodeTag::Identifier => {
                let name = callee.name_str().to_string();
                // A function-pointer variable shadows the registries.
                if let Some(Value::Function(fp)) =
                    self.scopes.lookup_value(&name)
                {
                    return self.call_function(&fp.name, args, node.offset);
                }
                if let Some(result) =
                    library::internal(&name, &args, &mut self.rng)
                {
                    return result.map_err(|e| fault(e, node.offset));
                }
                if let Some(resolved) = library::external(None, &name, &args)
                {
                    let call =
                        resolved.map_err(|e| fault(e, node.offset))?;
                    return self.perform_external(call, node.offset);
                }
                self.call_function(&name, args, node.offset)
            }
            NodeTag::MemberAccess => {
                self.eval_method_call(node, callee, args)
            }
            _ => {
                let value = self.evaluate(callee)?;
                match value {
                    Value::Function(fp) => {
                        self.call_function(&fp.name, args, node.offset)
                    }
                    other => Err(fault(
                        RuntimeError::TypeError(format!(
                            "{} is not callable",
                            other.type_label()
                        )),
                        node.offset,
                    )),
                }
            }
        }
    }

    fn eval_method_call(
        &mut self,
        node: &AstNode,
        callee: &AstNode,
        args: Vec<Value>,
    ) -> Eval {
        let method = callee.name_str().to_string();
        let object = child(callee, 0)?;

        if object.tag == NodeTag::Identifier {
            let obj_name = object.name_str().to_string();

            if obj_name == "Serial" {
                return match library::external(
                    Some("Serial"),
                    &method,
                    &args,
                ) {
                    Some(resolved) => {
                        let call = resolved
                            .map_err(|e| fault(e, node.offset))?;
                        self.perform_external(call, node.offset)
                    }
                    None => Err(fault(
                        RuntimeError::UndefinedFunction(format!(
                            "Serial.{}",
                            method
                        )),
                        node.offset,
                    )),
                };
            }

            if let Some(var) = self.scopes.lookup(&obj_name) {
                let value = var.value.clone();
                let type_name = var.type_name.clone();

                if library::is_sensor_library(&type_name) {
                    let arg = match args.first() {
                        Some(v) => v
                            .as_i32()
                            .map_err(|e| fault(e, node.offset))?,
                        None => 0,
                    };
                    return self.request_value(
                        RequestKind::LibrarySensor {
                            library: type_name,
                            method,
                            arg,
                        },
                        node.offset,
                    );
                }

                match value {
                    Value::Str(s) => {
                        return self.eval_string_method(
                            &s,
                            &method,
                            &args,
                            Some(&obj_name),
                            node.offset,
                        );
                    }
                    Value::SharedStr(rc) => {
                        let s = rc.borrow().clone();
                        let outcome = self.eval_string_outcome(
                            &s,
                            &method,
                            &args,
                            node.offset,
                        )?;
                        if let Some(mutated) = outcome.mutated {
                            *rc.borrow_mut() = mutated;
                        }
                        return Ok(outcome.value);
                    }
                    Value::Struct(s) => {
                        let field = s.borrow().get(&method).cloned();
                        if let Some(Value::Function(fp)) = field {
                            return self.call_function(
                                &fp.name,
                                args,
                                node.offset,
                            );
                        }
                    }
                    _ => {}
                }
            }

            return Err(fault(
                RuntimeError::UndefinedFunction(format!(
                    "{}.{}",
                    obj_name, method
                )),
                node.offset,
            ));
        }

        // Method on an arbitrary expression: string methods only.
        let value = self.evaluate(object)?;
        match value {
            Value::Str(s) => {
                self.eval_string_method(&s, &method, &args, None, node.offset)
            }
            other => Err(fault(
                RuntimeError::TypeError(format!(
                    "{} has no method `{}`",
                    other.type_label(),
                    method
                )),
                node.offset,
            )),
        }
    }

    fn eval_string_outcome(
        &mut self,
        recv: &str,
        method: &str,
        args: &[Value],
        node: u32,
    ) -> Result<library::StringMethodOutcome, Interrupt> {
        match library::string_method(recv, method, args) {
            Some(result) => result.map_err(|e| fault(e, node)),
            None => Err(fault(
                RuntimeError::UndefinedFunction(format!(
                    "String.{}",
                    method
                )),
                node,
            )),
        }
    }

    fn eval_string_method(
        &mut self,
        recv: &str,
        method: &str,
        args: &[Value],
        write_back: Option<&str>,
        node: u32,
    ) -> Eval {
        let outcome = self.eval_string_outcome(recv, method, args, node)?;
        if let (Some(name), Some(mutated)) = (write_back, outcome.mutated) {
            self.scopes
                .assign(name, Value::Str(mutated))
                .map_err(|e| fault(e, node))?;
        }
        Ok(outcome.value)
    }
}

// ---- Free helpers ----

fn child<'a>(
    node: &'a AstNode,
    index: usize,
) -> Result<&'a AstNode, Interrupt> {
    node.children.get(index).ok_or_else(|| {
        fault(
            RuntimeError::TypeError(format!(
                "malformed `{:?}` node",
                node.tag
            )),
            node.offset,
        )
    })
}

fn node_op(node: &AstNode) -> Result<OpCode, Interrupt> {
    node.op.ok_or_else(|| {
        fault(
            RuntimeError::TypeError(format!(
                "`{:?}` node is missing its operator",
                node.tag
            )),
            node.offset,
        )
    })
}

fn literal_to_value(lit: &LiteralValue) -> Value {
    match lit {
        LiteralValue::Null => Value::Void,
        LiteralValue::Bool(b) => Value::Bool(*b),
        LiteralValue::Int(i) => Value::Int(*i),
        LiteralValue::UInt(u) => Value::UInt(*u),
        LiteralValue::Double(d) => Value::Double(*d),
        LiteralValue::Str(s) => Value::Str(s.clone()),
        LiteralValue::Char(c) => Value::Int(i32::from(*c)),
    }
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::IntVec(v) => v.len(),
        Value::DoubleVec(v) => v.len(),
        Value::StrVec(v) => v.len(),
        Value::IntMat(m) => m.len(),
        Value::DoubleMat(m) => m.len(),
        Value::Array(a) => a.borrow().items.len(),
        Value::Str(s) => s.len(),
        Value::SharedStr(s) => s.borrow().len(),
        _ => 0,
    }
}

fn index_value_of(
    value: &Value,
    index: usize,
) -> Result<Value, RuntimeError> {
    let oob = |len: usize| RuntimeError::IndexOutOfRange {
        name: "<expression>".to_string(),
        index: index as i64,
        len,
    };
    match value {
        Value::IntVec(v) => v
            .get(index)
            .map(|i| Value::Int(*i))
            .ok_or_else(|| oob(v.len())),
        Value::DoubleVec(v) => v
            .get(index)
            .map(|d| Value::Double(*d))
            .ok_or_else(|| oob(v.len())),
        Value::StrVec(v) => v
            .get(index)
            .map(|s| Value::Str(s.clone()))
            .ok_or_else(|| oob(v.len())),
        Value::IntMat(m) => m
            .get(index)
            .map(|row| Value::IntVec(row.clone()))
            .ok_or_else(|| oob(m.len())),
        Value::DoubleMat(m) => m
            .get(index)
            .map(|row| Value::DoubleVec(row.clone()))
            .ok_or_else(|| oob(m.len())),
        Value::Array(a) => {
            let a = a.borrow();
            a.items
                .get(index)
                .cloned()
                .ok_or_else(|| oob(a.items.len()))
        }
        Value::Str(s) => s
            .as_bytes()
            .get(index)
            .map(|b| Value::Int(i32::from(*b)))
            .ok_or_else(|| oob(s.len())),
        other => Err(RuntimeError::TypeError(format!(
            "cannot index into {}",
            other.type_label()
        ))),
    }
}

/// Shared scalar kinds used when shaping array declarations.
enum BaseKind {
    Int,
    Double,
    Str,
    Other,
}

fn base_kind(base: &str) -> BaseKind {
    match base {
        "int" | "long" | "short" | "char" | "byte" | "bool" | "boolean"
        | "unsigned int" | "unsigned long" | "unsigned short"
        | "unsigned char" | "int8_t" | "int16_t" | "int32_t" | "uint8_t"
        | "uint16_t" | "uint32_t" | "word" | "size_t" => BaseKind::Int,
        "float" | "double" => BaseKind::Double,
        "String" => BaseKind::Str,
        _ => BaseKind::Other,
    }
}

fn size_of_type(base: &str) -> u32 {
    match base {
        "char" | "bool" | "boolean" | "byte" | "int8_t" | "uint8_t" => 1,
        "short" | "int16_t" | "uint16_t" | "unsigned short" => 2,
        "double" => 8,
        // int, long, float, pointers: 4 on the reference 32-bit target
        _ => 4,
    }
}

fn size_of_value(value: &Value) -> u32 {
    match value {
        Value::Bool(_) => 1,
        Value::Double(_) => 8,
        Value::Str(s) => s.len() as u32 + 1,
        Value::SharedStr(s) => s.borrow().len() as u32 + 1,
        Value::IntVec(v) => 4 * v.len() as u32,
        Value::DoubleVec(v) => 8 * v.len() as u32,
        Value::IntMat(m) => {
            4 * m.iter().map(|r| r.len() as u32).sum::<u32>()
        }
        Value::DoubleMat(m) => {
            8 * m.iter().map(|r| r.len() as u32).sum::<u32>()
        }
        _ => 4,
    }
}

/// Numeric and string semantics for the binary operators: operands promote
/// to the wider of int32/double, int32 arithmetic wraps, integer division
/// truncates toward zero and errors on a zero divisor, double modulo keeps
/// the dividend's sign, string `+` concatenates and string comparisons are
/// lexicographic.
fn binary_op(
    op: OpCode,
    lhs: &Value,
    rhs: &Value,
) -> Result<Value, RuntimeError> {
    // String concatenation and comparison first.
    let lhs_str = string_of(lhs);
    let rhs_str = string_of(rhs);
    if let (Some(a), Some(b)) = (&lhs_str, &rhs_str) {
        return match op {
            OpCode::Add => Ok(Value::Str(format!("{}{}", a, b))),
            OpCode::Eq => Ok(Value::Bool(a == b)),
            OpCode::Ne => Ok(Value::Bool(a != b)),
            OpCode::Lt => Ok(Value::Bool(a < b)),
            OpCode::Le => Ok(Value::Bool(a <= b)),
            OpCode::Gt => Ok(Value::Bool(a > b)),
            OpCode::Ge => Ok(Value::Bool(a >= b)),
            _ => Err(RuntimeError::TypeError(format!(
                "`{:?}` is not defined for strings",
                op
            ))),
        };
    }
    if lhs_str.is_some() || rhs_str.is_some() {
        // One string side: `+` stringifies the other operand.
        if op == OpCode::Add {
            return Ok(Value::Str(format!("{}{}", lhs, rhs)));
        }
        if op == OpCode::Eq {
            return Ok(Value::Bool(false));
        }
        if op == OpCode::Ne {
            return Ok(Value::Bool(true));
        }
        return Err(RuntimeError::TypeError(format!(
            "`{:?}` needs numeric operands",
            op
        )));
    }

    if op == OpCode::Eq {
        return Ok(Value::Bool(lhs == rhs));
    }
    if op == OpCode::Ne {
        return Ok(Value::Bool(lhs != rhs));
    }

    match Value::promote(lhs, rhs)? {
        NumericPair::Int(a, b) => int_binary_op(op, a, b),
        NumericPair::UInt(a, b) => uint_binary_op(op, a, b),
        NumericPair::Double(a, b) => double_binary_op(op, a, b),
    }
}

fn string_of(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.clone()),
        Value::SharedStr(s) => Some(s.borrow().clone()),
        _ => None,
    }
}

fn int_binary_op(op: OpCode, a: i32, b: i32) -> Result<Value, RuntimeError> {
    Ok(match op {
        OpCode::Add => Value::Int(a.wrapping_add(b)),
        OpCode::Sub => Value::Int(a.wrapping_sub(b)),
        OpCode::Mul => Value::Int(a.wrapping_mul(b)),
        OpCode::Div => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            Value::Int(a.wrapping_div(b))
        }
        OpCode::Mod => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            Value::Int(a.wrapping_rem(b))
        }
        OpCode::Lt => Value::Bool(a < b),
        OpCode::Le => Value::Bool(a <= b),
        OpCode::Gt => Value::Bool(a > b),
        OpCode::Ge => Value::Bool(a >= b),
        OpCode::BitAnd => Value::Int(a & b),
        OpCode::BitOr => Value::Int(a | b),
        OpCode::BitXor => Value::Int(a ^ b),
        OpCode::Shl => Value::Int(a.wrapping_shl(b as u32)),
        OpCode::Shr => Value::Int(a.wrapping_shr(b as u32)),
        _ => {
            return Err(RuntimeError::TypeError(format!(
                "`{:?}` is not a binary operator",
                op
            )))
        }
    })
}

fn uint_binary_op(op: OpCode, a: u32, b: u32) -> Result<Value, RuntimeError> {
    Ok(match op {
        OpCode::Add => Value::UInt(a.wrapping_add(b)),
        OpCode::Sub => Value::UInt(a.wrapping_sub(b)),
        OpCode::Mul => Value::UInt(a.wrapping_mul(b)),
        OpCode::Div => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            Value::UInt(a / b)
        }
        OpCode::Mod => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            Value::UInt(a % b)
        }
        OpCode::Lt => Value::Bool(a < b),
        OpCode::Le => Value::Bool(a <= b),
        OpCode::Gt => Value::Bool(a > b),
        OpCode::Ge => Value::Bool(a >= b),
        OpCode::BitAnd => Value::UInt(a & b),
        OpCode::BitOr => Value::UInt(a | b),
        OpCode::BitXor => Value::UInt(a ^ b),
        OpCode::Shl => Value::UInt(a.wrapping_shl(b)),
        OpCode::Shr => Value::UInt(a.wrapping_shr(b)),
        _ => {
            return Err(RuntimeError::TypeError(format!(
                "`{:?}` is not a binary operator",
                op
            )))
        }
    })
}

fn double_binary_op(
    op: OpCode,
    a: f64,
    b: f64,
) -> Result<Value, RuntimeError> {
    Ok(match op {
        OpCode::Add => Value::Double(a + b),
        OpCode::Sub => Value::Double(a - b),
        OpCode::Mul => Value::Double(a * b),
        // Double division by zero yields IEEE infinity/NaN, not an error.
        OpCode::Div => Value::Double(a / b),
        OpCode::Mod => Value::Double(a % b),
        OpCode::Lt => Value::Bool(a < b),
        OpCode::Le => Value::Bool(a <= b),
        OpCode::Gt => Value::Bool(a > b),
        OpCode::Ge => Value::Bool(a >= b),
        _ => {
            return Err(RuntimeError::TypeError(format!(
                "`{:?}` needs integer operands",
                op
            )))
        }
    })
}
