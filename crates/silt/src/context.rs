//! The interpreter context: owner of the loader arena, the native function
//! registry, the garbage collector and the call-depth limit. The host enters
//! the VM through [`Context::invoke`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::debug;

use crate::error::{ErrorKind, Result};
use crate::gc::{Gc, Ref};
use crate::interp::{Frame, Machine};
use crate::loader::{self, FunctionKind, ModuleId, ModuleLoader};
use crate::module::{BaseType, FunctionSignature, Module, VariableType};
use crate::stack::OperandStack;
use crate::value::Value;

/// File extension of persisted modules.
pub const MODULE_EXT: &str = "sbc";

/// Source of module bytes, keyed by import name (`a::b::mod`).
pub trait ModuleSource {
    fn load_module(&self, name: &str) -> Result<Vec<u8>>;
}

/// Loads modules from files below a root directory; `::` separates path
/// segments.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModuleSource for DirectorySource {
    fn load_module(&self, name: &str) -> Result<Vec<u8>> {
        let mut path = self.root.clone();
        for segment in name.split("::") {
            path.push(segment);
        }
        path.set_extension(MODULE_EXT);
        std::fs::read(&path)
            .map_err(|e| ErrorKind::ModuleNotFound(format!("{}: {e}", path.display())).into())
    }
}

/// A native function observes the VM's calling convention: it pops its
/// declared arguments in reverse order (releasing their temporaries) and
/// pushes its return value, as a temporary when managed.
pub type NativeFn = Rc<dyn Fn(&mut Gc, &mut OperandStack) -> Result<()>>;

pub struct Context {
    loaders: Vec<ModuleLoader>,
    loader_ids: HashMap<String, ModuleId>,
    loading: HashSet<String>,
    natives: HashMap<(String, String), NativeFn>,
    gc: Gc,
    max_call_depth: usize,
    source: Box<dyn ModuleSource>,
}

impl Context {
    #[must_use]
    pub fn new(source: Box<dyn ModuleSource>) -> Self {
        Self::with_limits(source, 500)
    }

    #[must_use]
    pub fn with_limits(source: Box<dyn ModuleSource>, max_call_depth: usize) -> Self {
        Self::with_gc(source, Gc::default(), max_call_depth)
    }

    /// Construct a context with explicit GC thresholds, e.g. for tests that
    /// force frequent collection cycles.
    #[must_use]
    pub fn with_gc(source: Box<dyn ModuleSource>, gc: Gc, max_call_depth: usize) -> Self {
        Self {
            loaders: Vec::new(),
            loader_ids: HashMap::new(),
            loading: HashSet::new(),
            natives: HashMap::new(),
            gc,
            max_call_depth,
            source,
        }
    }

    #[must_use]
    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    pub fn gc_mut(&mut self) -> &mut Gc {
        &mut self.gc
    }

    /// Register a native function under `(library, name)`. Fails if the
    /// function is already defined, either natively or by a loaded module of
    /// the same name.
    pub fn register_native(
        &mut self,
        library: &str,
        name: &str,
        f: impl Fn(&mut Gc, &mut OperandStack) -> Result<()> + 'static,
    ) -> Result<()> {
        if let Some(&id) = self.loader_ids.get(library) {
            if self.loaders[id].has_function(name) {
                return Err(ErrorKind::Runtime(format!(
                    "cannot register native function: '{name}' is already defined for module '{library}'"
                ))
                .into());
            }
        }
        let key = (library.to_owned(), name.to_owned());
        if self.natives.contains_key(&key) {
            return Err(ErrorKind::Runtime(format!(
                "cannot register native function: '{name}' is already defined for module '{library}'"
            ))
            .into());
        }
        self.natives.insert(key, Rc::new(f));
        Ok(())
    }

    pub(crate) fn native_callback(&self, library: &str, name: &str) -> Option<NativeFn> {
        self.natives
            .get(&(library.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Resolve a module by import name, loading (and linking) it on first
    /// use. Recursive imports load depth-first; cycles are a loader error.
    pub fn resolve_module(&mut self, name: &str) -> Result<ModuleId> {
        if let Some(&id) = self.loader_ids.get(name) {
            return Ok(id);
        }
        if !self.loading.insert(name.to_owned()) {
            return Err(ErrorKind::ImportCycle(name.to_owned()).into());
        }
        let outcome = self.load_module(name);
        self.loading.remove(name);
        outcome
    }

    fn load_module(&mut self, name: &str) -> Result<ModuleId> {
        debug!(target: "context", module = name, "loading module");
        let bytes = self.source.load_module(name)?;
        let module = Module::parse(&bytes)?;

        let id = self.loaders.len();
        self.loaders.push(ModuleLoader::placeholder(name));
        let loader = loader::link(self, id, name, module)?;
        self.loaders[id] = loader;
        self.loader_ids.insert(name.to_owned(), id);
        Ok(id)
    }

    #[must_use]
    pub fn loader(&self, id: ModuleId) -> &ModuleLoader {
        &self.loaders[id]
    }

    #[must_use]
    pub fn loader_by_name(&self, name: &str) -> Option<&ModuleLoader> {
        self.loader_ids.get(name).map(|&id| &self.loaders[id])
    }

    /// Reset the interpreter after a failed invocation: the call level
    /// restarts at zero and the GC frees all managed memory.
    pub fn reset(&mut self) {
        self.gc.reset();
    }

    /// Invoke a function from a module by name.
    pub fn invoke(&mut self, module: &str, function: &str, args: &[Value]) -> Result<Value> {
        debug!(target: "context", module, function, "invoke");
        match self.invoke_inner(module, function, args) {
            Ok(value) => Ok(value),
            Err(mut err) => {
                for entry in err.trace_mut() {
                    if entry.function.is_none() {
                        entry.function = self
                            .loader_ids
                            .get(&entry.module)
                            .and_then(|&id| self.loaders[id].resolve_entry_point(entry.entry))
                            .map(str::to_owned);
                    }
                }
                if err.trace().is_empty() {
                    // The failure happened before any frame was entered.
                    err.push_frame(module.to_owned(), 0, 0);
                    err.trace_mut()[0].function = Some(function.to_owned());
                }
                self.reset();
                Err(err)
            }
        }
    }

    fn invoke_inner(&mut self, module: &str, function: &str, args: &[Value]) -> Result<Value> {
        let mid = self.resolve_module(module)?;
        let fid = self.loaders[mid].function_id(function)?;

        let max_call_depth = self.max_call_depth;
        let loaders = &self.loaders;
        let gc = &mut self.gc;
        let f = loaders[mid].function(fid);

        let value = match &f.kind {
            FunctionKind::Bytecode(body) => {
                let mut frame = Frame::new(body.locals_size, body.stack_size);
                let scope = ArgumentsScope::create(
                    gc,
                    args,
                    &f.signature.arg_types,
                    &mut frame.locals,
                    false,
                )?;

                {
                    let mut machine = Machine::new(loaders, &mut *gc, max_call_depth);
                    machine.execute(mid, body, &mut frame)?;
                }

                let value = unwrap_return(gc, &f.signature, &mut frame.stack)?;
                scope.teardown(gc, args, &mut frame.locals)?;

                // Collect on host re-entry, then verify the frame is clean.
                gc.collect();
                if !frame.stack.is_empty() {
                    return Err(
                        ErrorKind::Runtime("non-empty stack on function exit".into()).into(),
                    );
                }
                value
            }
            FunctionKind::Native { callback, .. } => {
                let args_width: usize = args.iter().map(Value::size).sum();
                let ret_width = f.signature.return_type.stack_width();
                let mut frame = Frame::new(args_width, args_width + ret_width);

                // The callback consumes the argument temporaries as it pops.
                let scope = ArgumentsScope::create(
                    gc,
                    args,
                    &f.signature.arg_types,
                    &mut frame.locals,
                    true,
                )?;
                frame.stack.push_bytes(&frame.locals)?;

                (callback.as_ref())(&mut *gc, &mut frame.stack)?;

                let value = unwrap_return(gc, &f.signature, &mut frame.stack)?;
                scope.teardown(gc, args, &mut frame.locals)?;

                gc.collect();
                if !frame.stack.is_empty() {
                    return Err(
                        ErrorKind::Runtime("non-empty stack on function exit".into()).into(),
                    );
                }
                value
            }
        };

        Ok(value)
    }
}

/// Argument creation and teardown around one invocation.
///
/// Creation validates each value against the signature, materializes it in
/// the callee's locals, registers persistent handles for layout-carrying
/// values and temporaries for borrowed managed handles (owned allocations
/// already carry one from their temporary-flagged allocation).
struct ArgumentsScope {
    /// Locals offset and managed handle per argument.
    slots: Vec<(usize, Option<Ref>)>,
    /// When the callee is native it consumes the argument temporaries while
    /// popping, so teardown must not release them again.
    temporaries_consumed: bool,
}

impl ArgumentsScope {
    fn create(
        gc: &mut Gc,
        args: &[Value],
        arg_types: &[VariableType],
        locals: &mut [u8],
        temporaries_consumed: bool,
    ) -> Result<Self> {
        if arg_types.len() != args.len() {
            return Err(ErrorKind::ArgumentCount {
                expected: arg_types.len(),
                got: args.len(),
            }
            .into());
        }

        let mut slots = Vec::with_capacity(args.len());
        let mut offset = 0;
        for (index, (value, expected)) in args.iter().zip(arg_types).enumerate() {
            value.check_against(index, expected)?;

            if offset + value.size() > locals.len() {
                return Err(ErrorKind::Runtime(format!(
                    "overflow of the locals area while writing argument {index}"
                ))
                .into());
            }

            let borrowed = value.borrowed_handle();
            let (written, handle) = value.create_into(gc, &mut locals[offset..])?;

            if let (Some(layout_id), Some(handle)) = (value.layout_id(), handle) {
                gc.add_persistent(handle, layout_id)?;
            }
            if borrowed.is_some() {
                gc.add_temporary(borrowed);
            }

            slots.push((offset, handle));
            offset += written;
        }

        Ok(Self {
            slots,
            temporaries_consumed,
        })
    }

    fn teardown(&self, gc: &mut Gc, args: &[Value], locals: &mut [u8]) -> Result<()> {
        for ((offset, handle), value) in self.slots.iter().zip(args) {
            if value.layout_id().is_some() {
                if let Some(handle) = *handle {
                    gc.remove_persistent(handle)?;
                }
            }
            if value.is_gc() && !self.temporaries_consumed {
                gc.remove_temporary(*handle)?;
            }
            value.destroy_in(&mut locals[*offset..])?;
        }
        Ok(())
    }
}

/// Pop the return value off the frame's operand stack and wrap it for the
/// host, by the return type's ABI class.
fn unwrap_return(
    gc: &mut Gc,
    signature: &FunctionSignature,
    stack: &mut OperandStack,
) -> Result<Value> {
    let ty = &signature.return_type;
    if ty.is_void() {
        return Ok(Value::Void);
    }

    if ty.is_gc() {
        if !ty.is_array() && ty.base == BaseType::Str {
            // Strings are copied out; the temporary is released here.
            return match stack.pop_ref()? {
                Some(s) => {
                    let content = gc.string(s)?.to_owned();
                    gc.remove_temporary(Some(s))?;
                    Ok(Value::Str(content))
                }
                None => Ok(Value::Typed {
                    ty: ty.clone(),
                    handle: None,
                }),
            };
        }
        // The handle keeps its temporary count; releasing it is the host's
        // responsibility.
        let handle = stack.pop_ref()?;
        return Ok(Value::Typed {
            ty: ty.clone(),
            handle,
        });
    }

    match ty.base {
        BaseType::I32 => Ok(Value::I32(stack.pop_i32()?)),
        BaseType::F32 => Ok(Value::F32(stack.pop_f32()?)),
        _ => Err(ErrorKind::UnsupportedBoundaryType(ty.to_string()).into()),
    }
}
