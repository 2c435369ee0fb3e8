//! Programs: source or built-in kernel sets, built through a [`Compiler`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tiocl_devmgr::{KernelFn, KernelLibrary, KernelTable};
use tracing::{debug, info};

use crate::device::{Device, DeviceId, DeviceKind};
use crate::handle::{ContextHandle, DeviceHandle};
use crate::{ClError, ClResult};

const CL_OPTIONS: &[&str] = &[
    "-cl-single-precision-constant",
    "-cl-denorms-are-zero",
    "-cl-opt-disable",
    "-cl-mad-enable",
    "-cl-no-signed-zeros",
    "-cl-unsafe-math-optimizations",
    "-cl-finite-math-only",
    "-cl-fast-relaxed-math",
    "-cl-kernel-arg-info",
];

/// Parsed build option string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub defines: Vec<String>,
    pub include_dirs: Vec<String>,
    /// `-cl-*` flags, passed through untouched.
    pub cl_flags: Vec<String>,
    pub suppress_warnings: bool,
    pub warnings_as_errors: bool,
    pub debug_info: bool,
}

impl BuildOptions {
    pub fn parse(options: &str) -> ClResult<Self> {
        let mut parsed = Self::default();
        let mut tokens = options.split_whitespace();
        while let Some(token) = tokens.next() {
            match token {
                "-D" => parsed
                    .defines
                    .push(tokens.next().ok_or(ClError::InvalidBuildOptions)?.to_string()),
                "-I" => parsed
                    .include_dirs
                    .push(tokens.next().ok_or(ClError::InvalidBuildOptions)?.to_string()),
                "-w" => parsed.suppress_warnings = true,
                "-Werror" => parsed.warnings_as_errors = true,
                "-g" => parsed.debug_info = true,
                t if t.starts_with("-D") => parsed.defines.push(t[2..].to_string()),
                t if t.starts_with("-I") => parsed.include_dirs.push(t[2..].to_string()),
                t if CL_OPTIONS.contains(&t) || t.starts_with("-cl-std=") => {
                    parsed.cl_flags.push(t.to_string())
                }
                other => {
                    debug!(option = other, "unsupported build option");
                    return Err(ClError::InvalidBuildOptions);
                }
            }
        }
        Ok(parsed)
    }
}

#[derive(Clone)]
pub struct CompiledKernel {
    pub name: String,
    pub arity: u32,
    pub body: KernelFn,
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramBinary {
    pub kernels: Vec<CompiledKernel>,
    /// Warnings, if any.
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub log: String,
}

/// Turns program source into kernels the devices can run.
pub trait Compiler: Send + Sync {
    fn build(
        &self,
        source: &str,
        options: &BuildOptions,
        devices: &[DeviceKind],
    ) -> Result<ProgramBinary, BuildFailure>;
}

/// Resolves `__kernel void name(params)` declarations against host-registered kernel bodies.
#[derive(Debug, Clone, Default)]
pub struct LibraryCompiler {
    library: KernelLibrary,
}

impl LibraryCompiler {
    pub fn new(library: KernelLibrary) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &KernelLibrary {
        &self.library
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Declaration {
    line: usize,
    name: String,
    returns: String,
    arity: u32,
}

impl Compiler for LibraryCompiler {
    fn build(
        &self,
        source: &str,
        options: &BuildOptions,
        devices: &[DeviceKind],
    ) -> Result<ProgramBinary, BuildFailure> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if devices.contains(&DeviceKind::Custom) {
            errors.push("error: custom devices only run built-in kernels".to_string());
        }

        let mut kernels: Vec<CompiledKernel> = Vec::new();
        for decl in declarations(source, &mut errors) {
            let at = format!("program.cl:{}", decl.line);
            if decl.returns != "void" {
                errors.push(format!("{at}: error: kernel '{}' must return void", decl.name));
                continue;
            }
            if kernels.iter().any(|k| k.name == decl.name) {
                errors.push(format!("{at}: error: redefinition of kernel '{}'", decl.name));
                continue;
            }
            let Some(body) = self.library.get(&decl.name) else {
                errors.push(format!(
                    "{at}: error: no definition for kernel '{}' in the kernel library",
                    decl.name
                ));
                continue;
            };
            match self.library.arity(&decl.name) {
                Some(arity) if arity != decl.arity => errors.push(format!(
                    "{at}: error: kernel '{}' declares {} parameters, its body takes {arity}",
                    decl.name, decl.arity
                )),
                Some(_) => {}
                None => warnings.push(format!(
                    "{at}: warning: parameters of kernel '{}' cannot be checked",
                    decl.name
                )),
            }
            kernels.push(CompiledKernel {
                name: decl.name,
                arity: decl.arity,
                body,
            });
        }

        if options.suppress_warnings {
            warnings.clear();
        }
        if options.warnings_as_errors && !warnings.is_empty() {
            errors.append(&mut warnings);
        }
        if !errors.is_empty() {
            let count = errors.len();
            errors.extend(warnings);
            errors.push(format!("{count} error(s) generated."));
            return Err(BuildFailure {
                log: errors.join("\n"),
            });
        }
        Ok(ProgramBinary {
            kernels,
            log: warnings.join("\n"),
        })
    }
}

/// Replaces comments with spaces, keeping newlines so line numbers survive.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn declarations(source: &str, errors: &mut Vec<String>) -> Vec<Declaration> {
    let text = strip_comments(source);
    let mut found = Vec::new();
    let mut rest = text.as_str();
    let mut consumed = 0;
    while let Some(pos) = find_keyword(rest) {
        let start = consumed + pos;
        let line = text[..start].matches('\n').count() + 1;
        let keyword_len = if rest[pos..].starts_with("__kernel") { 8 } else { 6 };
        let after = &text[start + keyword_len..];
        let Some(open) = after.find('(') else {
            errors.push(format!("program.cl:{line}: error: expected '(' after kernel name"));
            break;
        };
        let head: Vec<&str> = after[..open].split_whitespace().collect();
        let Some(close) = after[open..].find(')') else {
            errors.push(format!("program.cl:{line}: error: unterminated parameter list"));
            break;
        };
        let params = after[open + 1..open + close].trim();
        match head.as_slice() {
            [returns, name] if name.chars().all(is_ident) => found.push(Declaration {
                line,
                name: name.to_string(),
                returns: returns.to_string(),
                arity: if params.is_empty() || params == "void" {
                    0
                } else {
                    params.split(',').count() as u32
                },
            }),
            _ => errors.push(format!(
                "program.cl:{line}: error: malformed kernel declaration"
            )),
        }
        let advance = start + keyword_len + open + close + 1 - consumed;
        consumed += advance;
        rest = &rest[advance..];
    }
    found
}

/// Position of the next `__kernel` or `kernel` keyword standing on its own.
fn find_keyword(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = text[from..].find("kernel") {
        let at = from + pos;
        let start = if text[..at].ends_with("__") { at - 2 } else { at };
        let before_ok = text[..start].chars().next_back().map_or(true, |c| !is_ident(c));
        let after_ok = text[at + 6..].chars().next().map_or(true, |c| !is_ident(c));
        if before_ok && after_ok {
            return Some(start);
        }
        from = at + 6;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStatus {
    /// Created, never built.
    Loaded,
    Built,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub status: BuildStatus,
    pub options: String,
    pub log: String,
}

struct Placement {
    device: DeviceId,
    table: Arc<KernelTable>,
    entries: HashMap<String, u32>,
}

/// Kernels of a built program and where they are registered on each root device.
///
/// Dropping it removes the kernels from the devices' tables, so launches hold on to it.
pub(crate) struct LoadedProgram {
    kernels: BTreeMap<String, (KernelFn, Option<u32>)>,
    placements: Vec<Placement>,
}

impl LoadedProgram {
    fn place(binary: &ProgramBinary, devices: &[Arc<dyn Device>]) -> Self {
        let mut placements: Vec<Placement> = Vec::new();
        for device in devices {
            let root = device.root();
            if placements.iter().any(|p| p.device == root) {
                continue;
            }
            let Some(table) = device.kernel_table() else {
                continue;
            };
            let entries = binary
                .kernels
                .iter()
                .map(|k| (k.name.clone(), table.register(&k.name, Arc::clone(&k.body))))
                .collect();
            placements.push(Placement {
                device: root,
                table,
                entries,
            });
        }
        Self {
            kernels: binary
                .kernels
                .iter()
                .map(|k| (k.name.clone(), (Arc::clone(&k.body), Some(k.arity))))
                .collect(),
            placements,
        }
    }

    fn built_in(kernels: BTreeMap<String, (KernelFn, Option<u32>)>) -> Self {
        Self {
            kernels,
            placements: Vec::new(),
        }
    }

    /// Kernel table entry of `name` on root device `device`.
    pub(crate) fn entry(&self, device: DeviceId, name: &str) -> Option<u32> {
        self.placements
            .iter()
            .find(|p| p.device == device)
            .and_then(|p| p.entries.get(name).copied())
    }

    pub(crate) fn is_placed_on(&self, device: DeviceId) -> bool {
        self.placements.iter().any(|p| p.device == device)
    }

    pub(crate) fn kernel(&self, name: &str) -> Option<(KernelFn, Option<u32>)> {
        self.kernels
            .get(name)
            .map(|(body, arity)| (Arc::clone(body), *arity))
    }

    pub(crate) fn kernel_names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }
}

impl Drop for LoadedProgram {
    fn drop(&mut self) {
        for placement in &self.placements {
            for entry in placement.entries.values() {
                placement.table.unregister(*entry);
            }
        }
    }
}

enum ProgramSource {
    Source(String),
    BuiltIn,
}

struct ProgramState {
    status: BuildStatus,
    log: String,
    options: String,
    loaded: Option<Arc<LoadedProgram>>,
}

pub struct Program {
    context: ContextHandle,
    devices: Vec<(DeviceHandle, Arc<dyn Device>)>,
    source: ProgramSource,
    state: Mutex<ProgramState>,
    kernels_live: AtomicUsize,
}

impl Program {
    pub(crate) fn with_source(
        context: ContextHandle,
        devices: Vec<(DeviceHandle, Arc<dyn Device>)>,
        source: String,
    ) -> Self {
        Self {
            context,
            devices,
            source: ProgramSource::Source(source),
            state: Mutex::new(ProgramState {
                status: BuildStatus::Loaded,
                log: String::new(),
                options: String::new(),
                loaded: None,
            }),
            kernels_live: AtomicUsize::new(0),
        }
    }

    /// A program over built-in kernels; every device must provide every name.
    pub(crate) fn with_built_in_kernels(
        context: ContextHandle,
        devices: Vec<(DeviceHandle, Arc<dyn Device>)>,
        names: &str,
    ) -> ClResult<Self> {
        let names: Vec<String> = names
            .split(';')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() || devices.is_empty() {
            return Err(ClError::InvalidValue);
        }
        let mut kernels = BTreeMap::new();
        for name in &names {
            for (_, device) in &devices {
                let found = device.builtin_kernel(name).ok_or(ClError::InvalidValue)?;
                kernels.entry(name.clone()).or_insert(found);
            }
        }
        Ok(Self {
            context,
            devices,
            source: ProgramSource::BuiltIn,
            state: Mutex::new(ProgramState {
                status: BuildStatus::Built,
                log: String::new(),
                options: String::new(),
                loaded: Some(Arc::new(LoadedProgram::built_in(kernels))),
            }),
            kernels_live: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProgramState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn device_handles(&self) -> Vec<DeviceHandle> {
        self.devices.iter().map(|(h, _)| *h).collect()
    }

    pub(crate) fn has_device(&self, device: DeviceHandle) -> bool {
        self.devices.iter().any(|(h, _)| *h == device)
    }

    pub fn is_built_in(&self) -> bool {
        matches!(self.source, ProgramSource::BuiltIn)
    }

    pub fn source(&self) -> Option<&str> {
        match &self.source {
            ProgramSource::Source(source) => Some(source),
            ProgramSource::BuiltIn => None,
        }
    }

    pub fn status(&self) -> BuildStatus {
        self.lock().status
    }

    pub fn build_info(&self) -> BuildInfo {
        let state = self.lock();
        BuildInfo {
            status: state.status,
            options: state.options.clone(),
            log: state.log.clone(),
        }
    }

    pub fn kernel_names(&self) -> Vec<String> {
        match &self.lock().loaded {
            Some(loaded) => loaded.kernel_names().map(str::to_string).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn loaded(&self) -> Option<Arc<LoadedProgram>> {
        self.lock().loaded.clone()
    }

    pub(crate) fn kernel_created(&self) {
        self.kernels_live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn kernel_released(&self) {
        self.kernels_live.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn kernels_live(&self) -> usize {
        self.kernels_live.load(Ordering::Acquire)
    }

    /// Builds for `devices` (all of the program's devices when `None`).
    pub(crate) fn build(
        &self,
        devices: Option<&[DeviceHandle]>,
        options: &str,
        compiler: Option<&dyn Compiler>,
    ) -> ClResult<()> {
        let ProgramSource::Source(source) = &self.source else {
            return Err(ClError::InvalidOperation);
        };
        let targets: Vec<Arc<dyn Device>> = match devices {
            None => self.devices.iter().map(|(_, d)| Arc::clone(d)).collect(),
            Some([]) => return Err(ClError::InvalidValue),
            Some(handles) => handles
                .iter()
                .map(|h| {
                    self.devices
                        .iter()
                        .find(|(dh, _)| dh == h)
                        .map(|(_, d)| Arc::clone(d))
                        .ok_or(ClError::InvalidDevice)
                })
                .collect::<ClResult<_>>()?,
        };
        if self.kernels_live() > 0 {
            return Err(ClError::InvalidOperation);
        }
        let parsed = BuildOptions::parse(options)?;
        let compiler = compiler.ok_or(ClError::CompilerNotAvailable)?;
        let kinds: Vec<DeviceKind> = targets.iter().map(|d| d.kind()).collect();

        let outcome = compiler.build(source, &parsed, &kinds);
        let mut state = self.lock();
        state.options = options.to_string();
        match outcome {
            Ok(binary) => {
                info!(kernels = binary.kernels.len(), "program built");
                state.loaded = Some(Arc::new(LoadedProgram::place(&binary, &targets)));
                state.log = binary.log;
                state.status = BuildStatus::Built;
                Ok(())
            }
            Err(failure) => {
                debug!(log = %failure.log, "program build failed");
                state.loaded = None;
                state.log = failure.log;
                state.status = BuildStatus::Failed;
                Err(ClError::BuildProgramFailure)
            }
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("built_in", &self.is_built_in())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tiocl_devmgr::{KernelContext, KernelFault};

    fn noop(_ctx: &KernelContext<'_>) -> Result<(), KernelFault> {
        Ok(())
    }

    fn compiler() -> LibraryCompiler {
        LibraryCompiler::new(
            KernelLibrary::new()
                .with_kernel_arity("vadd", 3, noop)
                .with_kernel("fill", noop),
        )
    }

    #[test]
    fn options_accept_the_documented_set() {
        let opts = BuildOptions::parse("-D N=4 -DDEBUG -I inc -Iother -w -g -cl-mad-enable -cl-std=CL1.2")
            .unwrap();
        assert_eq!(opts.defines, vec!["N=4", "DEBUG"]);
        assert_eq!(opts.include_dirs, vec!["inc", "other"]);
        assert_eq!(opts.cl_flags, vec!["-cl-mad-enable", "-cl-std=CL1.2"]);
        assert!(opts.suppress_warnings && opts.debug_info && !opts.warnings_as_errors);
        assert_eq!(BuildOptions::parse("-O3"), Err(ClError::InvalidBuildOptions));
        assert_eq!(BuildOptions::parse("-D"), Err(ClError::InvalidBuildOptions));
    }

    #[test]
    fn declarations_survive_comments_and_qualifiers() {
        let src = "// kernel void ignored(int a)\n\
                   /* __kernel void also_ignored() */\n\
                   __kernel void vadd(__global const int *a,\n  __global const int *b, __global int *c) {}\n\
                   kernel void fill(void) {}\n\
                   void kernelish(int x) {}\n";
        let mut errors = Vec::new();
        let found = declarations(src, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            found,
            vec![
                Declaration {
                    line: 3,
                    name: "vadd".into(),
                    returns: "void".into(),
                    arity: 3
                },
                Declaration {
                    line: 5,
                    name: "fill".into(),
                    returns: "void".into(),
                    arity: 0
                },
            ]
        );
    }

    #[test]
    fn resolves_kernels_against_the_library() {
        let src = "__kernel void vadd(global int *a, global int *b, global int *c) {}\n";
        let binary = compiler()
            .build(src, &BuildOptions::default(), &[DeviceKind::Accelerator])
            .unwrap();
        assert_eq!(binary.kernels.len(), 1);
        assert_eq!(binary.kernels[0].arity, 3);
        assert_eq!(binary.log, "");
    }

    #[test]
    fn unknown_kernels_fail_with_a_line_numbered_log() {
        let src = "\n\n__kernel void missing(int x) {}\n";
        let failure = compiler()
            .build(src, &BuildOptions::default(), &[DeviceKind::Accelerator])
            .unwrap_err();
        assert_eq!(
            failure.log,
            "program.cl:3: error: no definition for kernel 'missing' in the kernel library\n\
             1 error(s) generated."
        );
    }

    #[test]
    fn arity_mismatch_is_an_error() {
        let src = "__kernel void vadd(global int *a) {}";
        let failure = compiler()
            .build(src, &BuildOptions::default(), &[DeviceKind::Accelerator])
            .unwrap_err();
        assert!(failure.log.contains("declares 1 parameters, its body takes 3"));
    }

    #[test]
    fn unchecked_arity_warns_and_werror_fails() {
        let src = "__kernel void fill(global int *a) {}";
        let binary = compiler()
            .build(src, &BuildOptions::default(), &[DeviceKind::Accelerator])
            .unwrap();
        assert!(binary.log.contains("warning"));

        let quiet = BuildOptions::parse("-w").unwrap();
        let binary = compiler()
            .build(src, &quiet, &[DeviceKind::Accelerator])
            .unwrap();
        assert_eq!(binary.log, "");

        let strict = BuildOptions::parse("-Werror").unwrap();
        assert!(compiler()
            .build(src, &strict, &[DeviceKind::Accelerator])
            .is_err());
    }

    #[test]
    fn custom_devices_reject_source_programs() {
        let src = "__kernel void fill(void) {}";
        let failure = compiler()
            .build(src, &BuildOptions::default(), &[DeviceKind::Custom])
            .unwrap_err();
        assert!(failure.log.contains("built-in kernels"));
    }

    #[test]
    fn loaded_programs_unregister_on_drop() {
        let table = Arc::new(KernelTable::new());
        let binary = ProgramBinary {
            kernels: vec![CompiledKernel {
                name: "k".into(),
                arity: 0,
                body: Arc::new(noop),
            }],
            log: String::new(),
        };
        let entries: HashMap<String, u32> = binary
            .kernels
            .iter()
            .map(|k| (k.name.clone(), table.register(&k.name, Arc::clone(&k.body))))
            .collect();
        let loaded = LoadedProgram {
            kernels: BTreeMap::new(),
            placements: vec![Placement {
                device: DeviceId(3),
                table: Arc::clone(&table),
                entries,
            }],
        };
        assert!(loaded.entry(DeviceId(3), "k").is_some());
        assert!(loaded.entry(DeviceId(4), "k").is_none());
        assert_eq!(table.len(), 1);
        drop(loaded);
        assert!(table.is_empty());
    }
}
