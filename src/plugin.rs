//! The code-generation plugin abstraction.
//!
//! A plugin is anything that turns a [`CodeGenRequest`] into file contents
//! on a [`CodeGenResponse`]: an in-process [`Plugin`] implementation, or an
//! executable speaking the protoc plugin protocol over stdin/stdout (see
//! the exec module). Both sides of that protocol live here: building the
//! `CodeGeneratorRequest` proto with its transitive file closure, and the
//! [`run_plugin`]/[`plugin_main`] harness for writing standalone plugin
//! binaries with this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Result};
use prost::Message;
use prost_reflect::{DescriptorPool, FileDescriptor};
use prost_types::compiler::{
    code_generator_response, CodeGeneratorRequest, CodeGeneratorResponse,
};
use prost_types::{FileDescriptorProto, FileDescriptorSet};

use crate::descriptor;

/// A version of the protoc tool, as reported to plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub suffix: String,
}

impl fmt::Display for ProtocVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.suffix.is_empty() {
            if !self.suffix.starts_with('-') {
                write!(f, "-")?;
            }
            write!(f, "{}", self.suffix)?;
        }
        Ok(())
    }
}

/// The compiler version this driver emulates.
pub fn emulated_version() -> ProtocVersion {
    ProtocVersion {
        major: 3,
        minor: 5,
        patch: 1,
        suffix: "rust".to_string(),
    }
}

/// What protoc has been asked to generate.
pub struct CodeGenRequest {
    /// Parameters for the plugin (the `ARGS` part of `--X_out=ARGS:DIR`).
    pub args: Vec<String>,
    /// The files code should be generated for, in command-line order.
    pub files: Vec<FileDescriptor>,
    /// Pool holding `files` and all of their transitive dependencies.
    pub pool: DescriptorPool,
    /// The version of protoc that invoked the plugin.
    pub protoc_version: ProtocVersion,
}

/// A code generator.
///
/// Implementations must be callable from any thread; the driver may run
/// several plugins concurrently.
pub trait Plugin: Send + Sync {
    fn generate(&self, request: &CodeGenRequest, response: &CodeGenResponse) -> Result<()>;
}

impl<F> Plugin for F
where
    F: Fn(&CodeGenRequest, &CodeGenResponse) -> Result<()> + Send + Sync,
{
    fn generate(&self, request: &CodeGenRequest, response: &CodeGenResponse) -> Result<()> {
        self(request, response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ContributionKey {
    name: String,
    insertion_point: String,
}

#[derive(Debug)]
struct Contribution {
    plugin: String,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct OutputMap {
    files: BTreeMap<ContributionKey, Vec<Contribution>>,
    supported_features: u64,
}

/// How a plugin hands generated code back to the driver.
///
/// The inner tables are mutex-guarded, so one plugin may add files and
/// snippets from multiple threads.
pub struct CodeGenResponse {
    plugin_name: String,
    output: Mutex<OutputMap>,
}

impl CodeGenResponse {
    pub(crate) fn new(plugin_name: &str) -> CodeGenResponse {
        CodeGenResponse {
            plugin_name: plugin_name.to_string(),
            output: Mutex::new(OutputMap::default()),
        }
    }

    /// Adds the full contents of a new file. Only one plugin invocation may
    /// create a given file; creating it twice is a programming error in the
    /// plugin and panics.
    pub fn add_file(&self, name: &str, content: impl Into<Vec<u8>>) {
        self.add_snippet(name, "", content);
    }

    /// Adds content to be spliced into `name` at the named insertion point.
    /// Snippets for the same point concatenate in the order they are added.
    pub fn add_insertion(&self, name: &str, insertion_point: &str, content: impl Into<Vec<u8>>) {
        self.add_snippet(name, insertion_point, content);
    }

    fn add_snippet(&self, name: &str, insertion_point: &str, content: impl Into<Vec<u8>>) {
        let key = ContributionKey {
            name: name.to_string(),
            insertion_point: insertion_point.to_string(),
        };
        let mut output = self.output.lock().unwrap();
        let entries = output.files.entry(key).or_default();
        if insertion_point.is_empty() {
            if let Some(first) = entries.first() {
                panic!(
                    "file {name} already opened for writing by plugin {}",
                    first.plugin
                );
            }
        }
        entries.push(Contribution {
            plugin: self.plugin_name.clone(),
            content: content.into(),
        });
    }

    /// Declares the `CodeGeneratorResponse` feature bits this plugin
    /// supports (proto3 optional and the like).
    pub fn set_supported_features(&self, features: u64) {
        self.output.lock().unwrap().supported_features = features;
    }

    /// Visits every contribution, insertion-point snippets included, with
    /// the chunks for each (file, point) pair concatenated. Files come out
    /// sorted by name then insertion point.
    pub(crate) fn for_each(
        &self,
        mut f: impl FnMut(&str, &str, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let output = self.output.lock().unwrap();
        for (key, entries) in &output.files {
            let content: Vec<u8> = entries
                .iter()
                .flat_map(|e| e.content.iter().copied())
                .collect();
            f(&key.name, &key.insertion_point, &content)?;
        }
        Ok(())
    }

    fn into_response_proto(self) -> CodeGeneratorResponse {
        let output = self.output.into_inner().unwrap();
        let mut response = CodeGeneratorResponse {
            supported_features: Some(output.supported_features),
            ..Default::default()
        };
        for (key, entries) in output.files {
            let content: Vec<u8> = entries.into_iter().flat_map(|e| e.content).collect();
            response.file.push(code_generator_response::File {
                name: Some(key.name),
                insertion_point: (!key.insertion_point.is_empty())
                    .then_some(key.insertion_point),
                content: Some(String::from_utf8_lossy(&content).into_owned()),
                ..Default::default()
            });
        }
        response
    }
}

/// Builds the wire-format request for a plugin subprocess: the requested
/// file names in order, and the transitive descriptor closure with
/// dependencies listed before their dependents.
pub(crate) fn to_request_proto(request: &CodeGenRequest) -> CodeGeneratorRequest {
    let mut pb = CodeGeneratorRequest::default();
    if request.protoc_version != ProtocVersion::default() {
        pb.compiler_version = Some(prost_types::compiler::Version {
            major: Some(request.protoc_version.major),
            minor: Some(request.protoc_version.minor),
            patch: Some(request.protoc_version.patch),
            suffix: (!request.protoc_version.suffix.is_empty())
                .then(|| request.protoc_version.suffix.clone()),
        });
    }
    if !request.args.is_empty() {
        pb.parameter = Some(request.args.join(","));
    }
    pb.file_to_generate = request.files.iter().map(|f| f.name().to_string()).collect();

    let mut seen = HashSet::new();
    for fd in &request.files {
        add_transitive(&request.pool, fd, &mut pb.proto_file, &mut seen);
    }
    pb
}

/// The descriptor set for the request's files, closed over imports.
pub(crate) fn to_file_descriptor_set(request: &CodeGenRequest) -> FileDescriptorSet {
    let mut set = FileDescriptorSet::default();
    let mut seen = HashSet::new();
    for fd in &request.files {
        add_transitive(&request.pool, fd, &mut set.file, &mut seen);
    }
    set
}

fn add_transitive(
    pool: &DescriptorPool,
    fd: &FileDescriptor,
    out: &mut Vec<FileDescriptorProto>,
    seen: &mut HashSet<String>,
) {
    if !seen.insert(fd.name().to_string()) {
        return;
    }
    for dep_name in &fd.file_descriptor_proto().dependency {
        if let Some(dep) = pool.get_file_by_name(dep_name) {
            add_transitive(pool, &dep, out, seen);
        }
    }
    out.push(fd.file_descriptor_proto().clone());
}

/// Strips the conventional executable prefix off a plugin name.
pub(crate) fn short_plugin_name(name: &str) -> &str {
    name.strip_prefix("protoc-gen-").unwrap_or(name)
}

type PluginRef = Arc<dyn Plugin>;

static REGISTRY: OnceLock<Mutex<BTreeMap<String, PluginRef>>> = OnceLock::new();

/// Registers an in-process plugin under the given name (without the
/// `protoc-gen-` prefix). A `--plugin` flag for the same name still takes
/// precedence; registration overrides the protoc fallback for the built-in
/// languages.
///
/// Call during program initialization. Registering the same name twice is a
/// programming error and panics.
pub fn register_plugin(lang: &str, plugin: impl Plugin + 'static) {
    let mut registry = REGISTRY
        .get_or_init(|| Mutex::new(BTreeMap::new()))
        .lock()
        .unwrap();
    if registry.contains_key(lang) {
        panic!("plugin already registered for {lang:?}");
    }
    registry.insert(lang.to_string(), Arc::new(plugin));
}

pub(crate) fn registered_plugin(lang: &str) -> Option<PluginRef> {
    REGISTRY.get()?.lock().unwrap().get(lang).cloned()
}

/// Runs `plugin` against a serialized `CodeGeneratorRequest` read from
/// `input`, writing the serialized response to `output`.
///
/// Failures in the plugin itself are reported through the response's error
/// field as `<name>: <message>`; only I/O trouble on `output` surfaces as an
/// `Err`.
pub fn run_plugin(
    name: &str,
    plugin: &dyn Plugin,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<()> {
    let name = short_plugin_name(name);
    let response = run_plugin_inner(name, plugin, input)
        .unwrap_or_else(|err| error_response(name, &err));
    output.write_all(&response.encode_to_vec())?;
    Ok(())
}

fn run_plugin_inner(
    name: &str,
    plugin: &dyn Plugin,
    input: &mut dyn Read,
) -> Result<CodeGeneratorResponse> {
    let mut request_bytes = Vec::new();
    input
        .read_to_end(&mut request_bytes)
        .map_err(|err| anyhow!("failed to read code gen request: {err}"))?;
    let pb = CodeGeneratorRequest::decode(request_bytes.as_slice())
        .map_err(|err| anyhow!("failed to read code gen request: {err}"))?;

    let mut all_files: HashMap<String, FileDescriptorProto> = HashMap::new();
    for fd in &pb.proto_file {
        all_files.entry(fd.name().to_string()).or_insert_with(|| fd.clone());
    }
    let linked = descriptor::link_all(&all_files, &pb.file_to_generate)
        .map_err(|err| anyhow!("failed to process input descriptors: {err:#}"))?;

    let request = CodeGenRequest {
        args: pb
            .parameter
            .as_deref()
            .map(|p| p.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        files: linked.files,
        pool: linked.pool,
        protoc_version: pb
            .compiler_version
            .map(|v| ProtocVersion {
                major: v.major(),
                minor: v.minor(),
                patch: v.patch(),
                suffix: v.suffix().to_string(),
            })
            .unwrap_or_default(),
    };

    let response = CodeGenResponse::new(name);
    plugin.generate(&request, &response)?;
    Ok(response.into_response_proto())
}

fn error_response(name: &str, err: &anyhow::Error) -> CodeGeneratorResponse {
    CodeGeneratorResponse {
        error: Some(format!("{name}: {err:#}")),
        ..Default::default()
    }
}

/// Entry point for standalone plugin binaries: runs the plugin over
/// stdin/stdout and exits the process.
pub fn plugin_main(plugin: impl Plugin) -> ! {
    let name = std::env::args().next().unwrap_or_default();
    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    match run_plugin(&name, &plugin, &mut stdin, &mut stdout) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}
