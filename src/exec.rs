//! Plugin invocation: subprocesses, in-process plugins, and the protoc
//! fallback.
//!
//! For each `--X_out` the handler is resolved in priority order: a path
//! configured with `--plugin`, an in-process registration, the real protoc
//! binary for its built-in languages, and finally `protoc-gen-<X>` on the
//! PATH.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use prost::Message;
use prost_types::compiler::CodeGeneratorResponse;
use tracing::debug;

use crate::plugin::{self, CodeGenRequest, CodeGenResponse};

/// Languages the stock protoc binary can generate itself.
const PROTOC_LANGS: &[&str] = &[
    "cpp", "csharp", "java", "javanano", "js", "objc", "php", "python", "ruby",
];

/// Runs the handler for one output language, filling `response`.
pub fn execute_plugin(
    request: &CodeGenRequest,
    response: &CodeGenResponse,
    plugin_path: Option<&str>,
    lang: &str,
) -> Result<()> {
    if let Some(path) = plugin_path {
        return exec_subprocess(path, request, response);
    }
    if let Some(plugin) = plugin::registered_plugin(lang) {
        debug!(lang, "running in-process plugin");
        return plugin
            .generate(request, response)
            .map_err(|err| anyhow!("{lang}: {err:#}"));
    }
    if PROTOC_LANGS.contains(&lang) {
        return drive_protoc_as_plugin(request, response, lang);
    }
    exec_subprocess(&format!("protoc-gen-{lang}"), request, response)
}

/// Spawns a plugin binary, feeding the serialized request to its stdin and
/// decoding the response from its stdout. Stderr is inherited.
fn exec_subprocess(path: &str, request: &CodeGenRequest, response: &CodeGenResponse) -> Result<()> {
    if request.files.is_empty() {
        bail!("nothing to generate: no files given");
    }

    let request_bytes = plugin::to_request_proto(request).encode_to_vec();
    let base = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let name = plugin::short_plugin_name(&base).to_string();
    debug!(plugin = %name, path, "invoking plugin subprocess");

    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| anyhow!("executing plugin \"{name}\" failed: {err}"))?;

    // feed stdin from its own thread so a plugin that streams output before
    // draining its input cannot deadlock against us
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("executing plugin \"{name}\" failed: no stdin pipe"))?;
    let writer = thread::spawn(move || {
        let _ = stdin.write_all(&request_bytes);
    });

    let output = child
        .wait_with_output()
        .map_err(|err| anyhow!("executing plugin \"{name}\" failed: {err}"))?;
    let _ = writer.join();

    if !output.status.success() {
        bail!("executing plugin \"{name}\" failed: {}", output.status);
    }

    let pb = CodeGeneratorResponse::decode(output.stdout.as_slice())
        .map_err(|err| anyhow!("failed to unmarshal code gen response: {err}"))?;
    apply_response_proto(&pb, &name, response)
}

fn apply_response_proto(
    pb: &CodeGeneratorResponse,
    plugin_name: &str,
    response: &CodeGenResponse,
) -> Result<()> {
    if let Some(err) = pb.error.as_deref().filter(|e| !e.is_empty()) {
        bail!("{plugin_name}: {err}");
    }
    for file in &pb.file {
        if file.insertion_point().is_empty() {
            response.add_file(file.name(), file.content().as_bytes());
        } else {
            response.add_insertion(file.name(), file.insertion_point(), file.content().as_bytes());
        }
    }
    Ok(())
}

/// Uses the real protoc binary as the generator for its built-in languages:
/// the descriptor set goes to a scratch directory, protoc writes into a
/// scratch output directory, and the resulting tree is folded into the
/// response.
fn drive_protoc_as_plugin(
    request: &CodeGenRequest,
    response: &CodeGenResponse,
    lang: &str,
) -> Result<()> {
    for arg in &request.args {
        if arg.starts_with('-') {
            bail!("option \"{arg}\" for {lang} output does not start with '-'");
        }
    }

    let tmp_dir = tempfile::Builder::new()
        .prefix("protodrive")
        .tempdir()
        .context("failed to create scratch directory")?;
    let out_dir = tmp_dir.path().join("output");
    fs::create_dir(&out_dir).context("failed to create scratch output directory")?;

    let desc_file = tmp_dir.path().join("descriptors");
    let set = plugin::to_file_descriptor_set(request);
    fs::write(&desc_file, set.encode_to_vec())
        .context("failed to write scratch descriptor set")?;

    let mut args = vec![
        format!("--descriptor_set_in={}", desc_file.display()),
        format!("--{lang}_out={}", out_dir.display()),
    ];
    for arg in &request.args {
        if arg.is_empty() {
            bail!("request argument is empty");
        }
        args.push(arg.clone());
    }
    for fd in &request.files {
        if fd.name().is_empty() {
            bail!("request filename empty");
        }
        args.push(fd.name().to_string());
    }

    debug!(lang, ?args, "driving protoc as a plugin");
    let output = Command::new("protoc")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| anyhow!("executing plugin \"protoc\" failed: {err}"))?;
    if !output.status.success() {
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        bail!(
            "protoc failed to produce output for {lang}: {}\n{}",
            output.status,
            String::from_utf8_lossy(&combined)
        );
    }

    collect_generated_files(&out_dir, &out_dir, response)?;

    // surface cleanup trouble instead of leaking scratch state silently
    tmp_dir
        .close()
        .context("failed to remove scratch directory")?;
    Ok(())
}

fn collect_generated_files(root: &Path, dir: &Path, response: &CodeGenResponse) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_generated_files(root, &path, response)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root)?;
            let content = fs::read(&path)?;
            response.add_file(&rel.to_string_lossy().replace('\\', "/"), content);
        }
    }
    Ok(())
}
