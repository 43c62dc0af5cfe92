//! Compilation of `.proto` sources.
//!
//! The driver does not parse proto syntax itself; protox does. This module
//! feeds it the include paths and file names and hands back the raw
//! descriptor set (always with the transitive imports, so the linker and the
//! plugin protocol see a self-contained graph).

use std::path::Path;

use anyhow::{anyhow, Result};
use prost::Message;
use prost_types::FileDescriptorSet;
use protox::Compiler;

/// Compiles the given files, returning the full descriptor set and the
/// canonical (include-path relative) names of the requested files.
pub fn compile_files(
    include_paths: &[String],
    proto_files: &[String],
    include_source_info: bool,
) -> Result<(FileDescriptorSet, Vec<String>)> {
    let includes: Vec<&str> = if include_paths.is_empty() {
        vec!["."]
    } else {
        include_paths.iter().map(String::as_str).collect()
    };

    let mut compiler = Compiler::new(&includes)?;
    compiler.include_imports(true);
    compiler.include_source_info(include_source_info);
    for file in proto_files {
        compiler.open_file(file)?;
    }

    let bytes = compiler.encode_file_descriptor_set();
    let set = FileDescriptorSet::decode(bytes.as_slice())
        .map_err(|err| anyhow!("compiler produced an invalid file descriptor set: {err}"))?;

    let resolved = proto_files
        .iter()
        .map(|f| resolve_file_name(&includes, f))
        .collect();
    Ok((set, resolved))
}

/// Maps a user-supplied path to the name it carries inside the descriptor
/// set: relative to the first include path containing it, with forward
/// slashes. Paths under no include directory are taken as already-canonical.
fn resolve_file_name(includes: &[&str], file: &str) -> String {
    for inc in includes {
        if *inc == "." {
            if let Some(rel) = file.strip_prefix("./") {
                return rel.to_string();
            }
            continue;
        }
        if let Ok(rel) = Path::new(file).strip_prefix(inc) {
            return rel.to_string_lossy().replace('\\', "/");
        }
    }
    file.to_string()
}
