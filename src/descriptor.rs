//! Loading, linking, and saving descriptor sets.
//!
//! Loading reverses what `--descriptor_set_out` produces: raw
//! `FileDescriptorProto` entries are gathered from every input set (first
//! occurrence of a name wins), then each requested file is linked
//! depth-first, dependencies before dependents, into a shared
//! [`DescriptorPool`]. Saving walks the linked graph back out in
//! topological order.

use std::collections::{HashMap, HashSet};
use std::fs;

use anyhow::{anyhow, bail, Context, Result};
use prost::Message;
use prost_reflect::{DescriptorPool, FileDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};

/// A linked descriptor graph: the pool owning every reachable file plus the
/// requested files in command-line order.
#[derive(Debug)]
pub struct LinkedFiles {
    pub pool: DescriptorPool,
    pub files: Vec<FileDescriptor>,
}

/// Reads the given descriptor-set files and links the requested proto files
/// out of them.
pub fn load_descriptor_sets(
    descriptor_files: &[String],
    proto_files: &[String],
) -> Result<LinkedFiles> {
    let mut all_files: HashMap<String, FileDescriptorProto> = HashMap::new();
    for file_name in descriptor_files {
        let bytes = fs::read(file_name)
            .with_context(|| format!("failed to read descriptor set file {file_name}"))?;
        let set = FileDescriptorSet::decode(bytes.as_slice()).map_err(|err| {
            anyhow!("file \"{file_name}\" is not a valid file descriptor set: {err}")
        })?;
        for fd in set.file {
            // keep only the first file found for a given name
            all_files.entry(fd.name().to_string()).or_insert(fd);
        }
    }
    link_all(&all_files, proto_files)
}

/// Links each requested file against the raw descriptor map, memoizing
/// shared dependencies in one pool.
pub fn link_all(
    all_files: &HashMap<String, FileDescriptorProto>,
    proto_files: &[String],
) -> Result<LinkedFiles> {
    let mut pool = DescriptorPool::new();
    let mut linked = HashMap::new();
    let mut files = Vec::with_capacity(proto_files.len());
    for name in proto_files {
        if !all_files.contains_key(name) {
            bail!("file not found: \"{name}\"");
        }
        let fd = link_file(name, all_files, &mut pool, &mut linked, &mut Vec::new())
            .with_context(|| format!("could not load \"{name}\""))?;
        files.push(fd);
    }
    Ok(LinkedFiles { pool, files })
}

fn link_file(
    name: &str,
    all_files: &HashMap<String, FileDescriptorProto>,
    pool: &mut DescriptorPool,
    linked: &mut HashMap<String, FileDescriptor>,
    seen: &mut Vec<String>,
) -> Result<FileDescriptor> {
    if seen.iter().any(|s| s == name) {
        seen.push(name.to_string());
        bail!("cyclic imports: {}", seen.join(" -> "));
    }
    if let Some(fd) = linked.get(name) {
        return Ok(fd.clone());
    }
    let Some(proto) = all_files.get(name) else {
        bail!("could not find dependency \"{name}\"");
    };

    seen.push(name.to_string());
    for dep in &proto.dependency {
        link_file(dep, all_files, pool, linked, seen)?;
    }
    seen.pop();

    pool.add_file_descriptor_proto(proto.clone())
        .map_err(|err| anyhow!("{err}"))?;
    let fd = pool
        .get_file_by_name(name)
        .ok_or_else(|| anyhow!("linked file \"{name}\" missing from descriptor pool"))?;
    linked.insert(name.to_string(), fd.clone());
    Ok(fd)
}

/// Writes a `FileDescriptorSet` for the given files to `dest`, dependencies
/// before dependents.
///
/// Without `include_imports` only the requested files themselves are
/// emitted; dependencies outside that set are dropped. Without
/// `include_source_info` the SourceCodeInfo is stripped from each emitted
/// entry. Stripping happens on clones, so the in-memory graph that earlier
/// code generation saw is untouched.
pub fn save_descriptor(
    dest: &str,
    pool: &DescriptorPool,
    files: &[FileDescriptor],
    include_imports: bool,
    include_source_info: bool,
) -> Result<()> {
    let requested: Option<HashSet<String>> = if include_imports {
        None
    } else {
        Some(files.iter().map(|f| f.name().to_string()).collect())
    };

    let mut set = FileDescriptorSet::default();
    let mut seen = HashSet::new();
    for fd in files {
        append_file(&mut set, pool, fd, requested.as_ref(), include_source_info, &mut seen);
    }

    fs::write(dest, set.encode_to_vec())
        .with_context(|| format!("failed to write descriptor set to {dest}"))?;
    Ok(())
}

fn append_file(
    set: &mut FileDescriptorSet,
    pool: &DescriptorPool,
    fd: &FileDescriptor,
    requested: Option<&HashSet<String>>,
    include_source_info: bool,
    seen: &mut HashSet<String>,
) {
    if !seen.insert(fd.name().to_string()) {
        return;
    }

    for dep_name in &fd.file_descriptor_proto().dependency {
        if let Some(requested) = requested {
            if !requested.contains(dep_name) {
                continue;
            }
        }
        if let Some(dep) = pool.get_file_by_name(dep_name) {
            append_file(set, pool, &dep, requested, include_source_info, seen);
        }
    }

    let mut proto = fd.file_descriptor_proto().clone();
    if !include_source_info {
        proto.source_code_info = None;
    }
    set.file.push(proto);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, deps: &[&str]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.to_string()),
            dependency: deps.iter().map(|d| d.to_string()).collect(),
            syntax: Some("proto3".to_string()),
            ..Default::default()
        }
    }

    fn file_map(files: Vec<FileDescriptorProto>) -> HashMap<String, FileDescriptorProto> {
        files.into_iter().map(|f| (f.name().to_string(), f)).collect()
    }

    #[test]
    fn links_dependencies_first() {
        let all = file_map(vec![file("a.proto", &["b.proto"]), file("b.proto", &[])]);
        let linked = link_all(&all, &["a.proto".to_string()]).unwrap();
        assert_eq!(linked.files.len(), 1);
        assert_eq!(linked.files[0].name(), "a.proto");
        assert!(linked.pool.get_file_by_name("b.proto").is_some());
    }

    #[test]
    fn missing_file_is_reported() {
        let all = file_map(vec![]);
        let err = link_all(&all, &["nope.proto".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "file not found: \"nope.proto\"");
    }

    #[test]
    fn missing_dependency_is_reported() {
        let all = file_map(vec![file("a.proto", &["gone.proto"])]);
        let err = link_all(&all, &["a.proto".to_string()]).unwrap_err();
        assert!(format!("{err:#}").contains("could not find dependency \"gone.proto\""));
    }

    #[test]
    fn cyclic_imports_are_reported_with_the_chain() {
        let all = file_map(vec![
            file("a.proto", &["b.proto"]),
            file("b.proto", &["a.proto"]),
        ]);
        let err = link_all(&all, &["a.proto".to_string()]).unwrap_err();
        assert!(format!("{err:#}").contains("cyclic imports: a.proto -> b.proto -> a.proto"));
    }

    #[test]
    fn first_occurrence_wins_on_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = file("dup.proto", &[]);
        first.package = Some("first".to_string());
        let mut second = file("dup.proto", &[]);
        second.package = Some("second".to_string());

        let set_a = FileDescriptorSet { file: vec![first] };
        let set_b = FileDescriptorSet { file: vec![second] };
        let path_a = dir.path().join("a.bin");
        let path_b = dir.path().join("b.bin");
        fs::write(&path_a, set_a.encode_to_vec()).unwrap();
        fs::write(&path_b, set_b.encode_to_vec()).unwrap();

        let linked = load_descriptor_sets(
            &[path_a.to_string_lossy().into_owned(), path_b.to_string_lossy().into_owned()],
            &["dup.proto".to_string()],
        )
        .unwrap();
        assert_eq!(linked.files[0].package_name(), "first");
    }

    #[test]
    fn saved_set_is_topologically_sorted() {
        let all = file_map(vec![
            file("top.proto", &["mid.proto"]),
            file("mid.proto", &["leaf.proto"]),
            file("leaf.proto", &[]),
        ]);
        let linked = link_all(&all, &["top.proto".to_string()]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        save_descriptor(
            &dest.to_string_lossy(),
            &linked.pool,
            &linked.files,
            true,
            false,
        )
        .unwrap();

        let set = FileDescriptorSet::decode(fs::read(&dest).unwrap().as_slice()).unwrap();
        let names: Vec<&str> = set.file.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["leaf.proto", "mid.proto", "top.proto"]);
    }

    #[test]
    fn imports_are_pruned_unless_requested() {
        let all = file_map(vec![file("a.proto", &["b.proto"]), file("b.proto", &[])]);
        let linked = link_all(&all, &["a.proto".to_string()]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        save_descriptor(
            &dest.to_string_lossy(),
            &linked.pool,
            &linked.files,
            false,
            false,
        )
        .unwrap();

        let set = FileDescriptorSet::decode(fs::read(&dest).unwrap().as_slice()).unwrap();
        let names: Vec<&str> = set.file.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["a.proto"]);
    }
}
