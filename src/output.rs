//! Assembling plugin outputs into files and archives.
//!
//! Every plugin contribution lands in one table keyed by output file. A
//! contribution with no insertion point creates the file; contributions with
//! a point are spliced into the creator's content wherever it carries the
//! matching `@@protoc_insertion_point(NAME)` marker. Assembled contents are
//! then written out as plain files, or gathered into ZIP or JAR archives
//! when the destination path says so.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::plugin::CodeGenResponse;

const INSERTION_POINT_MARKER: &[u8] = b"@@protoc_insertion_point(";

// same manifest protoc produces, with our own identifier
const JAR_MANIFEST: &[u8] = b"Manifest-Version: 1.0\nCreated-By: 1.6.0 (protodrive)\n\n";

/// How a destination stores the generated files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputKind {
    Dir,
    Zip,
    Jar,
}

/// Where one `--X_out` sends its files: a directory, or an archive the
/// files go inside.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputLocation {
    pub path: PathBuf,
    pub kind: OutputKind,
}

/// One generated file: a location plus a relative name within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputFile {
    pub location: OutputLocation,
    pub name: String,
}

impl fmt::Display for OutputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location.kind {
            OutputKind::Dir => write!(f, "{}", self.location.path.join(&self.name).display()),
            // a file *inside* an archive
            _ => write!(f, "{}:{}", self.location.path.display(), self.name),
        }
    }
}

/// Splits each `--X_out` value into plugin arguments and a destination,
/// picking the destination kind from the file extension and checking that
/// the target directory (or the archive's parent) already exists.
pub fn compute_output_locations(
    outputs: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, OutputLocation>, BTreeMap<String, String>)> {
    let mut locations = BTreeMap::new();
    let mut args = BTreeMap::new();
    for (lang, value) in outputs {
        let (arg, dest) = match value.split_once(':') {
            Some((a, d)) => (a, d),
            None => ("", value.as_str()),
        };
        if dest.is_empty() {
            bail!("{lang} has empty output path");
        }

        let kind = match Path::new(dest)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("jar") => OutputKind::Jar,
            Some("zip") => OutputKind::Zip,
            _ => OutputKind::Dir,
        };

        let abs = std::path::absolute(dest).with_context(|| {
            format!("failed to compute absolute path for {lang} output {dest}")
        })?;

        // archives only need their parent directory to exist
        let check = if kind == OutputKind::Dir {
            dest.to_string()
        } else {
            match Path::new(dest).parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
                _ => ".".to_string(),
            }
        };
        match fs::metadata(&check) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => bail!("output for {lang} is not a directory: {check}"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!("{check}: No such file or directory")
            }
            Err(err) => return Err(err.into()),
        }

        locations.insert(lang.clone(), OutputLocation { path: abs, kind });
        args.insert(lang.clone(), arg.to_string());
    }
    Ok((locations, args))
}

#[derive(Default)]
struct FileOutput {
    contents: Option<Vec<u8>>,
    created_by: String,
    insertions: BTreeMap<String, Vec<(String, Vec<u8>)>>,
}

/// Merges per-plugin responses into final file contents: conflicts between
/// creators are fatal, insertions are spliced into their targets, and any
/// insertion left without a home is fatal too.
///
/// Responses are visited in sorted key order, so insertion order across
/// plugins is stable.
pub fn assemble_outputs(
    responses: &BTreeMap<String, CodeGenResponse>,
    locations: &BTreeMap<String, OutputLocation>,
) -> Result<BTreeMap<OutputFile, Vec<u8>>> {
    let mut results: BTreeMap<OutputFile, FileOutput> = BTreeMap::new();
    for (lang, response) in responses {
        let location = locations
            .get(lang)
            .ok_or_else(|| anyhow!("no output location for {lang}"))?;
        response.for_each(|name, insertion_point, data| {
            let file = OutputFile {
                location: location.clone(),
                name: name.to_string(),
            };
            let output = results.entry(file.clone()).or_default();
            if insertion_point.is_empty() {
                if !output.created_by.is_empty() {
                    bail!(
                        "conflict: both {} and {} tried to create file {}",
                        output.created_by,
                        lang,
                        file
                    );
                }
                output.contents = Some(data.to_vec());
                output.created_by = lang.clone();
            } else {
                output
                    .insertions
                    .entry(insertion_point.to_string())
                    .or_default()
                    .push((lang.clone(), data.to_vec()));
            }
            Ok(())
        })?;
    }

    let mut assembled = BTreeMap::new();
    for (file, output) in results {
        let Some(contents) = output.contents else {
            // insertions into a file nobody created
            return Err(missing_insertions_error(&file, &output.insertions));
        };
        let contents = if output.insertions.is_empty() {
            contents
        } else {
            apply_insertions(&file, contents, output.insertions)?
        };
        assembled.insert(file, contents);
    }
    Ok(assembled)
}

/// Splices insertion contents into `data` at its named markers.
///
/// A marker on a line of the form `/* @@protoc_insertion_point(NAME) */`
/// takes insertions directly before the `/*`, space-separated. Any other
/// marker takes insertions before its whole line, each inserted line
/// prefixed with the marker line's leading whitespace. Markers with no
/// pending insertion pass through untouched.
fn apply_insertions(
    file: &OutputFile,
    data: Vec<u8>,
    mut insertions: BTreeMap<String, Vec<(String, Vec<u8>)>>,
) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len());
    let mut data = data.as_slice();

    loop {
        let Some(pos) = find_subslice(data, INSERTION_POINT_MARKER) else {
            break;
        };
        let name_start = pos + INSERTION_POINT_MARKER.len();
        let Some(close) = data[name_start..].iter().position(|&b| b == b')') else {
            // malformed marker, emit the rest untouched
            break;
        };
        let close = name_start + close;

        let pending = std::str::from_utf8(&data[name_start..close])
            .ok()
            .and_then(|point| insertions.remove(point));
        let Some(pending) = pending else {
            // not a point any plugin targets; flow it through
            result.extend_from_slice(&data[..close + 1]);
            data = &data[close + 1..];
            continue;
        };

        let line_start = data[..pos]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        let line = &data[line_start..pos];
        let indent = leading_whitespace(line);
        let after_indent = &line[indent.len()..];

        let (insert_at, sep, indent): (usize, u8, &[u8]) = if after_indent.len() >= 2
            && after_indent[0] == b'/'
            && after_indent[1] == b'*'
            && is_blank(&after_indent[2..])
        {
            // block-comment marker: insert right before the "/*", one space apart
            (line_start + indent.len(), b' ', &[])
        } else {
            (line_start, b'\n', indent)
        };

        result.extend_from_slice(&data[..insert_at]);
        for (_, content) in &pending {
            if indent.is_empty() {
                result.extend_from_slice(content);
            } else {
                for piece in content.split_inclusive(|&b| b == b'\n') {
                    result.extend_from_slice(indent);
                    result.extend_from_slice(piece);
                }
            }
            if result.last() != Some(&sep) {
                result.push(sep);
            }
        }
        result.extend_from_slice(&data[insert_at..close + 1]);
        data = &data[close + 1..];
    }

    if !insertions.is_empty() {
        return Err(missing_insertions_error(file, &insertions));
    }

    result.extend_from_slice(data);
    Ok(result)
}

fn missing_insertions_error(
    file: &OutputFile,
    insertions: &BTreeMap<String, Vec<(String, Vec<u8>)>>,
) -> anyhow::Error {
    let mut points_by_plugin: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (point, contents) in insertions {
        for (plugin, _) in contents {
            points_by_plugin
                .entry(plugin.as_str())
                .or_default()
                .insert(point.as_str());
        }
    }
    let wants: Vec<String> = points_by_plugin
        .into_iter()
        .map(|(plugin, points)| {
            let points: Vec<&str> = points.into_iter().collect();
            format!("\"{plugin}\" wants to insert into {}", points.join(","))
        })
        .collect();
    anyhow!("missing insertion point(s) in \"{file}\": {}", wants.join("; "))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn leading_whitespace(line: &[u8]) -> &[u8] {
    match std::str::from_utf8(line) {
        Ok(s) => {
            let trimmed = s.trim_start();
            &line[..s.len() - trimmed.len()]
        }
        Err(_) => {
            let n = line.iter().take_while(|b| b.is_ascii_whitespace()).count();
            &line[..n]
        }
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim().is_empty(),
        Err(_) => bytes.iter().all(u8::is_ascii_whitespace),
    }
}

/// Writes assembled contents: plain files straight to their directories,
/// archive members gathered per archive and emitted in one pass.
pub fn write_outputs(results: BTreeMap<OutputFile, Vec<u8>>) -> Result<()> {
    let mut archives: BTreeMap<OutputLocation, BTreeMap<String, Vec<u8>>> = BTreeMap::new();
    for (file, data) in results {
        if file.location.kind == OutputKind::Dir {
            let path = file.location.path.join(&file.name);
            write_file_result(&path, &data)?;
        } else {
            archives.entry(file.location).or_default().insert(file.name, data);
        }
    }
    for (location, files) in archives {
        write_archive_result(&location, &files)?;
    }
    Ok(())
}

fn write_file_result(path: &Path, data: &[u8]) -> Result<()> {
    // the output root was checked up front, but generated names may carry
    // subdirectories that do not exist yet
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    debug!(path = %path.display(), bytes = data.len(), "writing generated file");
    fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}

fn write_archive_result(
    location: &OutputLocation,
    files: &BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    let out = File::create(&location.path)
        .with_context(|| format!("failed to create {}", location.path.display()))?;
    let mut archive = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    if location.kind == OutputKind::Jar {
        archive.start_file("META-INF/MANIFEST.MF", options)?;
        archive.write_all(JAR_MANIFEST)?;
    }

    // BTreeMap iteration gives the entries in lexicographic name order
    for (name, data) in files {
        archive.start_file(name.as_str(), options)?;
        archive.write_all(data)?;
    }

    archive
        .finish()
        .with_context(|| format!("failed to finish {}", location.path.display()))?;
    Ok(())
}
