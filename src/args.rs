//! Command-line parsing for the driver.
//!
//! protoc's grammar is out of reach for a derive-style parser: `--X_out`
//! flags are recognized by shape rather than by name, `@file` arguments
//! splice response files into the argument list, and every value flag
//! accepts both `--flag=value` and `--flag value`. So flags are matched by
//! hand, the way protoc itself does it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Result};

/// The protoc version the driver emulates, reported by `--version` and in
/// code generation requests.
pub const PROTOC_VERSION_EMU: &str = "3.5.1";

/// Everything a single invocation asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub include_paths: Vec<String>,
    pub encode_type: Option<String>,
    pub decode_type: Option<String>,
    pub decode_raw: bool,
    pub input_descriptors: Vec<String>,
    pub output_descriptor: Option<String>,
    pub include_imports: bool,
    pub include_source_info: bool,
    pub print_free_field_numbers: bool,
    /// Plugin key (without the `protoc-gen-` prefix) to executable path.
    pub plugin_defs: BTreeMap<String, String>,
    /// Plugin key to the raw `--X_out` value (`ARGS:OUT_DIR` or `OUT_DIR`).
    pub output: BTreeMap<String, String>,
    pub proto_files: Vec<String>,
}

enum Flow {
    Continue,
    Exit,
}

/// Parses an argument list (`argv` without the program name).
///
/// Returns `Ok(None)` when `--version` or `--help` printed to `stdout` and
/// the run should exit successfully without doing any work.
pub fn parse_args(program: &str, args: &[String], stdout: &mut dyn Write) -> Result<Option<Options>> {
    let mut opts = Options::default();
    let mut sources_seen = HashSet::new();
    match parse_into("", program, args, stdout, &mut opts, &mut sources_seen)? {
        Flow::Continue => Ok(Some(opts)),
        Flow::Exit => Ok(None),
    }
}

fn parse_into(
    source: &str,
    program: &str,
    args: &[String],
    stdout: &mut dyn Write,
    opts: &mut Options,
    sources_seen: &mut HashSet<String>,
) -> Result<Flow> {
    if !sources_seen.insert(source.to_string()) {
        bail!("cycle detected in option files: {source} references itself (possibly indirectly)");
    }

    let mut i = 0;
    while i < args.len() {
        let a = args[i].as_str();
        if a == "--" {
            opts.proto_files.extend(args[i + 1..].iter().cloned());
            break;
        }
        if a.is_empty() {
            // blank response-file line
            i += 1;
            continue;
        }
        if !a.starts_with('-') {
            opts.proto_files.push(a.to_string());
            i += 1;
            continue;
        }

        // errors are prefixed with "file:line: " when inside a response file
        let loc = if source.is_empty() {
            String::new()
        } else {
            format!("{source}:{}: ", i + 1)
        };

        let (flag, inline) = match a.split_once('=') {
            Some((f, v)) => (f, Some(v)),
            None => (a, None),
        };

        match flag {
            "-I" | "--proto_path" => {
                let value = take_value(&loc, flag, inline, args, &mut i)?;
                opts.include_paths.push(value);
            }
            "--version" => {
                no_value(&loc, flag, inline)?;
                writeln!(
                    stdout,
                    "protodrive {} (proto {})",
                    env!("CARGO_PKG_VERSION"),
                    PROTOC_VERSION_EMU
                )?;
                return Ok(Flow::Exit);
            }
            "-h" | "--help" => {
                no_value(&loc, flag, inline)?;
                print_usage(program, stdout)?;
                return Ok(Flow::Exit);
            }
            "--encode" => {
                opts.encode_type = Some(take_value(&loc, flag, inline, args, &mut i)?);
            }
            "--decode" => {
                opts.decode_type = Some(take_value(&loc, flag, inline, args, &mut i)?);
            }
            "--decode_raw" => {
                opts.decode_raw = take_bool(&loc, flag, inline)?;
            }
            "--descriptor_set_in" => {
                let value = take_value(&loc, flag, inline, args, &mut i)?;
                opts.input_descriptors.push(value);
            }
            "-o" | "--descriptor_set_out" => {
                opts.output_descriptor = Some(take_value(&loc, flag, inline, args, &mut i)?);
            }
            "--include_imports" => {
                opts.include_imports = take_bool(&loc, flag, inline)?;
            }
            "--include_source_info" => {
                opts.include_source_info = take_bool(&loc, flag, inline)?;
            }
            "--print_free_field_numbers" => {
                opts.print_free_field_numbers = take_bool(&loc, flag, inline)?;
            }
            "--plugin" => {
                let value = take_value(&loc, flag, inline, args, &mut i)?;
                let (name, location) = match value.split_once('=') {
                    Some((n, l)) => (n.to_string(), l.to_string()),
                    None => {
                        let base = Path::new(&value)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        (base, value)
                    }
                };
                let Some(key) = name.strip_prefix("protoc-gen-") else {
                    bail!("{loc}plugin name {name} is not valid: name should have 'protoc-gen-' prefix");
                };
                opts.plugin_defs.insert(key.to_string(), location);
            }
            _ => {
                if let Some(path) = a.strip_prefix('@') {
                    let contents = match fs::read_to_string(path) {
                        Ok(c) => c,
                        Err(err) => bail!("{loc}could not load option file {path}: {err}"),
                    };
                    // one argument per line, trimmed, no shell splitting
                    let lines: Vec<String> = contents.lines().map(|l| l.trim().to_string()).collect();
                    if let Flow::Exit =
                        parse_into(path, program, &lines, stdout, opts, sources_seen)?
                    {
                        return Ok(Flow::Exit);
                    }
                } else if let Some(key) = plugin_out_key(flag) {
                    let value = take_value(&loc, flag, inline, args, &mut i)?;
                    opts.output.insert(key.to_string(), value);
                } else {
                    bail!("{loc}unrecognized option: {flag}");
                }
            }
        }
        i += 1;
    }
    Ok(Flow::Continue)
}

/// Matches `--<PLUGIN>_out` by shape and returns the plugin key.
fn plugin_out_key(flag: &str) -> Option<&str> {
    if flag.len() > 6 {
        flag.strip_prefix("--")?.strip_suffix("_out")
    } else {
        None
    }
}

fn take_value(
    loc: &str,
    flag: &str,
    inline: Option<&str>,
    args: &[String],
    i: &mut usize,
) -> Result<String> {
    if let Some(v) = inline {
        return Ok(v.to_string());
    }
    if *i + 1 < args.len() {
        *i += 1;
        return Ok(args[*i].clone());
    }
    bail!("{loc}Missing value for flag: {flag}");
}

fn take_bool(loc: &str, flag: &str, inline: Option<&str>) -> Result<bool> {
    match inline {
        None => Ok(true),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => bail!("{loc}value for option {flag} must be 'true' or 'false'"),
        },
    }
}

fn no_value(loc: &str, flag: &str, inline: Option<&str>) -> Result<()> {
    if inline.is_some() {
        bail!("{loc}{flag} does not take a parameter");
    }
    Ok(())
}

fn print_usage(program: &str, stdout: &mut dyn Write) -> Result<()> {
    write!(
        stdout,
        r#"Usage: {program} [OPTION] PROTO_FILES
Parse PROTO_FILES and generate output based on the options given:
  -IPATH, --proto_path=PATH   Specify the directory in which to search for
                              imports.  May be specified multiple times;
                              directories will be searched in order.  If not
                              given, the current working directory is used.
  --version                   Show version info and exit.
  -h, --help                  Show this text and exit.
  --encode=MESSAGE_TYPE       Read a text-format message of the given type
                              from standard input and write it in binary
                              to standard output.  The message type must
                              be defined in PROTO_FILES or their imports.
  --decode=MESSAGE_TYPE       Read a binary message of the given type from
                              standard input and write it in text format
                              to standard output.  The message type must
                              be defined in PROTO_FILES or their imports.
  --decode_raw                Read an arbitrary protocol message from
                              standard input and write the raw tag/value
                              pairs in text format to standard output.  No
                              PROTO_FILES should be given when using this
                              flag.
  --descriptor_set_in=FILES   Specifies a delimited list of FILES
                              each containing a FileDescriptorSet (a
                              protocol buffer defined in descriptor.proto).
                              The FileDescriptor for each of the PROTO_FILES
                              provided will be loaded from these
                              FileDescriptorSets. If a FileDescriptor
                              appears multiple times, the first occurrence
                              will be used.
  -oFILE,                     Writes a FileDescriptorSet (a protocol buffer,
    --descriptor_set_out=FILE defined in descriptor.proto) containing all of
                              the input files to FILE.
  --include_imports           When using --descriptor_set_out, also include
                              all dependencies of the input files in the
                              set, so that the set is self-contained.
  --include_source_info       When using --descriptor_set_out, do not strip
                              SourceCodeInfo from the FileDescriptorProto.
                              This results in vastly larger descriptors that
                              include information about the original
                              location of each decl in the source file as
                              well as surrounding comments.
  --print_free_field_numbers  Print the free field numbers of the messages
                              defined in the given proto files. Groups share
                              the same field number space with the parent
                              message. Extension ranges are counted as
                              occupied fields numbers.
  --plugin=EXECUTABLE         Specifies a plugin executable to use.
                              Normally, protoc searches the PATH for
                              plugins, but you may specify additional
                              executables not in the path using this flag.
                              Additionally, EXECUTABLE may be of the form
                              NAME=PATH, in which case the given plugin name
                              is mapped to the given executable even if
                              the executable's own name differs.
  --<PLUGIN>_out=OUT_DIR      Invokes the plugin named <PLUGIN>, instructing
                              it to generate source code into the given
                              OUT_DIR. The given OUT_DIR can be in the
                              extended form ARGS:OUT_DIR, in which case ARGS
                              are extra arguments/flags to pass to the
                              plugin.
                              The plugin binary is located by searching for
                              for any plugin locations configured with
                              --plugin flags. If no such flags were provided
                              for the named plugin, then an executable named
                              'protoc-gen-<PLUGIN>' is used.
                              If the named plugin is 'cpp', 'csharp', 'java',
                              'javanano', 'js', 'objc', 'php', 'python', or
                              'ruby' then the protoc binary is used to
                              generate the output code (instead of some
                              plugin).
  @<filename>                 Read options and filenames from file. If a
                              relative file path is specified, the file
                              will be searched in the working directory.
                              The --proto_path option will not affect how
                              this argument file is searched. Content of
                              the file will be expanded in the position of
                              @<filename> as in the argument list. Note
                              that shell expansion is not applied to the
                              content of the file (i.e., you cannot use
                              quotes, wildcards, escapes, commands, etc.).
                              Each line corresponds to a single argument,
                              even if it contains spaces.
"#
    )?;
    Ok(())
}
