//! Top-level command dispatch.
//!
//! Exactly one of the operating modes runs per invocation: encode, decode,
//! raw decode, free-field-number reporting, or code generation. Code
//! generation and descriptor output may share an invocation; generation
//! runs first since plugins want the SourceCodeInfo that a descriptor save
//! may strip.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::thread;

use anyhow::{anyhow, bail, Result};
use prost_types::FileDescriptorProto;
use tracing::debug;

use crate::args::{self, Options};
use crate::codec;
use crate::compile;
use crate::descriptor::{self, LinkedFiles};
use crate::exec;
use crate::free_fields;
use crate::output;
use crate::plugin::{self, CodeGenRequest, CodeGenResponse};

/// Runs the driver and returns the process exit code. Errors print to
/// `stderr`, one logical message per line.
pub fn run(
    argv: &[String],
    stdin: &mut dyn Read,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> i32 {
    match run_inner(argv, stdin, stdout) {
        Ok(()) => 0,
        Err(err) => {
            let mut message = format!("{err:#}");
            if message.is_empty() {
                message = "unexpected error".to_string();
            }
            let _ = writeln!(stderr, "{message}");
            1
        }
    }
}

fn run_inner(argv: &[String], stdin: &mut dyn Read, stdout: &mut dyn Write) -> Result<()> {
    let program = argv.first().map(String::as_str).unwrap_or("protodrive");
    let flags = argv.get(1..).unwrap_or_default();
    let Some(opts) = args::parse_args(program, flags, stdout)? else {
        // --version or --help already printed
        return Ok(());
    };

    if !opts.input_descriptors.is_empty() && !opts.include_paths.is_empty() {
        bail!("Only one of --descriptor_set_in and --proto_path can be specified.");
    }
    if opts.proto_files.is_empty() && !opts.decode_raw {
        bail!("Missing input file.");
    }
    if !opts.proto_files.is_empty() && opts.decode_raw {
        bail!("When using --decode_raw, no input files should be given.");
    }

    let linked = load_inputs(&opts)?;

    let doing_code_gen = !opts.output.is_empty() || opts.output_descriptor.is_some();
    if doing_code_gen && opts.encode_type.is_some() {
        bail!("Cannot use --encode and generate code or descriptors at the same time.");
    }
    if doing_code_gen && (opts.decode_type.is_some() || opts.decode_raw) {
        bail!("Cannot use --decode and generate code or descriptors at the same time.");
    }
    if opts.encode_type.is_some() && (opts.decode_type.is_some() || opts.decode_raw) {
        bail!("Only one of --encode and --decode can be specified.");
    }

    if let Some(type_name) = &opts.encode_type {
        let linked = expect_descriptors(&linked)?;
        codec::encode_message(&linked.pool, type_name, stdin, stdout)
    } else if let Some(type_name) = &opts.decode_type {
        let linked = expect_descriptors(&linked)?;
        codec::decode_message(&linked.pool, type_name, stdin, stdout)
    } else if opts.decode_raw {
        codec::decode_raw(stdin, stdout)
    } else if opts.print_free_field_numbers {
        let linked = expect_descriptors(&linked)?;
        free_fields::print_free_field_numbers(&linked.files, stdout)
    } else {
        if !doing_code_gen {
            bail!("Missing output directives.");
        }
        let linked = expect_descriptors(&linked)?;
        if !opts.output.is_empty() {
            run_code_gen(&opts.output, linked, &opts.plugin_defs)?;
        }
        if let Some(dest) = &opts.output_descriptor {
            descriptor::save_descriptor(
                dest,
                &linked.pool,
                &linked.files,
                opts.include_imports,
                opts.include_source_info,
            )?;
        }
        Ok(())
    }
}

fn load_inputs(opts: &Options) -> Result<Option<LinkedFiles>> {
    if opts.proto_files.is_empty() {
        return Ok(None);
    }
    if !opts.input_descriptors.is_empty() {
        return Ok(Some(descriptor::load_descriptor_sets(
            &opts.input_descriptors,
            &opts.proto_files,
        )?));
    }

    // plugins expect SourceCodeInfo to generate comments, the builtin protoc
    // ones included, so codegen forces it on for the parse
    let include_source_info = opts.include_source_info || !opts.output.is_empty();
    let (set, resolved) =
        compile::compile_files(&opts.include_paths, &opts.proto_files, include_source_info)?;
    let mut all_files: HashMap<String, FileDescriptorProto> = HashMap::new();
    for fd in set.file {
        all_files.entry(fd.name().to_string()).or_insert(fd);
    }
    Ok(Some(descriptor::link_all(&all_files, &resolved)?))
}

fn expect_descriptors(linked: &Option<LinkedFiles>) -> Result<&LinkedFiles> {
    linked.as_ref().ok_or_else(|| anyhow!("Missing input file."))
}

fn run_code_gen(
    outputs: &BTreeMap<String, String>,
    linked: &LinkedFiles,
    plugin_defs: &BTreeMap<String, String>,
) -> Result<()> {
    let (locations, raw_args) = output::compute_output_locations(outputs)?;

    let responses: BTreeMap<String, CodeGenResponse> = locations
        .keys()
        .map(|lang| (lang.clone(), CodeGenResponse::new(lang)))
        .collect();

    debug!(plugins = responses.len(), "running code generation");
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = responses
            .iter()
            .map(|(lang, response)| {
                let arg = raw_args.get(lang).cloned().unwrap_or_default();
                let request = CodeGenRequest {
                    args: if arg.is_empty() {
                        Vec::new()
                    } else {
                        arg.split(',').map(str::to_string).collect()
                    },
                    files: linked.files.clone(),
                    pool: linked.pool.clone(),
                    protoc_version: plugin::emulated_version(),
                };
                let plugin_path = plugin_defs.get(lang).cloned();
                scope.spawn(move || {
                    exec::execute_plugin(&request, response, plugin_path.as_deref(), lang)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                // a panicking plugin is a programming error; keep the panic
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    });
    for result in results {
        result?;
    }

    let assembled = output::assemble_outputs(&responses, &locations)?;
    output::write_outputs(assembled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run_driver(args: &[&str], stdin: &[u8]) -> (i32, Vec<u8>, Vec<u8>) {
        let mut argv = vec!["protodrive".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        let mut input = stdin;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = run(&argv, &mut input, &mut stdout, &mut stderr);
        (code, stdout, stderr)
    }

    fn stderr_line(stderr: &[u8]) -> String {
        String::from_utf8(stderr.to_vec()).unwrap().trim_end().to_string()
    }

    #[test]
    fn missing_input_file_is_fatal() {
        let (code, _, stderr) = run_driver(&[], b"");
        assert_eq!(code, 1);
        assert_eq!(stderr_line(&stderr), "Missing input file.");
    }

    #[test]
    fn decode_raw_refuses_proto_files() {
        let (code, _, stderr) = run_driver(&["--decode_raw", "a.proto"], b"");
        assert_eq!(code, 1);
        assert_eq!(
            stderr_line(&stderr),
            "When using --decode_raw, no input files should be given."
        );
    }

    #[test]
    fn descriptor_set_in_and_proto_path_are_exclusive() {
        let (code, _, stderr) = run_driver(
            &["--descriptor_set_in=x.bin", "-I", "dir", "a.proto"],
            b"",
        );
        assert_eq!(code, 1);
        assert_eq!(
            stderr_line(&stderr),
            "Only one of --descriptor_set_in and --proto_path can be specified."
        );
    }

    #[test]
    fn encode_and_decode_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.proto"), "syntax = \"proto3\";\nmessage M {}\n").unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let (code, _, stderr) = run_driver(
            &["-I", &include, "--encode=M", "--decode=M", "a.proto"],
            b"",
        );
        assert_eq!(code, 1);
        assert_eq!(
            stderr_line(&stderr),
            "Only one of --encode and --decode can be specified."
        );
    }

    #[test]
    fn missing_output_directives_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.proto"), "syntax = \"proto3\";\nmessage M {}\n").unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let (code, _, stderr) = run_driver(&["-I", &include, "a.proto"], b"");
        assert_eq!(code, 1);
        assert_eq!(stderr_line(&stderr), "Missing output directives.");
    }

    #[test]
    fn version_exits_zero() {
        let (code, stdout, _) = run_driver(&["--version"], b"");
        assert_eq!(code, 0);
        assert!(String::from_utf8(stdout).unwrap().contains("(proto 3.5.1)"));
    }

    #[test]
    fn decode_raw_round_trip() {
        let (code, stdout, stderr) = run_driver(&["--decode_raw"], &[0x08, 0x2a, 0x12, 0x02, 0x68, 0x69]);
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));
        assert_eq!(String::from_utf8(stdout).unwrap(), "1: 42\n2: \"hi\"\n");
    }

    #[test]
    fn encode_and_decode_against_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.proto"),
            "syntax = \"proto3\";\nmessage M { int32 x = 1; string y = 2; }\n",
        )
        .unwrap();
        let include = dir.path().to_string_lossy().into_owned();

        let (code, stdout, stderr) =
            run_driver(&["-I", &include, "--encode=M", "a.proto"], b"x: 42 y: \"hi\"");
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));
        assert_eq!(stdout, vec![0x08, 0x2a, 0x12, 0x02, 0x68, 0x69]);

        let (code, stdout, stderr) =
            run_driver(&["-I", &include, "--decode=M", "a.proto"], &stdout);
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));
        assert_eq!(String::from_utf8(stdout).unwrap(), "x: 42\ny: \"hi\"\n");
    }

    #[test]
    fn unknown_message_type_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.proto"), "syntax = \"proto3\";\nmessage M {}\n").unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let (code, _, stderr) = run_driver(&["-I", &include, "--encode=Other", "a.proto"], b"");
        assert_eq!(code, 1);
        assert_eq!(stderr_line(&stderr), "type not defined: Other");
    }

    #[test]
    fn free_field_numbers_against_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("free.proto"),
            "syntax = \"proto3\";\nmessage F { int32 a = 1; int32 b = 2; int32 c = 5; reserved 10 to 19; }\n",
        )
        .unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let (code, stdout, stderr) = run_driver(
            &["-I", &include, "--print_free_field_numbers", "free.proto"],
            b"",
        );
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));
        let text = String::from_utf8(stdout).unwrap();
        assert!(text.contains("free: 3-4 6-9 20-INF"), "got: {text}");
    }

    #[test]
    fn missing_codegen_output_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.proto"), "syntax = \"proto3\";\nmessage M {}\n").unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let (code, _, stderr) = run_driver(
            &["-I", &include, "--go_out=missing_dir", "a.proto"],
            b"",
        );
        assert_eq!(code, 1);
        assert_eq!(stderr_line(&stderr), "missing_dir: No such file or directory");
    }

    #[test]
    fn descriptor_set_round_trip_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dep.proto"), "syntax = \"proto3\";\nmessage D { int32 n = 1; }\n")
            .unwrap();
        fs::write(
            dir.path().join("main.proto"),
            "syntax = \"proto3\";\nimport \"dep.proto\";\nmessage M { D d = 1; }\n",
        )
        .unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let set_path = dir.path().join("set.bin");

        let (code, _, stderr) = run_driver(
            &[
                "-I",
                &include,
                "--include_imports",
                "-o",
                &set_path.to_string_lossy(),
                "main.proto",
            ],
            b"",
        );
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));

        // the saved set alone is enough to drive --encode
        let (code, stdout, stderr) = run_driver(
            &[
                &format!("--descriptor_set_in={}", set_path.display()),
                "--encode=M",
                "main.proto",
            ],
            b"d { n: 3 }",
        );
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));
        assert_eq!(stdout, vec![0x0a, 0x02, 0x08, 0x03]);
    }

    #[test]
    fn codegen_via_script_plugin_writes_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.proto"), "syntax = \"proto3\";\nmessage M {}\n").unwrap();
        let include = dir.path().to_string_lossy().into_owned();
        let out_dir = dir.path().join("out");
        fs::create_dir(&out_dir).unwrap();

        // a canned-response plugin: emits one file "g.txt" containing "made"
        let pb = prost_types::compiler::CodeGeneratorResponse {
            file: vec![prost_types::compiler::code_generator_response::File {
                name: Some("g.txt".to_string()),
                content: Some("made".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        use prost::Message as _;
        let canned = dir.path().join("resp.bin");
        fs::write(&canned, pb.encode_to_vec()).unwrap();
        let script = dir.path().join("protoc-gen-fake");
        fs::write(&script, format!("#!/bin/sh\ncat {}\n", canned.display())).unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        let (code, _, stderr) = run_driver(
            &[
                "-I",
                &include,
                &format!("--plugin=protoc-gen-fake={}", script.display()),
                &format!("--fake_out={}", out_dir.display()),
                "a.proto",
            ],
            b"",
        );
        assert_eq!(code, 0, "stderr: {}", stderr_line(&stderr));
        assert_eq!(fs::read_to_string(out_dir.join("g.txt")).unwrap(), "made");
    }
}
