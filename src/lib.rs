//! # protodrive
//!
//! A drop-in reimplementation of the `protoc` driver: it compiles `.proto`
//! sources (or loads pre-compiled descriptor sets) and dispatches the
//! descriptors to code-generation plugins, assembling their outputs into
//! files, ZIP, or JAR archives. The binary also carries protoc's side
//! modes: text⇄binary message codecs, schemaless raw decoding, and
//! free-field-number reporting.
//!
//! If you are looking for the command-line tool, build the binary. The
//! library surface is for code generators: implement [`Plugin`] and either
//! register it in-process with [`register_plugin`] before invoking the
//! driver, or ship it as a standalone `protoc-gen-*` executable whose main
//! function is [`plugin_main`].

pub mod args;
mod codec;
mod compile;
mod descriptor;
pub mod driver;
mod exec;
mod free_fields;
pub mod output;
pub mod plugin;
pub mod wire;

pub use driver::run;
pub use plugin::{
    emulated_version, plugin_main, register_plugin, run_plugin, CodeGenRequest, CodeGenResponse,
    Plugin, ProtocVersion,
};
