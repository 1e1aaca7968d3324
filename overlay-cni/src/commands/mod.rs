use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tokio::runtime::{Builder, Runtime};
use tracing::error;

use crate::config::NetConf;
use crate::error::{CniError, Stage};
use crate::plugin::OverlayPlugin;
use crate::types::{CmdArgs, VersionInfo};

/// Exit status of a CNI invocation.
pub type ExitCode = i32;

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // both may legitimately be empty on DEL
    let netns = env::var("CNI_NETNS").unwrap_or_default();
    let ifname = env::var("CNI_IFNAME").unwrap_or_default();

    let path = env::var("CNI_PATH").context("CNI_PATH not found in environment")?;

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn runtime() -> Result<Runtime, CniError> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CniError::new(Stage::LoadConfig, format!("create runtime: {}", e)))
}

fn load(args: &CmdArgs) -> Result<NetConf, CniError> {
    NetConf::parse(&args.stdin_data).map_err(|e| CniError::from_err(Stage::LoadConfig, e))
}

fn fail(err: CniError) -> ExitCode {
    error!(stage = %err.msg, details = %err.details, "CNI error");
    err.print_json();
    1
}

/// Exit status after writing a successful outcome. A failed write is logged,
/// not reported under a stage.
fn printed(output: serde_json::Result<()>) -> ExitCode {
    match output {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "failed to write result");
            1
        }
    }
}

/// Execute the add command
pub fn cmd_add(args: CmdArgs) -> ExitCode {
    let outcome = load(&args).and_then(|conf| {
        let plugin = OverlayPlugin::new(conf, args);
        runtime()?.block_on(plugin.add_network())
    });

    match outcome {
        Ok(result) => printed(result.print()),
        Err(err) => fail(err),
    }
}

/// Execute the delete command. Exits non-zero only when the network could not
/// be resolved; everything after that has already been logged.
pub fn cmd_del(args: CmdArgs) -> ExitCode {
    let outcome = load(&args).and_then(|conf| {
        let plugin = OverlayPlugin::new(conf, args);
        runtime()?.block_on(plugin.del_network())
    });

    match outcome {
        Ok(_) => 0,
        Err(err) => fail(err),
    }
}

/// Print supported CNI versions
pub fn cmd_version() -> ExitCode {
    printed(serde_json::to_string(&VersionInfo::default()).map(|json| println!("{}", json)))
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> ExitCode {
    let cmd = env::var("CNI_COMMAND").unwrap_or_default();

    if cmd == "VERSION" {
        return cmd_version();
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => return fail(CniError::new(Stage::LoadConfig, format!("{:#}", e))),
    };

    match cmd.as_str() {
        "ADD" => cmd_add(args),
        "DEL" => cmd_del(args),
        other => fail(CniError::new(
            Stage::LoadConfig,
            format!("unknown CNI command: {:?}", other),
        )),
    }
}
