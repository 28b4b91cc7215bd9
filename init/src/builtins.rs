//! Command execution for trigger blocks.
//!
//! Every command line is dispatched here after `${key}` expansion, which
//! happens at execution time so commands observe the property values of
//! the moment they run, not of the parse. Unknown verbs warn and return
//! cleanly; the run loop never unwinds out of a command.
//!
//! Filesystem verbs resolve absolute paths against the configured root so
//! a non-PID-1 instance stays confined to its own tree.

use crate::error::{Error, Result};
use crate::init::{InitContext, InitEvent};
use crate::rc::{expand_props, parse_mode, Command};
use crate::uevent::{resolve_gid, resolve_uid};
use crate::util::write_file_atomic;
use nix::unistd::{Gid, Uid};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{info, warn};

/// Execute one command from an action block.
pub async fn run_command(ctx: &InitContext, cmd: &Command) -> Result<()> {
    // Substitution happens now, against the live store.
    let args: Vec<String> = cmd
        .args
        .iter()
        .map(|arg| expand_props(arg, &ctx.props))
        .collect();

    let verb = args[0].as_str();
    match verb {
        "setprop" => {
            let (key, value) = two_args(&args, "setprop KEY VALUE")?;
            ctx.props.set(key, value)?;
        }
        "start" => {
            let name = one_arg(&args, "start NAME")?;
            ctx.services.start(name).await?;
        }
        "stop" => {
            let name = one_arg(&args, "stop NAME")?;
            ctx.services.stop(name).await?;
        }
        "restart" => {
            let name = one_arg(&args, "restart NAME")?;
            ctx.services.restart(name).await?;
        }
        "class_start" => {
            let class = one_arg(&args, "class_start CLASS")?;
            ctx.services.start_class(class).await;
        }
        "class_stop" => {
            let class = one_arg(&args, "class_stop CLASS")?;
            ctx.services.stop_class(class).await;
        }
        "mkdir" => do_mkdir(ctx, &args)?,
        "write" => {
            if args.len() < 3 {
                return usage("write PATH CONTENT");
            }
            let path = ctx.resolve_path(&args[1]);
            write_file_atomic(&path, args[2..].join(" ").as_bytes())?;
        }
        "copy" => {
            let (src, dst) = two_args(&args, "copy SRC DST")?;
            std::fs::copy(ctx.resolve_path(src), ctx.resolve_path(dst))?;
        }
        "chmod" => {
            let (mode, path) = two_args(&args, "chmod MODE PATH")?;
            let mode = parse_mode(mode, Path::new("<command>"), cmd.line);
            std::fs::set_permissions(
                ctx.resolve_path(path),
                std::fs::Permissions::from_mode(mode),
            )?;
        }
        "chown" => {
            if args.len() < 4 {
                return usage("chown USER GROUP PATH");
            }
            let uid = resolve_uid(&args[1])
                .ok_or_else(|| Error::UnknownIdentity(args[1].clone()))?;
            let gid = resolve_gid(&args[2])
                .ok_or_else(|| Error::UnknownIdentity(args[2].clone()))?;
            nix::unistd::chown(
                &ctx.resolve_path(&args[3]),
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )?;
        }
        "symlink" => {
            let (target, link) = two_args(&args, "symlink TARGET LINK")?;
            std::os::unix::fs::symlink(target, ctx.resolve_path(link))?;
        }
        "rm" => {
            let path = one_arg(&args, "rm PATH")?;
            std::fs::remove_file(ctx.resolve_path(path))?;
        }
        "rmdir" => {
            let path = one_arg(&args, "rmdir PATH")?;
            std::fs::remove_dir(ctx.resolve_path(path))?;
        }
        "exec" => do_exec(&args)?,
        "trigger" => {
            let name = one_arg(&args, "trigger NAME")?;
            let _ = ctx.events.send(InitEvent::Trigger(name.to_string()));
        }
        _ => {
            warn!(verb, line = cmd.line, "unknown command verb, ignoring");
        }
    }

    Ok(())
}

fn do_mkdir(ctx: &InitContext, args: &[String]) -> Result<()> {
    if args.len() < 2 {
        return usage("mkdir PATH [MODE [USER GROUP]]");
    }
    let path = ctx.resolve_path(&args[1]);
    std::fs::create_dir_all(&path)?;

    if let Some(mode) = args.get(2) {
        let mode = parse_mode(mode, Path::new("<command>"), 0);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
    }
    if let (Some(user), Some(group)) = (args.get(3), args.get(4)) {
        let uid = resolve_uid(user).ok_or_else(|| Error::UnknownIdentity(user.clone()))?;
        let gid = resolve_gid(group).ok_or_else(|| Error::UnknownIdentity(group.clone()))?;
        nix::unistd::chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
    }
    Ok(())
}

/// Run a one-off command to completion, logging its exit status. The
/// action pipeline is single-threaded by contract, so this blocks the
/// loop deliberately.
fn do_exec(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        return usage("exec COMMAND [ARG]...");
    }
    let status = std::process::Command::new(&args[1])
        .args(&args[2..])
        .status()
        .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", args[1], e)))?;
    info!(command = %args[1], code = ?status.code(), "exec finished");
    Ok(())
}

fn one_arg<'a>(args: &'a [String], usage_text: &str) -> Result<&'a str> {
    match args.get(1) {
        Some(arg) => Ok(arg),
        None => Err(Error::ConfigError(format!("usage: {usage_text}"))),
    }
}

fn two_args<'a>(args: &'a [String], usage_text: &str) -> Result<(&'a str, &'a str)> {
    match (args.get(1), args.get(2)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::ConfigError(format!("usage: {usage_text}"))),
    }
}

fn usage(usage_text: &str) -> Result<()> {
    Err(Error::ConfigError(format!("usage: {usage_text}")))
}
