// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser};
use clap_complete::{
    generate_to,
    shells::{Bash, Fish, Zsh},
};
use clap_mangen::Man;
use fs_err::{self as fs, File};
use thiserror::Error;

use mason::action::{self, Action, OperationId};
use mason::config;
use mason::context::Context;
use mason::driver;
use mason::name::Name;
use mason::project::{self, Project};
use mason::variable::Value;

mod clean;
mod configure;
mod install;
mod uninstall;
mod update;

#[derive(Debug, Parser)]
#[command(name = "mason", about = "A scope/target/rule build system driver")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        short,
        long = "verbose",
        action = ArgAction::Count,
        help = "Prints additional information about what mason is doing",
        global = true
    )]
    pub verbose: u8,
    #[arg(short = 'n', long, default_value = "false", global = true, help = "Print commands without executing them")]
    pub dry_run: bool,
    #[arg(
        short = 'k',
        long,
        default_value = "false",
        global = true,
        help = "Keep going after a recipe failure, where possible"
    )]
    pub keep_going: bool,
    #[arg(short, long, global = true, help = "Number of recipe threads")]
    pub jobs: Option<usize>,
    #[arg(short = 'C', long = "directory", global = true, help = "Project directory (defaults to the working directory)")]
    pub dir: Option<PathBuf>,
    #[arg(
        long = "set",
        value_name = "VAR=VALUE",
        global = true,
        help = "Override a configuration variable"
    )]
    pub set: Vec<String>,
    #[arg(long, global = true, default_value = "text", help = "Log output format (text or json)")]
    pub log_format: tracing_common::OutputFormat,
    #[arg(long, global = true, hide = true)]
    pub generate_manpages: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    pub generate_completions: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Update(update::Command),
    Clean(clean::Command),
    Test(test::Command),
    Install(install::Command),
    Uninstall(uninstall::Command),
    Configure(configure::Command),
}

pub fn process() -> Result<(), Error> {
    let Command { global, subcommand } = Command::parse();

    tracing_common::init(
        global.log_format,
        tracing_common::level_for_verbosity(global.verbose),
    );

    if let Some(jobs) = global.jobs {
        // May already be initialized when running under a test harness.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(jobs).build_global();
    }

    if let Some(dir) = &global.generate_manpages {
        generate_manpages(dir)?;
        return Ok(());
    }

    if let Some(dir) = &global.generate_completions {
        generate_completions(dir)?;
        return Ok(());
    }

    match subcommand {
        Some(Subcommand::Update(command)) => update::handle(command, &global),
        Some(Subcommand::Clean(command)) => clean::handle(command, &global),
        Some(Subcommand::Test(command)) => test::handle(command, &global),
        Some(Subcommand::Install(command)) => install::handle(command, &global),
        Some(Subcommand::Uninstall(command)) => uninstall::handle(command, &global),
        Some(Subcommand::Configure(command)) => configure::handle(command, &global),
        None => {
            Command::command().print_help()?;
            Ok(())
        }
    }
}

/// The shared operation flow: set up a context, load the project and
/// its saved configuration, resolve the buildspec, then match and
/// execute.
pub(crate) fn perform_operation(
    global: &Global,
    operation: OperationId,
    target_args: &[String],
) -> Result<(), Error> {
    let mut ctx = new_context(global)?;

    let project = open_project(global)?;
    let scope = project.load(&mut ctx)?;

    let names = parse_targets(target_args)?;
    let targets = project.resolve_targets(&ctx, scope, &names)?;

    driver::perform(&ctx, Action::new(action::PERFORM, operation), &targets, false)?;

    Ok(())
}

pub(crate) fn new_context(global: &Global) -> Result<Context, Error> {
    let mut ctx = Context::new()
        .with_verbosity(global.verbose)
        .with_dry_run(global.dry_run)
        .with_keep_going(global.keep_going);

    for (name, value) in parse_overrides(&global.set)? {
        ctx.add_override(name, value);
    }

    Ok(ctx)
}

pub(crate) fn open_project(global: &Global) -> Result<Project, Error> {
    let root = match &global.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    Ok(Project::open(root)?)
}

pub(crate) fn parse_targets(args: &[String]) -> Result<Vec<Name>, Error> {
    if args.is_empty() {
        return Ok(vec![project::default_target_name()]);
    }

    args.iter().map(|arg| Ok(Name::parse(arg)?)).collect()
}

pub(crate) fn parse_overrides(args: &[String]) -> Result<Vec<(String, Value)>, Error> {
    args.iter()
        .map(|arg| {
            let (name, value) = arg
                .split_once('=')
                .ok_or_else(|| Error::InvalidOverride(arg.clone()))?;
            Ok((name.trim().to_owned(), parse_value(value.trim())))
        })
        .collect()
}

/// Interpret an override value: bool and integer literals get their
/// natural types, whitespace makes a string list, anything else stays
/// a string.
fn parse_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(n) = raw.parse::<u64>() {
        return Value::UInt(n);
    }

    if raw.split_whitespace().nth(1).is_some() {
        return Value::Strings(raw.split_whitespace().map(str::to_owned).collect());
    }

    Value::String(raw.to_owned())
}

fn generate_manpages(dir: &PathBuf) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    let main_cmd = Command::command();

    let main_man = Man::new(main_cmd.clone());
    let mut buffer = File::create(dir.join("mason.1"))?;
    main_man.render(&mut buffer)?;

    for sub in main_cmd.get_subcommands() {
        let sub_man = Man::new(sub.clone());
        let name = format!("mason-{}.1", sub.get_name());
        let mut buffer = File::create(dir.join(&name))?;
        sub_man.render(&mut buffer)?;
    }

    Ok(())
}

fn generate_completions(dir: &PathBuf) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    let mut cmd = Command::command();

    generate_to(Bash, &mut cmd, "mason", dir)?;
    generate_to(Fish, &mut cmd, "mason", dir)?;
    generate_to(Zsh, &mut cmd, "mason", dir)?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("project")]
    Project(#[from] mason::project::Error),
    #[error("configuration")]
    Config(#[from] config::Error),
    #[error("target name")]
    Name(#[from] mason::name::Error),
    #[error("invalid override {0:?}, expected VAR=VALUE")]
    InvalidOverride(String),
    #[error(transparent)]
    Failed(#[from] mason::diag::Failed),
    #[error("io")]
    Io(#[from] std::io::Error),
}
