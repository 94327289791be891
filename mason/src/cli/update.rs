// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Args;

use mason::action;

use super::{Error, Global};

#[derive(Debug, Args)]
#[command(about = "Bring targets up to date")]
pub struct Command {
    #[arg(value_name = "TARGET", help = "Buildspec names, e.g. file{hello.cxx} or fsdir{build/}")]
    pub targets: Vec<String>,
}

pub fn handle(command: Command, global: &Global) -> Result<(), Error> {
    super::perform_operation(global, action::UPDATE, &command.targets)
}
