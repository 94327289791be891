// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Args;

use mason::action;

use super::{Error, Global};

#[derive(Debug, Args)]
#[command(about = "Install targets (updating them first)")]
pub struct Command {
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,
}

pub fn handle(command: Command, global: &Global) -> Result<(), Error> {
    super::perform_operation(global, action::INSTALL, &command.targets)
}
