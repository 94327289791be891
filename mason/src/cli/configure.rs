// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Args;

use mason::action::{self, Action};
use mason::config;

use super::{Error, Global};

#[derive(Debug, Args)]
#[command(about = "Persist configuration variables into build/config.build")]
pub struct Command {
    #[arg(value_name = "VAR=VALUE", help = "Variables to configure")]
    pub variables: Vec<String>,
}

pub fn handle(command: Command, global: &Global) -> Result<(), Error> {
    let mut ctx = super::new_context(global)?;

    let project = super::open_project(global)?;
    let scope = project.load(&mut ctx)?;

    ctx.set_current(Action::new(action::CONFIGURE, action::DEFAULT));

    // Carry over whatever the previous configuration recorded.
    let existing: Vec<_> = ctx
        .scopes()
        .get(scope)
        .vars
        .iter()
        .map(|(var, _)| var.clone())
        .collect();
    for var in existing {
        ctx.save_variable(var, 0);
    }

    // Then layer the requested assignments on top.
    for (name, value) in super::parse_overrides(&command.variables)? {
        let var = ctx.var_pool.intern(&name);
        ctx.scopes_mut().assign(scope, var.clone()).value = Some(value);
        ctx.save_variable(var, 0);
    }

    config::save(&ctx, scope)?;

    println!("configured {}", project.root().display());

    Ok(())
}
