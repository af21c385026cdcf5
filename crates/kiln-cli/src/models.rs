//! Commands that work on stored models.

use kiln_core::{Error, ModelName};

use crate::colors;
use crate::context::Context;

pub fn list(ctx: &Context) -> anyhow::Result<()> {
    let names = ctx.store().list()?;
    if names.is_empty() {
        println!("{}No models stored.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }

    for name in names {
        println!("{}", name);
    }
    Ok(())
}

pub fn show(ctx: &Context, model: &str) -> anyhow::Result<()> {
    let name = ModelName::parse(model)?;
    let stored = ctx
        .store()
        .get(&name)?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;

    println!("{}{}{}", colors::BOLD, name, colors::RESET);
    println!("  module:      {} bytes", stored.artifact.binary.len());
    println!("  fingerprint: {}", stored.fingerprint);

    let diagnostics = stored.artifact.diagnostics.trim_end();
    if diagnostics.is_empty() {
        println!("  diagnostics: {}(none){}", colors::DIM, colors::RESET);
    } else {
        println!("  diagnostics:");
        println!("{}", "─".repeat(50));
        println!("{}", diagnostics);
    }
    Ok(())
}

pub fn delete(ctx: &Context, model: &str) -> anyhow::Result<()> {
    let name = ModelName::parse(model)?;
    if !ctx.store().delete(&name)? {
        return Err(Error::NotFound(name.to_string()).into());
    }

    println!("{}Deleted{} {}", colors::GREEN, colors::RESET, name);
    Ok(())
}

pub async fn load(ctx: &Context, model: &str) -> anyhow::Result<()> {
    let name = ModelName::parse(model)?;
    let module = ctx.loader().load_async(&name, ctx.shared_store()).await?;

    println!(
        "{}Loaded{} {} as {}",
        colors::GREEN,
        colors::RESET,
        module.name(),
        module.identifier()
    );
    if !module.diagnostics().trim().is_empty() {
        println!("{}{}{}", colors::DIM, module.diagnostics().trim_end(), colors::RESET);
    }
    Ok(())
}
