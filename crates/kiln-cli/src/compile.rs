//! `name` and `compile` commands.

use std::fs;
use std::time::Instant;

use kiln_core::compile::CommandTranslator;
use kiln_core::{BuildOrchestrator, OperationRegistry, Translator, Versions, derive_model_name};

use crate::colors;
use crate::context::Context;

fn read_source(file: &str) -> anyhow::Result<String> {
    fs::read_to_string(file).map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file, e))
}

/// Print the model name of a program without building it.
pub fn name(ctx: &Context, file: &str) -> anyhow::Result<()> {
    let source = read_source(file)?;
    let config = ctx.compiler_config();
    let translator = CommandTranslator::new(&config.translator_program, config.translator_args)?;
    let versions = Versions::current(translator.version());

    println!("{}", derive_model_name(&source, &versions));
    Ok(())
}

/// Compile a program as a registered operation.
///
/// Ctrl+C shuts the registry down, which abandons the build.
pub async fn execute(ctx: &Context, file: &str, load: bool) -> anyhow::Result<()> {
    let start = Instant::now();
    let source = read_source(file)?;

    let orchestrator = BuildOrchestrator::from_config(ctx.compiler_config(), ctx.shared_store())?;
    let registry = OperationRegistry::new();
    let operation = format!("operations/{}", uuid::Uuid::new_v4().simple());
    let model_name = orchestrator.model_name(&source);

    print!(
        "{}Compiling{} {}{}{}... ",
        colors::CYAN,
        colors::RESET,
        colors::BOLD,
        model_name,
        colors::RESET
    );
    colors::flush_stdout();

    registry.begin(&operation)?;
    registry.start(&operation)?;

    let result = tokio::select! {
        result = orchestrator.compile(&source) => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            println!("{}interrupted{}", colors::YELLOW, colors::RESET);
            let abandoned = registry.shutdown();
            anyhow::bail!("Interrupted with {} unfinished operation(s)", abandoned.len());
        }
    };

    let output = match result {
        Ok(output) => {
            registry.complete(
                &operation,
                serde_json::json!({ "name": output.model_name, "cached": output.cached }),
            )?;
            output
        }
        Err(e) => {
            println!("{}✗{}", colors::RED, colors::RESET);
            registry.fail(&operation, &e)?;
            return Err(e.into());
        }
    };
    registry.shutdown();

    let verb = if output.cached { "cached" } else { "built" };
    println!(
        "{}✓ {}{} ({} bytes, {:.2}s)",
        colors::GREEN,
        verb,
        colors::RESET,
        output.artifact.binary.len(),
        start.elapsed().as_secs_f64()
    );

    if !output.artifact.diagnostics.trim().is_empty() {
        println!("{}{}{}", colors::DIM, output.artifact.diagnostics.trim_end(), colors::RESET);
    }

    if load {
        let module = ctx
            .loader()
            .load_artifact_async(&output.model_name, output.artifact)
            .await?;
        println!(
            "{}Loaded{} {} as {}",
            colors::GREEN,
            colors::RESET,
            module.name(),
            module.identifier()
        );
    }

    Ok(())
}
