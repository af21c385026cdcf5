//! Kiln CLI - content-addressed compilation cache for model programs.

mod colors;
mod compile;
mod context;
mod models;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use context::Context;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Compile model programs once, load them anywhere")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Kiln home directory (default: $KILN_HOME or the user cache dir)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the model name a program compiles to
    Name {
        /// Path to the program source
        file: String,
    },

    /// Compile a program, reusing the cached module if present
    Compile {
        /// Path to the program source
        file: String,

        /// Load the module into this process after compiling
        #[arg(long)]
        load: bool,
    },

    /// Load a stored module and run its initialization
    Load {
        /// Model name, e.g. models/3f9a0c11e2
        model: String,
    },

    /// List stored models
    List,

    /// Show a stored model and its build diagnostics
    Show {
        /// Model name, e.g. models/3f9a0c11e2
        model: String,
    },

    /// Delete a stored model
    Delete {
        /// Model name, e.g. models/3f9a0c11e2
        model: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format kiln-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(kiln_err) = err.downcast_ref::<kiln_core::Error>() {
            anyhow::anyhow!("{}", kiln_err.with_hint())
        } else {
            err
        }
    };

    let ctx = Context::open(cli.home.as_deref()).map_err(format_error)?;

    match cli.command {
        Commands::Name { file } => compile::name(&ctx, &file).map_err(format_error)?,

        Commands::Compile { file, load } => {
            compile::execute(&ctx, &file, load).await.map_err(format_error)?;
        }

        Commands::Load { model } => models::load(&ctx, &model).await.map_err(format_error)?,

        Commands::List => models::list(&ctx).map_err(format_error)?,

        Commands::Show { model } => models::show(&ctx, &model).map_err(format_error)?,

        Commands::Delete { model } => models::delete(&ctx, &model).map_err(format_error)?,
    }

    Ok(())
}
