//! `wg-manager` binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wg_manager::CommandDriver;
use wg_manager_cli::cli::{Cli, Commands};
use wg_manager_cli::commands::{ApplyCommand, InterfaceCommand, KeyCommand, ValidateCommand};
use wg_manager_cli::{CliError, OutputFormat};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout();

    match cli.command {
        Commands::Validate(args) => {
            ValidateCommand.execute(&mut stdout, &format, &args).await?;
        }
        Commands::Apply(args) => {
            let cmd = ApplyCommand::new(&cli.key_root);
            cmd.execute(&mut stdout, &format, &args).await?;
        }
        Commands::Show { name } => {
            let cmd = InterfaceCommand::new(CommandDriver::new());
            cmd.show(&mut stdout, &format, &name).await?;
        }
        Commands::Down { name } => {
            let cmd = InterfaceCommand::new(CommandDriver::new());
            cmd.down(&mut stdout, &format, &name).await?;
        }
        Commands::Genkey => {
            KeyCommand::Generate.execute(&mut io::stdin().lock(), &mut stdout, &format)?;
        }
        Commands::Pubkey => {
            KeyCommand::Public.execute(&mut io::stdin().lock(), &mut stdout, &format)?;
        }
        Commands::Genpsk => {
            KeyCommand::Preshared.execute(&mut io::stdin().lock(), &mut stdout, &format)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_validate_missing_file_fails() {
        let cli = Cli::parse_from(["wg-manager", "validate", "/nonexistent/wg0.json"]);
        assert!(matches!(run(cli).await, Err(CliError::Config(_))));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn run_holds_no_stdout_lock_across_awaits() {
        let cli = Cli::parse_from(["wg-manager", "show", "wg0"]);
        let future = run(cli);
        assert_send(&future);
    }

    #[tokio::test]
    async fn run_genpsk_succeeds() {
        let cli = Cli::parse_from(["wg-manager", "genpsk"]);
        assert!(run(cli).await.is_ok());
    }
}
