use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;

use python_sandbox::protocol::TrustedBindings;
use secure_exec::actors::sandbox_actor::{spawn_sandbox_actor, SandboxMsg};
use secure_exec::cli::{parse_json_or_file, read_script, read_value_or_file, CliArgs, CliCommand};
use secure_exec::settings::load_settings;
use secure_exec::supervisor::{SandboxConfig, Supervisor};
use secure_exec::validator::Validator;
use secure_exec::{init_tracing, limiter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let mut settings = load_settings(args.config.as_deref()).await?;
    args.overrides.apply(&mut settings);

    let succeeded = match args.command {
        CliCommand::Run {
            script,
            bindings,
            trace,
        } => {
            let script = read_script(&script)?;
            let bindings: TrustedBindings = match bindings {
                Some(raw) => parse_json_or_file(&raw).context("Invalid --bindings")?,
                None => TrustedBindings::new(),
            };
            let supervisor = Arc::new(Supervisor::new(SandboxConfig::from_settings(&settings)));

            if trace {
                let execution = supervisor.execute(&script, bindings, None).await?;
                let report = execution.report();
                print_json(&json!({ "report": report, "execution": execution }))?;
                report.success
            } else {
                let sandbox = spawn_sandbox_actor(supervisor, settings.sanitizer());
                let (respond_to, response) = oneshot::channel();
                sandbox
                    .send(SandboxMsg::Execute {
                        script,
                        bindings,
                        limits: None,
                        respond_to,
                    })
                    .await
                    .context("Sandbox actor stopped")?;
                let report = response.await.context("Sandbox actor dropped the request")?;
                print_json(&report)?;
                report.success
            }
        }
        CliCommand::Screen { text } => {
            let text = read_value_or_file(&text)?;
            let verdict = settings.sanitizer().screen(&text);
            print_json(&json!({
                "valid": verdict.is_ok(),
                "error": verdict.as_ref().err().map(|e| e.to_string()),
            }))?;
            verdict.is_ok()
        }
        CliCommand::Validate { script } => {
            let script = read_script(&script)?;
            let denylist = settings.denylist();
            let verdict = Validator::new(&denylist).validate(&script);
            print_json(&verdict)?;
            verdict.is_accepted()
        }
        CliCommand::Probe => {
            let config = SandboxConfig::from_settings(&settings);
            let worker = match &config.strategy {
                secure_exec::supervisor::ExecutionStrategy::Isolated { worker } => {
                    Some(worker.display().to_string())
                }
                secure_exec::supervisor::ExecutionStrategy::InProcess => None,
            };
            print_json(&json!({
                "version": env!("CARGO_PKG_VERSION"),
                "git_hash": env!("SECURE_EXEC_GIT_HASH"),
                "git_count": env!("SECURE_EXEC_GIT_COUNT"),
                "strategy": config.strategy.to_string(),
                "worker": worker,
                "native_limits": cfg!(unix),
                "default_limits": config.default_limits,
                "resource_usage": limiter::sample(),
            }))?;
            true
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{}", rendered);
    Ok(())
}
