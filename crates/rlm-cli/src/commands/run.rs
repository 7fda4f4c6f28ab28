use console::style;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rlm_config::ConfigLoader;
use rlm_core::{Result, RlmError, SessionState};
use rlm_llm::GatewayStats;
use rlm_runtime::{EngineSettings, RlmRuntime, SessionOutput, SessionRequest};

use super::gateway::build_gateway;
use super::{RunArgs, read_input};

pub(super) async fn cmd_run(loader: &ConfigLoader, args: RunArgs) -> Result<ExitCode> {
    let mut config = loader.get();
    if let Some(model) = args.model {
        config.backend.model = model;
    }
    if let Some(sub_model) = args.sub_model {
        config.backend.sub_model = Some(sub_model);
    }

    let context = read_input(&args.context)?;
    let system_prompt = match args.system_prompt_file {
        Some(ref path) => Some(std::fs::read_to_string(path).map_err(|e| {
            RlmError::Config(format!("cannot read {}: {e}", path.display()))
        })?),
        None => loader.system_prompt()?,
    };

    let gateway = Arc::new(build_gateway(&config));
    let runtime = RlmRuntime::new(gateway.clone(), EngineSettings::from_config(&config, system_prompt));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting session");
            on_interrupt.cancel();
        }
    });

    let mut request = SessionRequest::new(context, args.query);
    if let Some(depth) = args.max_depth {
        request = request.with_max_depth(depth);
    }
    let output = runtime.run_with_cancel(request, cancel).await;

    if let Some(ref path) = args.trace_out {
        std::fs::write(path, serde_json::to_string_pretty(&output)?)?;
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&output, &gateway.stats());
    }

    Ok(if output.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(output: &SessionOutput, stats: &GatewayStats) {
    let state = match output.state {
        SessionState::Completed => style("completed").green(),
        SessionState::Failed => style("failed").red(),
        SessionState::Aborted => style("aborted").yellow(),
        SessionState::Running => style("running").dim(),
    };
    let sub_calls = output
        .trace
        .iter()
        .filter(|e| e.operation == "call_sub_llm")
        .count();

    eprintln!(
        "{} {state} after {} iterations, {sub_calls} sub-calls, {} backend requests ({} failed), {} tokens, ~${:.4}",
        style("session").bold(),
        output.iterations,
        stats.requests,
        stats.failures,
        stats.usage.total_tokens(),
        stats.usage.estimated_cost_usd,
    );
    if let Some(ref error) = output.error {
        eprintln!("{} {error}", style("error:").red().bold());
    }
    if let Some(answer) = output.answer_text() {
        println!("{answer}");
    }
}
