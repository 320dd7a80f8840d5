/// Interactive challenge answered through the daemon
use anyhow::Result;
use intentgate_core::{
    ipc::{IpcClient, IpcRequest, IpcResponse},
    ChallengeOutcome, ChallengePrompt,
};
use std::io::{self, BufRead, Write};
use std::path::Path;

use super::helpers::{daemon_client, format_duration_ms, strip_line_ending};

pub async fn unlock(data_dir: &Path, app: Option<String>) -> Result<()> {
    let Some(client) = daemon_client(data_dir) else {
        anyhow::bail!("Daemon is not running. Start it with `intentgate start`.");
    };

    let prompt = match client
        .send_command(IpcRequest::ChallengePrompt { target: app })
        .await?
    {
        IpcResponse::Prompt(Some(prompt)) => prompt,
        IpcResponse::Prompt(None) => {
            println!("No pending challenge. Name the application: `intentgate unlock <app>`");
            return Ok(());
        }
        other => anyhow::bail!("Unexpected response from daemon: {other:?}"),
    };

    println!(
        "To open {} for {}, type exactly:\n\n    {}\n",
        prompt.app_id,
        format_duration_ms(prompt.duration_ms.unsigned_abs()),
        prompt.sentence
    );
    println!("(Ctrl-D to cancel)");

    let stdin = io::stdin();
    let mut input = stdin.lock();
    answer(&client, &prompt, &mut input).await
}

/// Keep asking until the sentence matches or input ends
async fn answer(
    client: &IpcClient,
    prompt: &ChallengePrompt,
    input: &mut impl BufRead,
) -> Result<()> {
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            println!();
            client
                .send_command(IpcRequest::CancelChallenge {
                    target: prompt.app_id.clone(),
                })
                .await?;
            println!("Cancelled. {} stays blocked.", prompt.app_id);
            return Ok(());
        }

        let response = client
            .send_command(IpcRequest::SubmitChallenge {
                target: prompt.app_id.clone(),
                input: strip_line_ending(&line).to_string(),
            })
            .await?;

        match response {
            IpcResponse::ChallengeResult(ChallengeOutcome::Granted {
                app_id,
                duration_ms,
            }) => {
                println!(
                    "{app_id} unlocked for {}",
                    format_duration_ms(duration_ms.unsigned_abs())
                );
                return Ok(());
            }
            IpcResponse::ChallengeResult(ChallengeOutcome::Mismatch) => {
                println!("That does not match. Try again.");
            }
            IpcResponse::ChallengeResult(ChallengeOutcome::Cancelled) => {
                println!("Cancelled.");
                return Ok(());
            }
            other => anyhow::bail!("Unexpected response from daemon: {other:?}"),
        }
    }
}
