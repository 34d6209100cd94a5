//! Interactive translation session.

use hirnu_ml::MlError;
use hirnu_ml::inference::{GenerationRequest, Generator, Language, SessionCommand, Translator};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Sampling and language settings shared by every turn of a session.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub source: Language,
    pub system: Option<String>,
    pub max_tokens: usize,
    pub temperature: f64,
}

/// What a turn produced.
#[derive(Debug, PartialEq)]
enum Turn {
    Output(String),
    Continue,
    Quit,
}

async fn respond(
    generator: &dyn Generator,
    settings: &SessionSettings,
    command: SessionCommand,
) -> Result<Turn, MlError> {
    match command {
        SessionCommand::Quit => Ok(Turn::Quit),
        SessionCommand::Empty => Ok(Turn::Continue),
        SessionCommand::Help => Ok(Turn::Output(SessionCommand::HELP.to_string())),
        SessionCommand::Unknown(name) => Ok(Turn::Output(format!(
            "Unknown command: /{name}. Type /help for commands."
        ))),
        SessionCommand::Translate(text) => {
            let output = Translator::new(generator)
                .with_system(settings.system.clone())
                .with_sampling(settings.max_tokens, settings.temperature)
                .translate(&text, settings.source, settings.source.other())
                .await?;
            Ok(Turn::Output(output))
        }
        SessionCommand::Generate(prompt) => {
            let request = GenerationRequest::new(prompt)
                .with_system(settings.system.clone())
                .with_max_tokens(settings.max_tokens)
                .with_temperature(settings.temperature);
            Ok(Turn::Output(generator.generate(&request).await?))
        }
    }
}

fn print_prompt() {
    print!("\x1b[1;34m> \x1b[0m");
    let _ = std::io::stdout().flush();
}

/// Read lines until `/quit`, end of input or Ctrl-C. A failed generation is
/// reported and the session continues.
pub(crate) async fn run_interactive(
    generator: &dyn Generator,
    settings: SessionSettings,
) -> anyhow::Result<()> {
    println!(
        "\x1b[1;32mHirnu interactive session\x1b[0m ({} -> {})",
        settings.source,
        settings.source.other()
    );
    println!("  Type /help for commands, /quit to exit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        print_prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut ctrl_c => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let turn = tokio::select! {
            turn = respond(generator, &settings, SessionCommand::parse(&line)) => turn,
            _ = &mut ctrl_c => Ok(Turn::Quit),
        };
        match turn {
            Ok(Turn::Output(text)) => println!("{text}\n"),
            Ok(Turn::Continue) => {}
            Ok(Turn::Quit) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Generation failed");
                println!("\x1b[31mError:\x1b[0m {e}\n");
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}
