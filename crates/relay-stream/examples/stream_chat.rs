use std::io::Write as _;
use std::sync::Arc;

use relay_stream::config::load_dotenv;
use relay_stream::prelude::*;
use relay_stream::vendors::openai::OpenAiBackend;
use relay_stream::vendors::relay::RelayBackend;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), RelayError> {
    load_dotenv();
    relay_stream::init_observability();

    let adapter: Arc<dyn relay_stream::BackendAdapter> = match RelayBackend::from_env() {
        Ok(relay) => Arc::new(relay),
        Err(_) => Arc::new(OpenAiBackend::from_env()?),
    };
    let gateway = Gateway::builder()
        .route(Backend::Mojo, adapter.clone())
        .route(Backend::MojoPlus, adapter)
        .build()?;
    let sessions = SessionManager::new(gateway, SessionConfig::from_env()?)?;

    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.trim().is_empty() {
        "Stream a short greeting.".to_string()
    } else {
        prompt
    };

    let mut handle = sessions
        .start("example", ChatRequest::new(Backend::Mojo).user(prompt))
        .await?;
    while let Some(event) = handle.next_event().await {
        match event {
            SessionEvent::Progress {
                chunk: StreamChunk::TextDelta(text),
                ..
            } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            SessionEvent::Progress {
                chunk: StreamChunk::ToolEvent(tool),
                ..
            } => eprintln!("\n[tool: {}]", tool.kind),
            SessionEvent::Finished(outcome) => {
                println!();
                if let Some(failure) = outcome.failure {
                    eprintln!("session {}: {failure}", outcome.status);
                }
            }
            _ => {}
        }
    }
    Ok(())
}
