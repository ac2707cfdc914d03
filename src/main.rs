use clap::Parser;
use secagent::chat::{ChatSettings, DateInput};
use secagent::client::{RelayClient, TurnState};
use secagent::main_helper::{AskArgs, HistoryArgs};
use secagent::session::{settled_answer, AnswerEcho, ChatSession};
use secagent::store::{ChatHistorySink, ChatStore};
use secagent::*;
use std::io::Write;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_dir = match &cli.command {
        Command::Serve(args) => args.log_dir.clone(),
        _ => None,
    };
    let _guard = logging::init_tracing(log_dir.as_deref());
    logging::setup_panic_hook();

    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Ask(args) => ask(args).await,
        Command::History(args) => history(args).await,
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = AppConfig::from_env();
    let state = Arc::new(AppState::new(config, args)?);
    server::serve(state).await
}

async fn ask(args: AskArgs) -> Result<()> {
    let store = ChatStore::open(&args.database).await?;
    let settings = ChatSettings {
        stock_ticker: args.ticker.clone(),
        form_types: args.form_types.clone(),
        start_date: args.start_date.clone().map(DateInput::Text),
        end_date: args.end_date.clone().map(DateInput::Text),
        deep_analysis: Some(args.deep_analysis),
    };

    let chat = match &args.chat {
        Some(id) => match store.get_chat(id).await? {
            Some(chat) => {
                store.select_chat(Some(id)).await?;
                chat
            }
            None => return Err(RelayError::Validation(format!("No chat with id {}", id)).into()),
        },
        None => store.create_chat(None, &settings).await?,
    };
    if args.chat.is_some() {
        store.update_settings(&chat.id, &settings).await?;
    }

    let client = RelayClient::new(args.relay.clone())?;
    let client = match std::env::var(constants::SESSION_COOKIE_ENV) {
        Ok(cookie) if !cookie.is_empty() => client.with_session_cookie(cookie),
        _ => client,
    };
    let sink = ChatHistorySink::new(store.clone(), &chat);
    let mut session = ChatSession::new(client, settings, chat.messages.clone(), sink);

    let canceller = session.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let streaming = session.subscribe_streaming();
    let printer = tokio::spawn(AnswerEcho::new().follow(streaming, print_fresh));

    let question = args.question.join(" ");
    let outcome = session.send_message(&question).await;
    interrupt.abort();
    let saved = match &outcome {
        Ok(_) => settled_answer(session.messages()).map(str::to_string),
        Err(_) => None,
    };
    drop(session);
    if let Ok(echo) = printer.await {
        if let Some(saved) = saved {
            echo.finish(&saved, print_fresh);
        }
    }
    println!();

    match outcome? {
        TurnState::Cancelled => eprintln!("(cancelled; partial answer saved)"),
        state => tracing::debug!("Turn finished: {:?}", state),
    }
    eprintln!("chat: {}", chat.id);
    Ok(())
}

fn print_fresh(fresh: &str) {
    print!("{}", fresh);
    let _ = std::io::stdout().flush();
}

async fn history(args: HistoryArgs) -> Result<()> {
    let store = ChatStore::open(&args.database).await?;

    if let Some(id) = &args.delete {
        if store.delete_chat(id).await? {
            println!("Deleted {}", id);
        } else {
            println!("No chat with id {}", id);
        }
        return Ok(());
    }

    let current = store.current_chat_id().await?;
    let chats = store.list_chats().await?;
    if chats.is_empty() {
        println!("No chats yet.");
    }
    for chat in chats {
        let marker = if current.as_deref() == Some(chat.id.as_str()) {
            "*"
        } else {
            " "
        };
        let updated = chrono::DateTime::from_timestamp_millis(chat.updated_at)
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{} {}  {}  {:>3} msgs  {}",
            marker,
            chat.id,
            updated,
            chat.messages.len(),
            chat.title
        );
    }
    Ok(())
}
